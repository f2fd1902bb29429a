#![warn(missing_docs)]
/*! A V2X (vehicle-to-everything) publish/subscribe messaging substrate.

Each vehicle or roadside unit (RSU) runs one [`protocol::Protocol`],
composing a raw-Ethernet [`engine::Engine`] (cross-vehicle) and an
in-process one (same-vehicle components) behind a common [`nic::Nic`]
buffering/dispatch layer. On top of that sits spatial/MAC-authenticated
filtering, PTP-style clock synchronization and leader election
([`sync_engine`]), RSU-driven key rotation ([`rsu_engine`]), and a
publish/subscribe convenience layer ([`smart_data`]) built on a
port-addressed blocking channel ([`communicator`]).

# Example

```no_run
use std::sync::Arc;
use std::time::Duration;
use v2xnet::address::{PhysicalAddress, SystemId, Port};
use v2xnet::engine::loopback::{LoopbackEngine, LoopbackNetwork};
use v2xnet::engine::shared::SharedEngine;
use v2xnet::mac::CmacAes128;
use v2xnet::navigator::StationaryNavigator;
use v2xnet::protocol::Protocol;
use v2xnet::topology::{Coordinate, Topology};
use v2xnet::communicator::Communicator;
use v2xnet::control::ControlType;

let net = LoopbackNetwork::new();
let mac = PhysicalAddress::new([1, 2, 3, 4, 5, 6]);
let raw = Arc::new(LoopbackEngine::new(net, mac));
let shared = Arc::new(SharedEngine::new(mac, 16));

let protocol = Protocol::new(
    raw,
    shared,
    SystemId(1),
    Topology::new(4, 4, 50.0),
    Box::new(StationaryNavigator(Coordinate::new(0.0, 0.0))),
    Arc::new(CmacAes128),
    Duration::from_secs(1),
    Duration::from_secs(1),
    64,
);

let comm = Communicator::new(protocol.clone(), Port(10));
let dest = v2xnet::address::Address::new(protocol.mac_address(), SystemId(1), Port(10));
comm.send(dest, ControlType::Common, b"hello");
let msg = comm.receive();
assert_eq!(msg.payload, b"hello");
```
*/

pub mod address;
pub mod buffer;
pub mod clock;
pub mod communicator;
pub mod condition;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod header;
pub mod mac;
pub mod navigator;
pub mod nic;
pub mod observer;
pub mod ordered_list;
pub mod protocol;
pub mod rsu_engine;
pub mod smart_data;
pub mod stats;
pub mod sync_engine;
pub mod topology;
