//! The pub/sub wire protocol: dual-transport send routing, address/MAC
//! filtering, and per-port fan-out.
//!
//! Grounded on `original_source/include/protocols/protocol_commom.hh`'s
//! `ProtocolCommom<SocketNIC, SharedMemNIC, Navigator>`. The REDESIGN FLAG
//! in spec.md §9 drops the original's template parameterization: both
//! NICs are already erased behind `Arc<dyn Engine>` inside `Nic`, so this
//! module is an ordinary (non-generic) struct composing two `Nic`s, a
//! `SyncEngine`, and a key store.
//!
//! `Protocol` and `SyncEngine` reference each other (`SyncEngine` must be
//! able to emit control traffic through `Protocol`'s raw NIC); rather than
//! a cyclic `Arc`, `Protocol` is built with `Arc::new_cyclic` and hands
//! `SyncEngine` only a `Weak<dyn SyncTransport>`, matching spec.md's
//! design note that ancillary threads must never keep the stack alive
//! past its own shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::address::{Address, PhysicalAddress, Port, SystemId};
use crate::buffer::Handle;
use crate::condition::Condition;
use crate::control::{Control, ControlType};
use crate::engine::Engine;
use crate::header::{FullHeader, LiteHeader, ETHERTYPE};
use crate::mac::{decode_mac_entries, encode_mac_entries, KeyKeeper, MacEngine, MacKeyEntry};
use crate::navigator::Navigator;
use crate::nic::{EthertypeObserver, Nic};
use crate::observer::ConcurrentObserver;
use crate::stats::Stats;
use crate::sync_engine::{PtpAction, SyncEngine, SyncTransport};
use crate::topology::{Coordinate, Topology};

/// Reserved port used for `SyncEngine`/`RSUEngine` administrative traffic.
/// No application `Communicator` may bind it.
pub const CONTROL_PORT: Port = Port(0);

const MAX_DEDUP_ENTRIES: usize = 256;

/// A fully-decoded inbound application message, handed to whichever
/// `Communicator` (or `SmartData`) is bound to its destination port.
#[derive(Clone, Debug)]
pub struct RecvMessage {
    /// Sender's address.
    pub origin: Address,
    /// Destination address this message was addressed to (possibly a
    /// broadcast port/system).
    pub dest: Address,
    /// Decoded control byte.
    pub ctrl: Control,
    /// Sender's position at send time, when known (cross-vehicle frames
    /// only; `None` for same-vehicle `LiteHeader` traffic).
    pub coord: Option<Coordinate>,
    /// PTP-adjusted send timestamp, when known.
    pub timestamp: Option<u64>,
    /// Application payload bytes.
    pub payload: Vec<u8>,
}

fn admin_control_type(ty: ControlType) -> bool {
    !matches!(ty, ControlType::Common | ControlType::Publish | ControlType::Subscribe)
}

/// Composes a raw-link `Nic` and an in-process `Nic` into one addressable
/// vehicle-wide pub/sub substrate.
pub struct Protocol {
    raw_nic: Arc<Nic>,
    shared_nic: Arc<Nic>,
    sys: SystemId,
    navigator: Mutex<Box<dyn Navigator>>,
    topology: Topology,
    mac_engine: Arc<dyn MacEngine>,
    key_keeper: Mutex<KeyKeeper>,
    sync_engine: Arc<SyncEngine>,
    ports: Mutex<HashMap<Port, Arc<ConcurrentObserver<RecvMessage>>>>,
    stats: Arc<Stats>,
    seen_broadcasts: Mutex<VecDeque<(Address, u64)>>,
}

struct NicSide {
    protocol: Weak<Protocol>,
    from_raw: bool,
}

impl EthertypeObserver for NicSide {
    fn notify(&self, buf: Handle) -> Result<(), Handle> {
        match self.protocol.upgrade() {
            Some(protocol) => {
                protocol.handle_frame(buf, self.from_raw);
                Ok(())
            }
            None => Err(buf),
        }
    }
}

impl Protocol {
    /// Compose `raw_engine` (cross-vehicle transport) and `shared_engine`
    /// (in-process mailbox) into one `Protocol` for vehicle `sys`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raw_engine: Arc<dyn Engine>,
        shared_engine: Arc<dyn Engine>,
        sys: SystemId,
        topology: Topology,
        navigator: Box<dyn Navigator>,
        mac_engine: Arc<dyn MacEngine>,
        announce_period: Duration,
        leader_period: Duration,
        buffer_pool_size: usize,
    ) -> Arc<Self> {
        let stats = Arc::new(Stats::default());
        let clock = Arc::new(crate::clock::SimulatedClock::new());

        let protocol = Arc::new_cyclic(|weak: &Weak<Protocol>| {
            let raw_nic = Nic::new(raw_engine, buffer_pool_size, true, stats.clone());
            let shared_nic = Nic::new(shared_engine, buffer_pool_size, false, stats.clone());
            let transport: Weak<dyn SyncTransport> = weak.clone();
            let sync_engine = SyncEngine::new(transport, sys, clock, announce_period, leader_period);

            Protocol {
                raw_nic,
                shared_nic,
                sys,
                navigator: Mutex::new(navigator),
                topology,
                mac_engine,
                key_keeper: Mutex::new(KeyKeeper::new()),
                sync_engine,
                ports: Mutex::new(HashMap::new()),
                stats,
                seen_broadcasts: Mutex::new(VecDeque::new()),
            }
        });

        let raw_observer: Arc<dyn EthertypeObserver> = Arc::new(NicSide {
            protocol: Arc::downgrade(&protocol),
            from_raw: true,
        });
        let shared_observer: Arc<dyn EthertypeObserver> = Arc::new(NicSide {
            protocol: Arc::downgrade(&protocol),
            from_raw: false,
        });
        protocol.raw_nic.attach(ETHERTYPE, raw_observer);
        protocol.shared_nic.attach(ETHERTYPE, shared_observer);

        protocol
    }

    /// This vehicle's system id.
    #[must_use]
    pub fn sys(&self) -> SystemId {
        self.sys
    }

    /// This vehicle's link-layer address (shared across both transports).
    #[must_use]
    pub fn mac_address(&self) -> PhysicalAddress {
        self.raw_nic.mac_address()
    }

    /// The PTP clock-sync/leader-election engine.
    #[must_use]
    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync_engine
    }

    /// The RSU grid this vehicle/RSU is positioned within.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Traffic/drop counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Current position, as reported by the configured `Navigator`.
    #[must_use]
    pub fn location(&self) -> Coordinate {
        self.navigator.lock().expect("navigator mutex poisoned").location()
    }

    /// Install (or replace) a MAC key for `entry.id`'s quadrant. Used both
    /// by an `RSUEngine` broadcasting its own keys and by the receive
    /// path processing an incoming `MAC` control message.
    pub fn install_mac_key(&self, entry: MacKeyEntry) {
        self.key_keeper.lock().expect("key keeper mutex poisoned").install(entry);
    }

    /// Look up the currently installed key for `quadrant`, if any.
    #[must_use]
    pub fn key_for(&self, quadrant: i32) -> Option<MacKeyEntry> {
        self.key_keeper.lock().expect("key keeper mutex poisoned").get(quadrant).copied()
    }

    /// Bind `port` to a fresh message queue; returns the queue so a
    /// `Communicator`/`SmartData` can block on it. Panics are never used
    /// for a conflicting rebind: the previous queue is simply replaced.
    pub fn attach_port(&self, port: Port) -> Arc<ConcurrentObserver<RecvMessage>> {
        let observer = Arc::new(ConcurrentObserver::new());
        self.ports
            .lock()
            .expect("protocol port registry mutex poisoned")
            .insert(port, observer.clone());
        observer
    }

    /// Unbind `port`.
    pub fn detach_port(&self, port: Port) {
        self.ports
            .lock()
            .expect("protocol port registry mutex poisoned")
            .remove(&port);
    }

    /// Send `payload` as a `ctrl_type` message from `from_port` to `to`.
    /// Routing (spec.md §4.6):
    /// - Administrative types (`ANNOUNCE`/`PTP`/`DELAY_RESP`/`LATE_SYNC`/
    ///   `MAC`) always travel on the raw link with a `FullHeader`.
    /// - Application types (`COMMON`/`PUBLISH`/`SUBSCRIBE`) broadcast on
    ///   both transports; a same-vehicle unicast uses only the in-process
    ///   mailbox (`LiteHeader`); a cross-vehicle unicast uses only the raw
    ///   link (`FullHeader`, MAC-tagged).
    ///
    /// Returns the larger of the two transports' results when both are
    /// used, or the single transport's result otherwise; a negative value
    /// means every attempted transport failed.
    pub fn send(&self, from_port: Port, to: Address, ctrl_type: ControlType, payload: &[u8]) -> i64 {
        let origin = Address::new(self.mac_address(), self.sys, from_port);
        let ctrl = Control::new(ctrl_type, self.sync_engine.synchronized(), self.sync_engine.needs_sync());

        if admin_control_type(ctrl_type) {
            return self.send_full(origin, to, ctrl, payload, None);
        }

        if to.sys.is_broadcast() {
            let n1 = self.send_full(origin, to, ctrl, payload, None);
            let n2 = self.send_lite(origin, to, ctrl, payload);
            n1.max(n2)
        } else if to.sys == self.sys {
            self.send_lite(origin, to, ctrl, payload)
        } else {
            self.send_full(origin, to, ctrl, payload, None)
        }
    }

    /// Broadcast an RSU key-rotation batch. Always raw-link, never
    /// MAC-tagged (keys authenticate everything *except* themselves).
    pub fn broadcast_keys(&self, from_port: Port, entries: &[MacKeyEntry]) -> i64 {
        let payload = encode_mac_entries(entries);
        let to = Address::new(PhysicalAddress::BROADCAST, SystemId::BROADCAST, Port::BROADCAST);
        self.send(from_port, to, ControlType::Mac, &payload)
    }

    fn send_full(&self, origin: Address, dest: Address, ctrl: Control, payload: &[u8], depart_ts: Option<u64>) -> i64 {
        let total = FullHeader::WIRE_LEN + payload.len();
        let Some(mut handle) = self.raw_nic.alloc(total) else {
            warn!("protocol: raw NIC pool exhausted on send");
            return -1;
        };

        let coord = self.location();
        let timestamp = depart_ts.unwrap_or_else(|| self.sync_engine.timestamp_now());
        let mut header = FullHeader {
            lite: LiteHeader {
                origin,
                dest,
                ctrl,
                payload_size: payload.len() as u32,
            },
            coord_x: coord.x,
            coord_y: coord.y,
            timestamp,
            tag: [0u8; 16],
        };

        if matches!(ctrl.ty(), ControlType::Common | ControlType::Publish | ControlType::Subscribe) {
            let quadrant = self.topology.quadrant_id(coord);
            let key = self
                .key_keeper
                .lock()
                .expect("key keeper mutex poisoned")
                .get(quadrant)
                .map(MacKeyEntry::aes_key);
            if let Some(key) = key {
                let mut message = header.to_bytes();
                message.extend_from_slice(payload);
                header.tag = self.mac_engine.compute(&key, &message);
            } else {
                debug!("protocol: no MAC key installed for quadrant {quadrant}, sending unauthenticated");
            }
        }

        let off = self.raw_nic.payload_offset();
        let bytes = header.to_bytes();
        write_payload(&mut handle, off, &bytes, payload);
        self.raw_nic.send(handle, dest.mac)
    }

    fn send_lite(&self, origin: Address, dest: Address, ctrl: Control, payload: &[u8]) -> i64 {
        let total = LiteHeader::WIRE_LEN + payload.len();
        let Some(mut handle) = self.shared_nic.alloc(total) else {
            warn!("protocol: shared NIC pool exhausted on send");
            return -1;
        };

        let header = LiteHeader {
            origin,
            dest,
            ctrl,
            payload_size: payload.len() as u32,
        };
        let off = self.shared_nic.payload_offset();
        let bytes = header.to_bytes();
        write_payload(&mut handle, off, &bytes, payload);
        self.shared_nic.send(handle, PhysicalAddress::ZERO)
    }

    fn handle_frame(self: &Arc<Self>, buf: Handle, from_raw: bool) {
        let off = if from_raw { self.raw_nic.payload_offset() } else { self.shared_nic.payload_offset() };
        let data = &buf.as_slice()[off..];

        if from_raw {
            let Some(full) = FullHeader::from_bytes(data) else {
                warn!("protocol: malformed FullHeader, dropping");
                self.raw_nic.free(buf);
                return;
            };
            let payload = data[FullHeader::WIRE_LEN..].to_vec();
            self.raw_nic.free(buf);
            self.handle_full(full, payload);
        } else {
            let Some(lite) = LiteHeader::from_bytes(data) else {
                warn!("protocol: malformed LiteHeader, dropping");
                self.shared_nic.free(buf);
                return;
            };
            let payload = data[LiteHeader::WIRE_LEN..].to_vec();
            self.shared_nic.free(buf);
            self.handle_lite(lite, payload);
        }
    }

    fn handle_full(&self, full: FullHeader, payload: Vec<u8>) {
        let origin = full.lite.origin;
        let dest = full.lite.dest;
        let ctrl = full.lite.ctrl;

        match ctrl.ty() {
            ControlType::Announce => self.sync_engine.handle_announce(origin.sys),
            ControlType::Ptp => self.dispatch_ptp_action(self.sync_engine.handle_ptp_sync(origin, full.timestamp)),
            ControlType::DelayResp | ControlType::LateSync => {
                self.dispatch_ptp_action(self.sync_engine.handle_delay_resp(&payload));
            }
            ControlType::Mac => {
                for entry in decode_mac_entries(&payload) {
                    self.install_mac_key(entry);
                }
            }
            ControlType::Common | ControlType::Publish | ControlType::Subscribe => {
                if !dest.sys.is_broadcast() && dest.sys != self.sys {
                    self.stats.record_rx_drop_wrong_system();
                    return;
                }
                if dest.port.is_broadcast() && self.dedup_broadcast(origin, full.timestamp) {
                    return;
                }
                let coord = Coordinate::new(full.coord_x, full.coord_y);
                let quadrant = self.topology.quadrant_id(coord);
                let key = self
                    .key_keeper
                    .lock()
                    .expect("key keeper mutex poisoned")
                    .get(quadrant)
                    .map(MacKeyEntry::aes_key);
                let verified = match key {
                    Some(key) => {
                        let mut message = full.to_bytes();
                        let tag_off = message.len() - 16;
                        message[tag_off..].fill(0);
                        message.extend_from_slice(&payload);
                        self.mac_engine.verify(&key, &message, &full.tag)
                    }
                    None => false,
                };
                if !verified {
                    self.stats.record_rx_drop_mac_failed();
                    return;
                }
                self.dispatch(
                    dest.port,
                    RecvMessage {
                        origin,
                        dest,
                        ctrl,
                        coord: Some(coord),
                        timestamp: Some(full.timestamp),
                        payload,
                    },
                );
            }
        }
    }

    fn handle_lite(&self, lite: LiteHeader, payload: Vec<u8>) {
        let origin = lite.origin;
        let dest = lite.dest;
        if !dest.sys.is_broadcast() && dest.sys != self.sys {
            self.stats.record_rx_drop_wrong_system();
            return;
        }
        self.dispatch(
            dest.port,
            RecvMessage {
                origin,
                dest,
                ctrl: lite.ctrl,
                coord: None,
                timestamp: None,
                payload,
            },
        );
    }

    fn dispatch_ptp_action(&self, action: PtpAction) {
        match action {
            PtpAction::DoNothing => {}
            PtpAction::SendDelayReq { to, depart_ts } => {
                let origin = Address::new(self.mac_address(), self.sys, CONTROL_PORT);
                let ctrl = Control::new(ControlType::Ptp, self.sync_engine.synchronized(), self.sync_engine.needs_sync());
                self.send_full(origin, to, ctrl, &[], Some(depart_ts));
            }
            PtpAction::SendDelayResp { to, t_leader_recvd, relate_to } => {
                let origin = Address::new(self.mac_address(), self.sys, CONTROL_PORT);
                let ctrl = Control::new(ControlType::DelayResp, self.sync_engine.synchronized(), self.sync_engine.needs_sync());
                let mut payload = Vec::with_capacity(16);
                payload.extend_from_slice(&t_leader_recvd.to_le_bytes());
                payload.extend_from_slice(&relate_to.to_le_bytes());
                self.send_full(origin, to, ctrl, &payload, None);
            }
        }
    }

    fn dedup_broadcast(&self, origin: Address, timestamp: u64) -> bool {
        let mut seen = self.seen_broadcasts.lock().expect("dedup cache mutex poisoned");
        if seen.iter().any(|(o, t)| *o == origin && *t == timestamp) {
            return true;
        }
        seen.push_back((origin, timestamp));
        if seen.len() > MAX_DEDUP_ENTRIES {
            seen.pop_front();
        }
        false
    }

    fn dispatch(&self, dest_port: Port, msg: RecvMessage) {
        let ports = self.ports.lock().expect("protocol port registry mutex poisoned");
        if dest_port.is_broadcast() {
            for observer in ports.values() {
                observer.update(&Condition::new(false, 0, 0), msg.clone());
            }
        } else if let Some(observer) = ports.get(&dest_port) {
            observer.update(&Condition::new(false, 0, 0), msg);
        } else {
            drop(ports);
            self.stats.record_rx_drop_wrong_port();
        }
    }
}

impl SyncTransport for Protocol {
    fn my_addr(&self) -> Address {
        Address::new(self.mac_address(), self.sys, CONTROL_PORT)
    }

    fn broadcast_addr(&self) -> Address {
        Address::new(PhysicalAddress::BROADCAST, SystemId::BROADCAST, Port::BROADCAST)
    }

    fn send_ptp(&self, to: Address, ctrl_type: ControlType, payload: &[u8], depart_ts: Option<u64>) {
        let origin = self.my_addr();
        let ctrl = Control::new(ctrl_type, self.sync_engine.synchronized(), self.sync_engine.needs_sync());
        self.send_full(origin, to, ctrl, payload, depart_ts);
    }
}

fn write_payload(handle: &mut Handle, off: usize, header_bytes: &[u8], payload: &[u8]) {
    let data = handle.data_mut();
    data[off..off + header_bytes.len()].copy_from_slice(header_bytes);
    data[off + header_bytes.len()..off + header_bytes.len() + payload.len()].copy_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::{LoopbackEngine, LoopbackNetwork};
    use crate::engine::shared::SharedEngine;
    use crate::mac::CmacAes128;
    use crate::navigator::StationaryNavigator;
    use std::thread;
    use std::time::Duration;

    fn build(
        net: &Arc<LoopbackNetwork>,
        mac: [u8; 6],
        sys: u32,
    ) -> Arc<Protocol> {
        let raw = Arc::new(LoopbackEngine::new(net.clone(), PhysicalAddress::new(mac)));
        let shared = Arc::new(SharedEngine::new(PhysicalAddress::new(mac), 16));
        Protocol::new(
            raw,
            shared,
            SystemId(sys),
            Topology::new(4, 4, 50.0),
            Box::new(StationaryNavigator(Coordinate::new(0.0, 0.0))),
            Arc::new(CmacAes128),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            16,
        )
    }

    #[test]
    fn same_vehicle_unicast_uses_shared_mailbox_only() {
        let net = LoopbackNetwork::new();
        let p = build(&net, [9; 6], 1);
        let port_a = Port(10);
        let port_b = Port(11);
        let inbox_b = p.attach_port(port_b);

        let dest = Address::new(p.mac_address(), SystemId(1), port_b);
        p.send(port_a, dest, ControlType::Common, b"hi");

        let msg = inbox_b.updated();
        assert_eq!(msg.payload, b"hi");
        assert!(msg.coord.is_none());
    }

    #[test]
    fn cross_vehicle_unicast_requires_matching_mac_key() {
        let net = LoopbackNetwork::new();
        let a = build(&net, [1; 6], 1);
        let b = build(&net, [2; 6], 2);

        let port_a = Port(20);
        let port_b = Port(21);
        let inbox_b = b.attach_port(port_b);

        let dest = Address::new(b.mac_address(), SystemId(2), port_b);
        a.send(port_a, dest, ControlType::Common, b"unauthenticated");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(inbox_b.try_updated(), None);
        assert_eq!(b.stats().rx_drop_mac_failed(), 1);

        let quadrant = b.topology().quadrant_id(Coordinate::new(0.0, 0.0));
        let key = CmacAes128.gen_key(42);
        a.install_mac_key(MacKeyEntry { id: quadrant, bytes: key });
        b.install_mac_key(MacKeyEntry { id: quadrant, bytes: key });

        a.send(port_a, dest, ControlType::Common, b"authenticated");
        thread::sleep(Duration::from_millis(20));
        let msg = inbox_b.updated();
        assert_eq!(msg.payload, b"authenticated");
        assert!(msg.coord.is_some());
    }

    #[test]
    fn broadcast_with_no_subscribers_records_wrong_port_drop() {
        let net = LoopbackNetwork::new();
        let a = build(&net, [3; 6], 1);
        let b = build(&net, [4; 6], 2);

        let quadrant = b.topology().quadrant_id(Coordinate::new(0.0, 0.0));
        let key = CmacAes128.gen_key(7);
        a.install_mac_key(MacKeyEntry { id: quadrant, bytes: key });
        b.install_mac_key(MacKeyEntry { id: quadrant, bytes: key });

        let broadcast = Address::new(PhysicalAddress::BROADCAST, SystemId::BROADCAST, Port::BROADCAST);
        a.send(Port(1), broadcast, ControlType::Publish, b"tick");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(b.stats().rx_drop_wrong_port(), 1);
    }

    #[test]
    fn mac_key_broadcast_installs_keys_on_receivers() {
        let net = LoopbackNetwork::new();
        let a = build(&net, [5; 6], 1);
        let b = build(&net, [6; 6], 2);

        let entries = vec![MacKeyEntry { id: 3, bytes: [0xAB; 32] }];
        a.broadcast_keys(CONTROL_PORT, &entries);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(b.key_keeper.lock().unwrap().get(3).unwrap().bytes, [0xAB; 32]);
    }
}
