//! End-to-end scenarios built on `LoopbackEngine`, following spec.md §8's
//! seed scenarios (S1-S6).

use std::sync::Arc;
use std::time::Duration;

use v2xnet::address::{Address, PhysicalAddress, Port, SystemId};
use v2xnet::communicator::Communicator;
use v2xnet::control::ControlType;
use v2xnet::engine::loopback::{LoopbackEngine, LoopbackNetwork};
use v2xnet::engine::shared::SharedEngine;
use v2xnet::mac::{CmacAes128, MacEngine, MacKeyEntry};
use v2xnet::navigator::StationaryNavigator;
use v2xnet::protocol::Protocol;
use v2xnet::smart_data::{RandomRangeTransducer, SmartDataPublisher, SmartDataSubscriber};
use v2xnet::topology::{Coordinate, Topology};

fn vehicle(net: &Arc<LoopbackNetwork>, mac: u8, sys: u32) -> Arc<Protocol> {
    let addr = PhysicalAddress::new([mac; 6]);
    let raw = Arc::new(LoopbackEngine::new(net.clone(), addr));
    let shared = Arc::new(SharedEngine::new(addr, 32));
    Protocol::new(
        raw,
        shared,
        SystemId(sys),
        Topology::new(4, 4, 50.0),
        Box::new(StationaryNavigator(Coordinate::new(0.0, 0.0))),
        Arc::new(CmacAes128),
        Duration::from_millis(20),
        Duration::from_millis(20),
        32,
    )
}

fn share_quadrant_key(vehicles: &[Arc<Protocol>], seed: u64) {
    let quadrant = vehicles[0].topology().quadrant_id(Coordinate::new(0.0, 0.0));
    let key = CmacAes128.gen_key(seed);
    for v in vehicles {
        v.install_mac_key(MacKeyEntry { id: quadrant, bytes: key });
    }
}

/// S1: single-vehicle ping-pong between two `Communicator`s.
#[test]
fn s1_single_vehicle_ping_pong() {
    let net = LoopbackNetwork::new();
    let vehicle = vehicle(&net, 1, 1);

    let p = Communicator::new(vehicle.clone(), Port(11));
    let q = Communicator::new(vehicle.clone(), Port(10));

    let dest = Address::new(vehicle.mac_address(), SystemId(1), Port(11));
    for i in 0..100u8 {
        q.send(dest, ControlType::Common, &[i; 256]);
    }
    for i in 0..100u8 {
        let msg = p.receive();
        assert_eq!(msg.payload, vec![i; 256]);
    }
}

/// S2: two-vehicle publish/subscribe over the raw link, MAC-authenticated.
#[test]
fn s2_two_vehicle_publish_subscribe() {
    let net = LoopbackNetwork::new();
    let a = vehicle(&net, 10, 100);
    let b = vehicle(&net, 20, 200);
    share_quadrant_key(&[a.clone(), b.clone()], 1);

    let unit = 42;
    let _publisher = SmartDataPublisher::new(a, Port(10), unit, Box::new(RandomRangeTransducer::new(0.0, 255.0)));
    let subscriber = SmartDataSubscriber::new(b, Port(11), unit, 5);

    let deadline = std::time::Instant::now() + Duration::from_millis(400);
    let mut received = 0;
    while std::time::Instant::now() < deadline {
        if let Some(msg) = subscriber.try_receive() {
            assert_eq!(msg.origin.sys, SystemId(100));
            received += 1;
        } else {
            std::thread::sleep(Duration::from_millis(2));
        }
    }
    assert!(received >= 30, "expected at least 30 samples in 400ms at a 5ms period, got {received}");
}

/// S3: five broadcasters, five receivers, no duplicates or drops.
#[test]
fn s3_broadcast_neighborhood() {
    let net = LoopbackNetwork::new();
    let senders: Vec<_> = (0..5).map(|i| vehicle(&net, 100 + i, 1000 + u32::from(i))).collect();
    let receivers: Vec<_> = (0..5).map(|i| vehicle(&net, 150 + i, 2000 + u32::from(i))).collect();

    let mut all: Vec<Arc<Protocol>> = senders.clone();
    all.extend(receivers.clone());
    share_quadrant_key(&all, 2);

    let inboxes: Vec<_> = receivers.iter().map(|r| r.attach_port(Port(77))).collect();

    let broadcast = Address::new(PhysicalAddress::BROADCAST, SystemId::BROADCAST, Port::BROADCAST);
    for (i, sender) in senders.iter().enumerate() {
        for j in 0..5u8 {
            sender.send(Port(9), broadcast, ControlType::Publish, &[i as u8, j, 0, 0, 0]);
        }
    }

    std::thread::sleep(Duration::from_millis(100));

    for inbox in &inboxes {
        let mut count = 0;
        let mut seen = std::collections::HashSet::new();
        while let Some(msg) = inbox.try_updated() {
            assert!(seen.insert((msg.payload[0], msg.payload[1])), "duplicate delivery");
            count += 1;
        }
        assert_eq!(count, 25, "each receiver should see exactly one copy of every send");
    }
}

/// S4: leader election re-stabilizes after the current leader stops.
#[test]
fn s4_leader_election_and_reelection() {
    let net = LoopbackNetwork::new();
    let v1 = vehicle(&net, 1, 1);
    let v2 = vehicle(&net, 2, 2);
    let v3 = vehicle(&net, 3, 3);
    let v4 = vehicle(&net, 4, 4);

    std::thread::sleep(Duration::from_millis(60));
    assert!(v1.sync_engine().is_leader());
    assert!(!v2.sync_engine().is_leader());

    drop(v1);
    std::thread::sleep(Duration::from_millis(60));
    assert!(v2.sync_engine().is_leader());

    drop(v2);
    drop(v3);
    drop(v4);
}

/// S5: a follower with a large initial offset converges after a few PTP
/// rounds with an unsynchronized-offset leader.
#[test]
fn s5_ptp_convergence() {
    let net = LoopbackNetwork::new();
    let leader = vehicle(&net, 1, 1);
    let follower = vehicle(&net, 2, 2);

    follower.sync_engine().clock().set_offset(500_000_000);

    std::thread::sleep(Duration::from_millis(400));

    assert!(leader.sync_engine().is_leader());
    assert!(follower.sync_engine().synchronized());
    assert!(
        follower.sync_engine().clock().offset().abs() < 1_000_000,
        "offset did not converge: {}",
        follower.sync_engine().clock().offset()
    );
}

/// S6: a frame authenticated under a key outside the receiver's installed
/// set is rejected and never reaches an observer.
#[test]
fn s6_mac_rejected_foreign_publisher() {
    let net = LoopbackNetwork::new();
    let attacker = vehicle(&net, 1, 1);
    let victim = vehicle(&net, 2, 2);

    let quadrant = victim.topology().quadrant_id(Coordinate::new(0.0, 0.0));
    let foreign_key = CmacAes128.gen_key(999);
    let local_key = CmacAes128.gen_key(111);
    attacker.install_mac_key(MacKeyEntry { id: quadrant, bytes: foreign_key });
    victim.install_mac_key(MacKeyEntry { id: quadrant, bytes: local_key });

    let inbox = victim.attach_port(Port(5));
    let dest = Address::new(victim.mac_address(), SystemId(2), Port(5));
    attacker.send(Port(6), dest, ControlType::Common, b"forged");

    std::thread::sleep(Duration::from_millis(30));
    assert!(inbox.try_updated().is_none());
    assert_eq!(victim.stats().rx_drop_mac_failed(), 1);

    attacker.sync_engine().stop();
    victim.sync_engine().stop();
}
