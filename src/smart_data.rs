//! Publish/subscribe on top of `Communicator`.
//!
//! Grounded on `original_source/include/smart_data.hh`'s `SmartData<T>`
//! publisher/subscriber pair. spec.md §4.10 describes a single periodic
//! thread per publisher that folds subscriber periods down to their GCD
//! and advances a step counter; this module follows that design directly
//! rather than routing through the more generic `Condition`-keyed
//! registry in `observer.rs` (that registry is the right fit for the raw
//! `EthertypeObserver`/port layer; a publisher's own subscriber-period
//! bookkeeping is simpler as a plain `Vec`).

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use rand::Rng;

use crate::address::{Address, PhysicalAddress, Port, SystemId};
use crate::communicator::Communicator;
use crate::control::ControlType;
use crate::protocol::{Protocol, RecvMessage};

/// How long a publisher with no subscribers yet sleeps between checks.
const IDLE_TICK_MS: u32 = 200;

/// Produces the bytes a `SmartDataPublisher` sends on each scheduled wake.
pub trait Transducer: Send {
    /// Sample the underlying source and serialize the reading.
    fn sense(&mut self) -> Vec<u8>;
}

/// Demo transducer: a uniformly distributed reading in `[low, high)`,
/// serialized as little-endian `f64` bytes.
pub struct RandomRangeTransducer {
    low: f64,
    high: f64,
}

impl RandomRangeTransducer {
    /// A transducer sampling uniformly from `[low, high)`.
    #[must_use]
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }
}

impl Transducer for RandomRangeTransducer {
    fn sense(&mut self) -> Vec<u8> {
        let value: f64 = rand::rng().random_range(self.low..self.high);
        value.to_le_bytes().to_vec()
    }
}

struct Subscriber {
    addr: Address,
    period_ms: u32,
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn broadcast_addr() -> Address {
    Address::new(PhysicalAddress::BROADCAST, SystemId::BROADCAST, Port::BROADCAST)
}

/// Owns a `Transducer` and a periodic background thread that serves any
/// number of subscribers to `unit`, each at its own requested period.
pub struct SmartDataPublisher {
    communicator: Communicator,
    unit: u32,
    transducer: Mutex<Box<dyn Transducer>>,
    subscribers: Mutex<Vec<Subscriber>>,
    running: Mutex<bool>,
    run_cv: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SmartDataPublisher {
    /// Bind `port` on `protocol` and start publishing `unit` readings from
    /// `transducer` to whoever subscribes.
    #[must_use]
    pub fn new(protocol: Arc<Protocol>, port: Port, unit: u32, transducer: Box<dyn Transducer>) -> Arc<Self> {
        let publisher = Arc::new(Self {
            communicator: Communicator::new(protocol, port),
            unit,
            transducer: Mutex::new(transducer),
            subscribers: Mutex::new(Vec::new()),
            running: Mutex::new(true),
            run_cv: Condvar::new(),
            thread: Mutex::new(None),
        });
        publisher.clone().spawn_thread();
        publisher
    }

    /// Number of vehicles currently subscribed, for tests/diagnostics.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("smart data subscriber list mutex poisoned").len()
    }

    /// Stop the publishing thread. Idempotent.
    pub fn stop(&self) {
        {
            let mut running = self.running.lock().expect("smart data running mutex poisoned");
            if !*running {
                return;
            }
            *running = false;
        }
        self.run_cv.notify_all();
        if let Some(h) = self.thread.lock().expect("smart data thread mutex poisoned").take() {
            let _ = h.join();
        }
    }

    fn cancellable_sleep(&self, dur: Duration) -> bool {
        let guard = self.running.lock().expect("smart data running mutex poisoned");
        let (guard, _) = self
            .run_cv
            .wait_timeout_while(guard, dur, |running| *running)
            .expect("smart data running mutex poisoned");
        *guard
    }

    fn drain_subscriptions(&self) {
        while let Some(msg) = self.communicator.try_receive() {
            if msg.ctrl.ty() != ControlType::Subscribe || msg.payload.len() < 8 {
                continue;
            }
            let unit = u32::from_le_bytes(msg.payload[0..4].try_into().expect("slice is 4 bytes"));
            if unit != self.unit {
                continue;
            }
            let period_ms = u32::from_le_bytes(msg.payload[4..8].try_into().expect("slice is 4 bytes"));
            if period_ms == 0 {
                continue;
            }
            let mut subs = self.subscribers.lock().expect("smart data subscriber list mutex poisoned");
            match subs.iter_mut().find(|s| s.addr == msg.origin) {
                Some(existing) => existing.period_ms = period_ms,
                None => {
                    debug!("smart data: unit {unit} gained subscriber at period {period_ms}ms");
                    subs.push(Subscriber { addr: msg.origin, period_ms });
                }
            }
        }
    }

    fn spawn_thread(self: Arc<Self>) {
        let handle = std::thread::spawn(move || {
            let mut step: u64 = 0;
            loop {
                if !*self.running.lock().expect("smart data running mutex poisoned") {
                    break;
                }
                self.drain_subscriptions();

                let tick_ms = {
                    let subs = self.subscribers.lock().expect("smart data subscriber list mutex poisoned");
                    subs.iter().fold(0u32, |acc, s| gcd(acc, s.period_ms))
                };

                if tick_ms == 0 {
                    if !self.cancellable_sleep(Duration::from_millis(u64::from(IDLE_TICK_MS))) {
                        break;
                    }
                    continue;
                }

                if !self.cancellable_sleep(Duration::from_millis(u64::from(tick_ms))) {
                    break;
                }
                step = step.wrapping_add(u64::from(tick_ms));

                let due: Vec<Address> = {
                    let subs = self.subscribers.lock().expect("smart data subscriber list mutex poisoned");
                    subs.iter()
                        .filter(|s| step % u64::from(s.period_ms) == 0)
                        .map(|s| s.addr)
                        .collect()
                };
                if due.is_empty() {
                    continue;
                }

                let sample = self.transducer.lock().expect("smart data transducer mutex poisoned").sense();
                for addr in due {
                    self.communicator.send(addr, ControlType::Publish, &sample);
                }
            }
        });
        *self.thread.lock().expect("smart data thread mutex poisoned") = Some(handle);
    }
}

impl Drop for SmartDataPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Subscribes to `unit` at `period_ms` and exposes the matching publish
/// stream via a blocking/non-blocking receive.
pub struct SmartDataSubscriber {
    communicator: Communicator,
}

impl SmartDataSubscriber {
    /// Bind `port` on `protocol`, broadcast a `SUBSCRIBE` for `unit` at
    /// `period_ms`, and return the bound subscriber.
    #[must_use]
    pub fn new(protocol: Arc<Protocol>, port: Port, unit: u32, period_ms: u32) -> Self {
        let communicator = Communicator::new(protocol, port);
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&unit.to_le_bytes());
        payload.extend_from_slice(&period_ms.to_le_bytes());
        communicator.send(broadcast_addr(), ControlType::Subscribe, &payload);
        Self { communicator }
    }

    /// Block until the next matching publish arrives.
    #[must_use]
    pub fn receive(&self) -> RecvMessage {
        self.communicator.receive()
    }

    /// Non-blocking poll for the next matching publish.
    #[must_use]
    pub fn try_receive(&self) -> Option<RecvMessage> {
        self.communicator.try_receive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::{LoopbackEngine, LoopbackNetwork};
    use crate::engine::shared::SharedEngine;
    use crate::mac::CmacAes128;
    use crate::navigator::StationaryNavigator;
    use crate::topology::{Coordinate, Topology};
    use std::thread;

    fn build(net: &Arc<LoopbackNetwork>, mac: [u8; 6], sys: u32) -> Arc<Protocol> {
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

    struct FixedTransducer(u8);
    impl Transducer for FixedTransducer {
        fn sense(&mut self) -> Vec<u8> {
            vec![self.0]
        }
    }

    #[test]
    fn subscriber_receives_periodic_samples_same_vehicle() {
        let net = LoopbackNetwork::new();
        let protocol = build(&net, [1; 6], 1);

        let publisher = SmartDataPublisher::new(protocol.clone(), Port(50), 7, Box::new(FixedTransducer(42)));
        let subscriber = SmartDataSubscriber::new(protocol.clone(), Port(51), 7, 10);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(publisher.subscriber_count(), 1);

        let msg = subscriber.receive();
        assert_eq!(msg.payload, vec![42]);

        publisher.stop();
    }

    #[test]
    fn mismatched_unit_subscription_is_ignored() {
        let net = LoopbackNetwork::new();
        let protocol = build(&net, [2; 6], 1);

        let publisher = SmartDataPublisher::new(protocol.clone(), Port(60), 1, Box::new(FixedTransducer(9)));
        let _subscriber = SmartDataSubscriber::new(protocol.clone(), Port(61), 2, 10);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(publisher.subscriber_count(), 0);

        publisher.stop();
    }

    #[test]
    fn two_subscribers_fold_to_gcd_tick() {
        let net = LoopbackNetwork::new();
        let protocol = build(&net, [3; 6], 1);

        let publisher = SmartDataPublisher::new(protocol.clone(), Port(70), 3, Box::new(FixedTransducer(5)));
        let sub_a = SmartDataSubscriber::new(protocol.clone(), Port(71), 3, 20);
        let sub_b = SmartDataSubscriber::new(protocol.clone(), Port(72), 3, 30);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(publisher.subscriber_count(), 2);

        assert!(sub_a.try_receive().is_some() || sub_b.try_receive().is_some());
        publisher.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let net = LoopbackNetwork::new();
        let protocol = build(&net, [4; 6], 1);
        let publisher = SmartDataPublisher::new(protocol, Port(80), 1, Box::new(FixedTransducer(0)));
        publisher.stop();
        publisher.stop();
    }
}
