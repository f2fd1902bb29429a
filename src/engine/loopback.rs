//! Test/simulation multiplexer standing in for a real link.
//!
//! spec.md §6 explicitly allows "a compatible user-space packet
//! multiplexer ... as long as header layout is preserved" in place of a
//! raw socket. `LoopbackEngine` is that multiplexer: several engines
//! sharing one `LoopbackNetwork` behave like vehicles within radio range
//! of each other, without root privileges or a real NIC. It ships
//! unconditionally (not `#[cfg(test)]`-gated) so embedding binaries can
//! use it for simulation, the way `original_source/tests/include/
//! navigator_csv.hh` ships a test-only collaborator alongside production
//! code.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::address::PhysicalAddress;
use crate::buffer::Buffer;

use super::Engine;

struct Endpoint {
    inbox: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            inbox: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            callback: Mutex::new(None),
        }
    }

    fn deliver(&self, bytes: Vec<u8>) {
        self.inbox.lock().expect("loopback inbox mutex poisoned").push_back(bytes);
        self.ready.notify_one();
        if let Some(cb) = self.callback.lock().expect("loopback callback mutex poisoned").as_ref() {
            cb();
        }
    }
}

/// A shared "radio neighborhood": `LoopbackEngine`s registered against
/// the same network can reach each other by `PhysicalAddress`, including
/// broadcast.
#[derive(Default)]
pub struct LoopbackNetwork {
    endpoints: Mutex<HashMap<PhysicalAddress, Arc<Endpoint>>>,
}

impl LoopbackNetwork {
    /// An empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// An `Engine` backed by an in-memory `LoopbackNetwork` instead of a
/// socket.
pub struct LoopbackEngine {
    mac: PhysicalAddress,
    network: Arc<LoopbackNetwork>,
    endpoint: Arc<Endpoint>,
}

impl LoopbackEngine {
    /// Join `network` under `mac`. If another engine already registered
    /// under the same address it is replaced (matches a vehicle
    /// reconnecting with the same link address).
    #[must_use]
    pub fn new(network: Arc<LoopbackNetwork>, mac: PhysicalAddress) -> Self {
        let endpoint = Arc::new(Endpoint::new());
        network
            .endpoints
            .lock()
            .expect("loopback network mutex poisoned")
            .insert(mac, endpoint.clone());
        Self {
            mac,
            network,
            endpoint,
        }
    }
}

impl Engine for LoopbackEngine {
    fn mac_address(&self) -> PhysicalAddress {
        self.mac
    }

    fn send(&self, dest: PhysicalAddress, buf: &Buffer) -> i64 {
        let bytes = buf.as_slice().to_vec();
        let len = bytes.len() as i64;
        let endpoints = self.network.endpoints.lock().expect("loopback network mutex poisoned");
        if dest.is_broadcast() {
            for (mac, ep) in endpoints.iter() {
                if *mac != self.mac {
                    ep.deliver(bytes.clone());
                }
            }
        } else if let Some(ep) = endpoints.get(&dest) {
            ep.deliver(bytes);
        }
        len
    }

    fn receive(&self, buf: &mut Buffer) -> i64 {
        let mut inbox = self.endpoint.inbox.lock().expect("loopback inbox mutex poisoned");
        let Some(bytes) = inbox.pop_front() else {
            return 0;
        };
        drop(inbox);
        let n = bytes.len();
        buf.data_mut()[..n].copy_from_slice(&bytes);
        buf.set_size(n);
        n as i64
    }

    fn bind(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.endpoint.callback.lock().expect("loopback callback mutex poisoned") = Some(callback);
    }

    fn stop(&self) {
        *self.endpoint.callback.lock().expect("loopback callback mutex poisoned") = None;
        self.network
            .endpoints
            .lock()
            .expect("loopback network mutex poisoned")
            .remove(&self.mac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    fn make_buf(pool: &BufferPool, data: &[u8]) -> crate::buffer::Handle {
        let mut h = pool.alloc(data.len()).unwrap();
        h.data_mut()[..data.len()].copy_from_slice(data);
        h.set_size(data.len());
        h
    }

    #[test]
    fn unicast_reaches_only_destination() {
        let net = LoopbackNetwork::new();
        let a = LoopbackEngine::new(net.clone(), PhysicalAddress::new([1; 6]));
        let b = LoopbackEngine::new(net.clone(), PhysicalAddress::new([2; 6]));
        let c = LoopbackEngine::new(net.clone(), PhysicalAddress::new([3; 6]));

        let pool = BufferPool::new(2);
        let buf = make_buf(&pool, b"hi");
        a.send(PhysicalAddress::new([2; 6]), &buf);

        let mut rx = pool.alloc(0).unwrap();
        assert_eq!(b.receive(&mut rx), 2);
        let mut rx2 = pool.alloc(0).unwrap();
        assert_eq!(c.receive(&mut rx2), 0);
    }

    #[test]
    fn broadcast_reaches_everyone_but_sender() {
        let net = LoopbackNetwork::new();
        let a = LoopbackEngine::new(net.clone(), PhysicalAddress::new([1; 6]));
        let b = LoopbackEngine::new(net.clone(), PhysicalAddress::new([2; 6]));
        let c = LoopbackEngine::new(net.clone(), PhysicalAddress::new([3; 6]));

        let pool = BufferPool::new(2);
        let buf = make_buf(&pool, b"yo");
        a.send(PhysicalAddress::BROADCAST, &buf);

        let mut rb = pool.alloc(0).unwrap();
        assert_eq!(b.receive(&mut rb), 2);
        let mut rc = pool.alloc(0).unwrap();
        assert_eq!(c.receive(&mut rc), 2);
        let mut ra = pool.alloc(0).unwrap();
        assert_eq!(a.receive(&mut ra), 0);
    }
}
