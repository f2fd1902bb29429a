//! In-process `Engine`: a bounded mailbox used for same-vehicle traffic.
//!
//! Grounded on spec.md §4.3's "bounded circular mailbox with a
//! bounded-semaphore pair (`empty`/`full`) and a buffer-guard semaphore".
//! `Condvar`-gated `VecDeque`s are this crate's monitor-equivalent
//! construction (§5(e) explicitly allows that substitution), following
//! the teacher's preference for `std::sync::mpsc`-style bounded handoffs
//! (`mtgraph.rs`'s `sync_channel`) over raw semaphores when no signal
//! handler is involved.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::address::PhysicalAddress;
use crate::buffer::Buffer;

use super::{Engine, DEFAULT_BACKLOG};

struct Mailbox {
    queue: VecDeque<(Vec<u8>, i64)>,
    capacity: usize,
}

/// Same-process transport: `send` and `receive` move bytes through a
/// bounded, mutex-and-condvar-guarded queue rather than a socket.
pub struct SharedEngine {
    mac: PhysicalAddress,
    mailbox: Mutex<Mailbox>,
    not_empty: Condvar,
    not_full: Condvar,
    callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl SharedEngine {
    /// Build a mailbox exposing `mac` as its address (normally the
    /// owning vehicle's real link address, so `Address` values compare
    /// equal regardless of which transport a message actually travelled
    /// over) with room for `capacity` in-flight frames.
    #[must_use]
    pub fn new(mac: PhysicalAddress, capacity: usize) -> Self {
        Self {
            mac,
            mailbox: Mutex::new(Mailbox {
                queue: VecDeque::new(),
                capacity,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            callback: Mutex::new(None),
        }
    }

    /// Build a mailbox with room for [`DEFAULT_BACKLOG`] in-flight frames,
    /// for callers with no reason to size it explicitly.
    #[must_use]
    pub fn with_default_backlog(mac: PhysicalAddress) -> Self {
        Self::new(mac, DEFAULT_BACKLOG)
    }

    /// Push a frame and wake one waiting reader, then invoke the bound
    /// callback synchronously (mirroring the raw engine's
    /// signal-then-dispatch sequencing without needing a second thread).
    fn push(&self, bytes: Vec<u8>, receive_time: i64) {
        {
            let mut mailbox = self.mailbox.lock().expect("mailbox mutex poisoned");
            while mailbox.queue.len() >= mailbox.capacity {
                mailbox = self.not_full.wait(mailbox).expect("mailbox mutex poisoned");
            }
            mailbox.queue.push_back((bytes, receive_time));
        }
        self.not_empty.notify_one();
        if let Some(cb) = self.callback.lock().expect("mailbox callback mutex poisoned").as_ref() {
            cb();
        }
    }
}

impl Engine for SharedEngine {
    fn mac_address(&self) -> PhysicalAddress {
        self.mac
    }

    fn send(&self, _dest: PhysicalAddress, buf: &Buffer) -> i64 {
        let bytes = buf.as_slice().to_vec();
        let len = bytes.len() as i64;
        self.push(bytes, 0);
        len
    }

    fn receive(&self, buf: &mut Buffer) -> i64 {
        let mut mailbox = self.mailbox.lock().expect("mailbox mutex poisoned");
        let Some((bytes, receive_time)) = mailbox.queue.pop_front() else {
            return 0;
        };
        drop(mailbox);
        self.not_full.notify_one();
        let n = bytes.len();
        buf.data_mut()[..n].copy_from_slice(&bytes);
        buf.set_size(n);
        buf.set_receive_time(receive_time);
        n as i64
    }

    fn bind(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.callback.lock().expect("mailbox callback mutex poisoned") = Some(callback);
    }

    fn stop(&self) {
        *self.callback.lock().expect("mailbox callback mutex poisoned") = None;
    }
}
