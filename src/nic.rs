//! NIC: buffer-pool-owning wrapper over an `Engine`, with the
//! receive-dispatch loop and per-Ethertype fan-out.
//!
//! Grounded on spec.md §4.4. The link-header bookkeeping (zeroing,
//! source MAC, Ethertype) only applies to transports that actually carry
//! an Ethernet header on the wire (`RawEngine`, `LoopbackEngine`);
//! `SharedEngine` carries protocol payload only, per spec.md §3's "the
//! in-process transport uses only the protocol payload".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::address::PhysicalAddress;
use crate::buffer::{BufferPool, Handle};
use crate::engine::Engine;
use crate::header::ETHERTYPE;
use crate::stats::Stats;

const LINK_HEADER_LEN: usize = 14; // dst(6) + src(6) + ethertype(2)

/// Registered by the Protocol layer to receive buffers for a given
/// Ethertype. `Ok(())` means the observer took ownership of the buffer
/// and is responsible for eventually freeing it; `Err(buf)` hands the
/// buffer back so the NIC can free it.
pub trait EthertypeObserver: Send + Sync {
    /// Handle an inbound frame already stripped of nothing (the full
    /// wire bytes, link header included when present).
    fn notify(&self, buf: Handle) -> Result<(), Handle>;
}

/// Wraps a `BufferPool` and an `Engine`, running the receive-dispatch
/// loop on the engine's reader thread via `bind`.
pub struct Nic {
    pool: BufferPool,
    engine: Arc<dyn Engine>,
    has_link_header: bool,
    observers: Mutex<HashMap<u16, Arc<dyn EthertypeObserver>>>,
    stats: Arc<Stats>,
}

impl Nic {
    /// Build a NIC over `engine` with a pool of `pool_size` buffers.
    /// `has_link_header` selects whether `alloc`/dispatch manage a
    /// 14-byte Ethernet header (true for `RawEngine`/`LoopbackEngine`,
    /// false for `SharedEngine`).
    #[must_use]
    pub fn new(
        engine: Arc<dyn Engine>,
        pool_size: usize,
        has_link_header: bool,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        let nic = Arc::new(Self {
            pool: BufferPool::new(pool_size),
            engine,
            has_link_header,
            observers: Mutex::new(HashMap::new()),
            stats,
        });
        let dispatch_nic = nic.clone();
        nic.engine.bind(Box::new(move || dispatch_nic.dispatch_once()));
        nic
    }

    /// This NIC's transport's link address.
    #[must_use]
    pub fn mac_address(&self) -> PhysicalAddress {
        self.engine.mac_address()
    }

    /// Byte offset at which protocol header bytes begin within a buffer
    /// this NIC allocated: past the 14-byte link header when one is
    /// carried, `0` otherwise.
    #[must_use]
    pub fn payload_offset(&self) -> usize {
        if self.has_link_header {
            LINK_HEADER_LEN
        } else {
            0
        }
    }

    /// Register `observer` to receive frames carrying `ethertype`.
    pub fn attach(&self, ethertype: u16, observer: Arc<dyn EthertypeObserver>) {
        self.observers
            .lock()
            .expect("nic observer map mutex poisoned")
            .insert(ethertype, observer);
    }

    /// Remove the observer registered for `ethertype`, if any.
    pub fn detach(&self, ethertype: u16) {
        self.observers
            .lock()
            .expect("nic observer map mutex poisoned")
            .remove(&ethertype);
    }

    /// Allocate a buffer sized for `payload_size` bytes of protocol
    /// payload, writing the link header (if any) with this NIC's source
    /// MAC and the fixed Ethertype, destination left zeroed for `send`
    /// to fill in.
    #[must_use]
    pub fn alloc(&self, payload_size: usize) -> Option<Handle> {
        let total = if self.has_link_header {
            LINK_HEADER_LEN + payload_size
        } else {
            payload_size
        };
        let mut handle = self.pool.alloc(total)?;
        if self.has_link_header {
            let mac = self.engine.mac_address().octets();
            let data = handle.data_mut();
            data[0..6].fill(0);
            data[6..12].copy_from_slice(&mac);
            data[12..14].copy_from_slice(&ETHERTYPE.to_be_bytes());
        }
        Some(handle)
    }

    /// Return a buffer to this NIC's pool.
    pub fn free(&self, handle: Handle) {
        self.pool.free(handle);
    }

    /// Send `handle`'s valid-data bytes to `dest`, filling in the link
    /// header's destination field first when this NIC carries one.
    /// Frees `handle` afterwards either way (outbound buffers are always
    /// owned by the sender, per spec.md §3's lifecycle rule).
    pub fn send(&self, mut handle: Handle, dest: PhysicalAddress) -> i64 {
        if self.has_link_header {
            handle.data_mut()[0..6].copy_from_slice(&dest.octets());
        }
        let n = self.engine.send(dest, &handle);
        if n > 0 {
            self.stats.record_tx(n as u64);
        }
        self.pool.free(handle);
        n
    }

    /// Run one iteration of the receive-dispatch loop. Invoked by the
    /// engine's reader thread on each wake; never blocks.
    fn dispatch_once(&self) {
        loop {
            let Some(mut handle) = self.pool.alloc(0) else {
                self.stats.record_rx_drop_pool_exhausted();
                return;
            };
            let n = self.engine.receive(&mut handle);
            if n <= 0 {
                self.pool.free(handle);
                return;
            }
            handle.set_size(n as usize);

            if self.has_link_header {
                let own_mac = self.engine.mac_address().octets();
                if handle.data()[6..12] == own_mac {
                    trace!("nic: dropping self-loop echo");
                    self.stats.record_rx_drop_self_echo();
                    self.pool.free(handle);
                    continue;
                }
            }

            let ethertype = if self.has_link_header {
                u16::from_be_bytes([handle.data()[12], handle.data()[13]])
            } else {
                ETHERTYPE
            };

            let observer = self
                .observers
                .lock()
                .expect("nic observer map mutex poisoned")
                .get(&ethertype)
                .cloned();

            match observer {
                Some(observer) => {
                    self.stats.record_rx(n as u64);
                    if let Err(declined) = observer.notify(handle) {
                        self.pool.free(declined);
                    }
                }
                None => {
                    self.stats.record_rx_drop_no_observer();
                    self.pool.free(handle);
                }
            }
        }
    }
}
