//! Transport endpoints: a send/receive surface shared by the raw link,
//! the in-process mailbox, and the test-only loopback multiplexer.
//!
//! Grounded on spec.md §9's REDESIGN FLAG resolution: one `Engine` trait
//! with multiple implementations in place of the original's
//! `(SocketNIC, SharedMemNIC, Navigator)` template parameterization.
//! Callback binding uses an ordinary `Fn` closure rather than the
//! source's `bind<T, method>(owner)` typed-pointer-plus-trampoline
//! (`original_source/include/engine.hh`), since Rust closures already
//! capture their state safely.

pub mod loopback;
pub mod raw;
pub mod shared;

use crate::address::PhysicalAddress;
use crate::buffer::Buffer;

/// A transport endpoint: either the raw link or the in-process mailbox.
///
/// `receive` is always non-blocking from the caller's perspective: it is
/// invoked from the dedicated reader thread each implementation owns,
/// never from the signal handler itself (§9, "Signal handler safety").
pub trait Engine: Send + Sync {
    /// This endpoint's link-layer address, used so Addresses compare
    /// equal across transports sharing one vehicle.
    fn mac_address(&self) -> PhysicalAddress;

    /// Send the buffer's valid-data bytes to `dest`. Returns the number
    /// of bytes written, or a negative value on a partial/failed send
    /// (recoverable-per-call, per spec.md §7 — callers decide whether to
    /// retry or drop).
    fn send(&self, dest: PhysicalAddress, buf: &Buffer) -> i64;

    /// Fill `buf` with the next available frame. Returns the number of
    /// bytes read; `0` means "nothing available right now"
    /// (`EAGAIN`/`EWOULDBLOCK` map to this, not an error) and is not
    /// itself a drop.
    fn receive(&self, buf: &mut Buffer) -> i64;

    /// Register the callback invoked by this engine's reader thread on
    /// each wake (i.e. each time one or more frames became available).
    /// Replaces any previously bound callback. Not re-entrant: do not
    /// call `bind` from within the callback itself.
    fn bind(&self, callback: Box<dyn Fn() + Send + Sync>);

    /// Stop the reader thread and release transport resources.
    /// Idempotent: a second `stop` is a no-op.
    fn stop(&self);
}

/// Default capacity used by engines that size an internal mailbox/backlog
/// when the caller doesn't specify one explicitly.
pub const DEFAULT_BACKLOG: usize = 64;
