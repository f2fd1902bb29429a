//! Offset-adjusted clock used so PTP corrections never retroactively
//! starve or burst a periodic schedule.
//!
//! Grounded on `original_source/include/sync_engine.hh`'s `SimulatedClock`.
//! The original stores the offset as `uint64_t` and always subtracts it;
//! this crate uses a signed offset so a follower whose clock runs ahead of
//! the leader can still converge (a PTP round can compute either sign of
//! correction).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// `now() = steady_clock::now() - offset`. All periodic schedules are
/// expressed relative to this clock so PTP offset adjustments don't
/// retroactively starve or burst them (spec.md §5, "Timing source").
pub struct SimulatedClock {
    epoch: Instant,
    offset_ns: AtomicI64,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedClock {
    /// A clock with zero offset, epoched at construction time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_ns: AtomicI64::new(0),
        }
    }

    /// Install a new offset, in nanoseconds.
    pub fn set_offset(&self, offset_ns: i64) {
        self.offset_ns.store(offset_ns, Ordering::Release);
    }

    /// Current offset, in nanoseconds.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset_ns.load(Ordering::Acquire)
    }

    /// Nanoseconds since this clock's epoch, offset-adjusted.
    #[must_use]
    pub fn now_ns(&self) -> u64 {
        let elapsed = self.epoch.elapsed().as_nanos() as i64;
        (elapsed - self.offset_ns.load(Ordering::Acquire)).max(0) as u64
    }

    /// Nanoseconds since this clock's epoch, ignoring the installed offset.
    /// A PTP round re-estimates a follower's *total* offset from scratch
    /// each time, so the follower's own send/receive timestamps must come
    /// from the unconditioned hardware clock — folding in whatever offset
    /// is already installed (possibly wrong, and itself the thing being
    /// re-estimated) would contaminate the new estimate.
    #[must_use]
    pub fn raw_now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_shifts_now() {
        let clock = SimulatedClock::new();
        let before = clock.now_ns();
        clock.set_offset(1_000_000);
        let after = clock.now_ns();
        assert!(after <= before + 1); // offset subtracts, so `after` should not jump ahead
    }

    #[test]
    fn default_offset_is_zero() {
        let clock = SimulatedClock::new();
        assert_eq!(clock.offset(), 0);
    }

    #[test]
    fn raw_now_ignores_installed_offset() {
        let clock = SimulatedClock::new();
        clock.set_offset(1_000_000_000);
        assert!(clock.raw_now_ns() < 1_000_000);
        assert_eq!(clock.now_ns(), 0);
    }
}
