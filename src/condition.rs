//! Publisher/subscriber matching condition.
//!
//! Grounded on `original_source/include/data_frames/cond.hh`. `PartialEq`
//! is intentionally asymmetric: `lhs` is always the condition a `SmartData`
//! instance was registered with, `rhs` is always the condition derived
//! from an incoming message. Do not read this as a reflexive equality —
//! `a == b` and `b == a` disagree by design (Open Question (c), see
//! DESIGN.md).

/// A unit tag plus publish/subscribe role and period, used by the observer
/// registry to decide whether an incoming message matches a registered
/// `SmartData`.
#[derive(Clone, Copy, Debug)]
pub struct Condition {
    /// `true` if this condition belongs to a publisher, `false` if a
    /// subscriber.
    pub is_pub: bool,
    /// Application-defined unit/topic tag.
    pub unit: u32,
    /// Sampling period in milliseconds. `0` for one-shot/non-periodic
    /// conditions (publishers always carry their real period; only a
    /// subscriber's `rhs` period must divide evenly).
    pub period: u32,
}

impl Condition {
    /// Construct a condition.
    #[must_use]
    pub fn new(is_pub: bool, unit: u32, period: u32) -> Self {
        Self {
            is_pub,
            unit,
            period,
        }
    }
}

impl PartialEq for Condition {
    /// `self` (lhs) is the registered `SmartData` condition, `other` (rhs)
    /// is the condition derived from an incoming message.
    ///
    /// Matches when either:
    /// - `self` is a publisher, `other` is a subscriber, same unit; or
    /// - `self` is a subscriber, `other` is a publisher, same unit, and the
    ///   publisher's period is an integer multiple of the subscriber's.
    fn eq(&self, other: &Self) -> bool {
        if self.is_pub && !other.is_pub && self.unit == other.unit {
            true
        } else {
            !self.is_pub
                && other.is_pub
                && self.unit == other.unit
                && self.period != 0
                && other.period % self.period == 0
        }
    }
}

impl Eq for Condition {}

impl PartialOrd for Condition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Condition {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.period.cmp(&other.period)
    }
}
