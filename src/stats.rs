//! NIC/Protocol traffic counters.
//!
//! Grounded on spec.md §3's "Stats" addition and §7's drop-reason
//! taxonomy (ethertype mismatch, wrong destination system/port, unit
//! mismatch, MAC failure, self-loop echo, pool exhaustion). This crate
//! only exposes the counters; formatting/printing them is an external
//! collaborator's job (spec.md §1).

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic traffic and drop counters, safe to share behind an `Arc` across
/// the NIC dispatch thread and Protocol/SmartData threads.
#[derive(Default)]
pub struct Stats {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,

    rx_drop_pool_exhausted: AtomicU64,
    rx_drop_self_echo: AtomicU64,
    rx_drop_no_observer: AtomicU64,
    rx_drop_wrong_system: AtomicU64,
    rx_drop_wrong_port: AtomicU64,
    rx_drop_unit_mismatch: AtomicU64,
    rx_drop_mac_failed: AtomicU64,
}

macro_rules! counter_accessors {
    ($(($field:ident, $recorder:ident, $getter:ident)),+ $(,)?) => {
        $(
            #[doc = concat!("Record one occurrence of `", stringify!($field), "`.")]
            pub fn $recorder(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }

            #[doc = concat!("Current value of `", stringify!($field), "`.")]
            #[must_use]
            pub fn $getter(&self) -> u64 {
                self.$field.load(Ordering::Relaxed)
            }
        )+
    };
}

impl Stats {
    /// Record a successful send of `bytes` bytes.
    pub fn record_tx(&self, bytes: u64) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a successful receive of `bytes` bytes.
    pub fn record_rx(&self, bytes: u64) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total packets sent.
    #[must_use]
    pub fn tx_packets(&self) -> u64 {
        self.tx_packets.load(Ordering::Relaxed)
    }

    /// Total bytes sent.
    #[must_use]
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Total packets received and accepted by an observer.
    #[must_use]
    pub fn rx_packets(&self) -> u64 {
        self.rx_packets.load(Ordering::Relaxed)
    }

    /// Total bytes received and accepted by an observer.
    #[must_use]
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    counter_accessors!(
        (rx_drop_pool_exhausted, record_rx_drop_pool_exhausted, rx_drop_pool_exhausted),
        (rx_drop_self_echo, record_rx_drop_self_echo, rx_drop_self_echo),
        (rx_drop_no_observer, record_rx_drop_no_observer, rx_drop_no_observer),
        (rx_drop_wrong_system, record_rx_drop_wrong_system, rx_drop_wrong_system),
        (rx_drop_wrong_port, record_rx_drop_wrong_port, rx_drop_wrong_port),
        (rx_drop_unit_mismatch, record_rx_drop_unit_mismatch, rx_drop_unit_mismatch),
        (rx_drop_mac_failed, record_rx_drop_mac_failed, rx_drop_mac_failed),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let s = Stats::default();
        assert_eq!(s.tx_packets(), 0);
        s.record_tx(100);
        s.record_tx(50);
        assert_eq!(s.tx_packets(), 2);
        assert_eq!(s.tx_bytes(), 150);

        s.record_rx_drop_mac_failed();
        s.record_rx_drop_mac_failed();
        assert_eq!(s.rx_drop_mac_failed(), 2);
    }
}
