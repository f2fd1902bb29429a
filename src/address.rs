//! Link, process, and port addressing.
//!
//! Grounded on `original_source/include/data_frames/ethernet.hh` (MAC
//! address equality/ordering) and
//! `original_source/include/protocols/protocol_commom.hh` (`Address` as a
//! physical address + system id + port triple).

use std::fmt;

/// Six-octet link-layer identifier. Equality is byte-equality; ordering is
/// lexicographic (the derived `Ord` on `[u8; 6]` already is).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(pub [u8; 6]);

impl PhysicalAddress {
    /// The all-ones broadcast address.
    pub const BROADCAST: PhysicalAddress = PhysicalAddress([0xFF; 6]);

    /// The all-zeros address, used as a "no address yet" sentinel.
    pub const ZERO: PhysicalAddress = PhysicalAddress([0; 6]);

    /// Build from six octets.
    #[must_use]
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Whether this is the broadcast address.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Raw octets.
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Process-lifetime-unique identifier for a vehicle. `0` means
/// "cross-vehicle broadcast".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SystemId(pub u32);

impl SystemId {
    /// The distinguished cross-vehicle broadcast id.
    pub const BROADCAST: SystemId = SystemId(0);

    /// Whether this is the broadcast system id.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<u32> for SystemId {
    fn from(v: u32) -> Self {
        SystemId(v)
    }
}

/// 16-bit in-vehicle component identifier. `0xFFFF` means intra-vehicle
/// broadcast.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Port(pub u16);

impl Port {
    /// The distinguished intra-vehicle broadcast port.
    pub const BROADCAST: Port = Port(0xFFFF);

    /// Whether this is the broadcast port.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<u16> for Port {
    fn from(v: u16) -> Self {
        Port(v)
    }
}

/// `(PhysicalAddress, SystemId, Port)`, totally ordered by lexicographic
/// composition in that field order (matches the 6+4+2 byte wire layout).
///
/// Invariant upheld by callers: a message's *source* address has a concrete
/// (non-zero) `PhysicalAddress` and a nonzero `Port`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Address {
    /// Link-layer address of the owning NIC.
    pub mac: PhysicalAddress,
    /// Owning vehicle's system id.
    pub sys: SystemId,
    /// In-vehicle component port.
    pub port: Port,
}

impl Address {
    /// Construct an address.
    #[must_use]
    pub fn new(mac: PhysicalAddress, sys: SystemId, port: Port) -> Self {
        Self { mac, sys, port }
    }

    /// The zero/unset address.
    #[must_use]
    pub fn unset() -> Self {
        Self {
            mac: PhysicalAddress::ZERO,
            sys: SystemId(0),
            port: Port(0),
        }
    }

    /// True unless this is the zero/unset address.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.mac != PhysicalAddress::ZERO || self.port.0 != 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/sys{}/port{}", self.mac, self.sys.0, self.port.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_ordering_is_lexicographic() {
        let a = PhysicalAddress::new([1, 0, 0, 0, 0, 0]);
        let b = PhysicalAddress::new([1, 0, 0, 0, 0, 1]);
        assert!(a < b);
    }

    #[test]
    fn address_ordering_prefers_mac_then_sys_then_port() {
        let mac1 = PhysicalAddress::new([1; 6]);
        let mac2 = PhysicalAddress::new([2; 6]);
        let a = Address::new(mac1, SystemId(5), Port(5));
        let b = Address::new(mac2, SystemId(1), Port(1));
        assert!(a < b);

        let c = Address::new(mac1, SystemId(1), Port(9));
        let d = Address::new(mac1, SystemId(2), Port(0));
        assert!(c < d);
    }

    #[test]
    fn broadcast_constants() {
        assert!(PhysicalAddress::BROADCAST.is_broadcast());
        assert!(SystemId::BROADCAST.is_broadcast());
        assert!(Port::BROADCAST.is_broadcast());
    }
}
