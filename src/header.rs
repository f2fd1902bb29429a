//! Wire headers: `LiteHeader` (in-process) and `FullHeader` (cross-vehicle).
//!
//! Layout grounded on spec.md §6's byte table and
//! `original_source/include/data_frames/`. Integer fields are encoded
//! little-endian throughout (the spec permits host-endian for a
//! homogeneous deployment but mandates little-endian for anything that
//! must standardize, which this crate always does).

use crate::address::{Address, PhysicalAddress, Port, SystemId};
use crate::control::Control;

/// Fixed Ethertype used by this system on the wire.
pub const ETHERTYPE: u16 = 0x88B5;

const ADDRESS_LEN: usize = 12; // 6 (mac) + 4 (sysid) + 2 (port)
const LITE_HEADER_LEN: usize = ADDRESS_LEN * 2 + 1 + 4; // origin+dest+ctrl+payload_size
const FULL_HEADER_LEN: usize = LITE_HEADER_LEN + 8 + 8 + 8 + 16; // + coord_x+coord_y+timestamp+tag

/// 16-byte MAC tag over header-plus-payload.
pub type MacTag = [u8; 16];

fn encode_address(a: &Address, out: &mut Vec<u8>) {
    out.extend_from_slice(&a.mac.octets());
    out.extend_from_slice(&a.sys.0.to_le_bytes());
    out.extend_from_slice(&a.port.0.to_le_bytes());
}

fn decode_address(buf: &[u8]) -> Option<Address> {
    if buf.len() < ADDRESS_LEN {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&buf[0..6]);
    let sys = u32::from_le_bytes(buf[6..10].try_into().ok()?);
    let port = u16::from_le_bytes(buf[10..12].try_into().ok()?);
    Some(Address::new(
        PhysicalAddress::new(mac),
        SystemId(sys),
        Port(port),
    ))
}

/// Header used for in-process (same-vehicle) frames: no link header, no
/// positional/timing trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiteHeader {
    /// Sending component's address.
    pub origin: Address,
    /// Intended recipient's address.
    pub dest: Address,
    /// Packed control byte.
    pub ctrl: Control,
    /// Declared payload length, independent of the carrying buffer's
    /// physical size.
    pub payload_size: u32,
}

impl LiteHeader {
    /// Encoded size in bytes.
    pub const WIRE_LEN: usize = LITE_HEADER_LEN;

    /// Serialize to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        encode_address(&self.origin, &mut out);
        encode_address(&self.dest, &mut out);
        out.push(self.ctrl.0);
        out.extend_from_slice(&self.payload_size.to_le_bytes());
        out
    }

    /// Parse from the front of `buf`. Returns `None` if `buf` is too
    /// short.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < LITE_HEADER_LEN {
            return None;
        }
        let origin = decode_address(&buf[0..ADDRESS_LEN])?;
        let dest = decode_address(&buf[ADDRESS_LEN..ADDRESS_LEN * 2])?;
        let ctrl = Control(buf[ADDRESS_LEN * 2]);
        let payload_size =
            u32::from_le_bytes(buf[ADDRESS_LEN * 2 + 1..ADDRESS_LEN * 2 + 5].try_into().ok()?);
        Some(Self {
            origin,
            dest,
            ctrl,
            payload_size,
        })
    }
}

/// Header used for cross-vehicle frames: extends `LiteHeader` with the
/// sender's position, a PTP-adjusted timestamp, and a MAC tag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FullHeader {
    /// The in-process fields, identical wire layout to `LiteHeader`.
    pub lite: LiteHeader,
    /// Sender's X coordinate at send time.
    pub coord_x: f64,
    /// Sender's Y coordinate at send time.
    pub coord_y: f64,
    /// Nanoseconds since the steady epoch, PTP-adjusted.
    pub timestamp: u64,
    /// Authentication tag over header-plus-payload.
    pub tag: MacTag,
}

impl FullHeader {
    /// Encoded size in bytes.
    pub const WIRE_LEN: usize = FULL_HEADER_LEN;

    /// Serialize to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.lite.to_bytes();
        out.extend_from_slice(&self.coord_x.to_le_bytes());
        out.extend_from_slice(&self.coord_y.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parse from the front of `buf`. Returns `None` if `buf` is too
    /// short.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < FULL_HEADER_LEN {
            return None;
        }
        let lite = LiteHeader::from_bytes(buf)?;
        let mut off = LITE_HEADER_LEN;
        let coord_x = f64::from_le_bytes(buf[off..off + 8].try_into().ok()?);
        off += 8;
        let coord_y = f64::from_le_bytes(buf[off..off + 8].try_into().ok()?);
        off += 8;
        let timestamp = u64::from_le_bytes(buf[off..off + 8].try_into().ok()?);
        off += 8;
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&buf[off..off + 16]);
        Some(Self {
            lite,
            coord_x,
            coord_y,
            timestamp,
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlType;

    fn addr(last: u8, sys: u32, port: u16) -> Address {
        Address::new(
            PhysicalAddress::new([1, 2, 3, 4, 5, last]),
            SystemId(sys),
            Port(port),
        )
    }

    #[test]
    fn lite_header_round_trips_every_control_combination() {
        let types = [
            ControlType::Common,
            ControlType::Publish,
            ControlType::Subscribe,
            ControlType::Announce,
            ControlType::Ptp,
            ControlType::Mac,
            ControlType::DelayResp,
            ControlType::LateSync,
        ];
        for ty in types {
            for sync in [false, true] {
                for needs in [false, true] {
                    let h = LiteHeader {
                        origin: addr(1, 100, 10),
                        dest: addr(2, 200, 11),
                        ctrl: Control::new(ty, sync, needs),
                        payload_size: 256,
                    };
                    let bytes = h.to_bytes();
                    assert_eq!(bytes.len(), LiteHeader::WIRE_LEN);
                    let back = LiteHeader::from_bytes(&bytes).unwrap();
                    assert_eq!(h, back);
                }
            }
        }
    }

    #[test]
    fn full_header_round_trips() {
        let h = FullHeader {
            lite: LiteHeader {
                origin: addr(1, 100, 10),
                dest: Address::new(PhysicalAddress::BROADCAST, SystemId::BROADCAST, Port::BROADCAST),
                ctrl: Control::of(ControlType::Publish),
                payload_size: 4,
            },
            coord_x: 12.5,
            coord_y: -3.25,
            timestamp: 123_456_789,
            tag: [0xAB; 16],
        };
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), FullHeader::WIRE_LEN);
        let back = FullHeader::from_bytes(&bytes).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn from_bytes_rejects_short_input() {
        assert!(LiteHeader::from_bytes(&[0u8; 4]).is_none());
        assert!(FullHeader::from_bytes(&[0u8; LiteHeader::WIRE_LEN]).is_none());
    }
}
