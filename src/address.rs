//! Peer addresses, virtual-Ethernet MACs and multicast group identifiers.

use std::fmt;

use crate::buffer::Buffer;
use crate::error::ProtocolError;

/// 40-bit opaque peer identifier, canonically rendered as 10 hex digits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u64);

impl Address {
    /// Serialized length in bytes.
    pub const LEN: usize = 5;

    /// Build from a numeric value; only the low 40 bits are kept.
    pub fn from_u64(v: u64) -> Self {
        Self(v & 0xff_ffff_ffff)
    }

    /// Build from the first five bytes of `b`.
    pub fn from_bytes(b: &[u8]) -> Result<Self, ProtocolError> {
        if b.len() < Self::LEN {
            return Err(ProtocolError::Truncated);
        }
        let mut v = 0u64;
        for &x in &b[..Self::LEN] {
            v = (v << 8) | u64::from(x);
        }
        Ok(Self(v))
    }

    /// Bounds-checked read from a buffer at `off`.
    pub fn read_from(buf: &Buffer, off: usize) -> Result<Self, ProtocolError> {
        Self::from_bytes(buf.bytes_at(off, Self::LEN)?)
    }

    /// Numeric value (40 bits).
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// Big-endian serialized form.
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let b = self.0.to_be_bytes();
        [b[3], b[4], b[5], b[6], b[7]]
    }

    /// Append the 5-byte form to a buffer.
    pub fn append_to(self, buf: &mut Buffer) {
        buf.append_bytes(&self.to_bytes());
    }

    /// True for the all-zero address.
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// Addresses beginning with 0xff are reserved and never assigned.
    pub fn is_reserved(self) -> bool {
        (self.0 >> 32) == 0xff
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

/// 48-bit Ethernet MAC address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Mac(u64);

impl Mac {
    /// Serialized length in bytes.
    pub const LEN: usize = 6;

    /// Build from a numeric value; only the low 48 bits are kept.
    pub fn from_u64(v: u64) -> Self {
        Self(v & 0xffff_ffff_ffff)
    }

    /// Build from the first six bytes of `b`.
    pub fn from_bytes(b: &[u8]) -> Result<Self, ProtocolError> {
        if b.len() < Self::LEN {
            return Err(ProtocolError::Truncated);
        }
        let mut v = 0u64;
        for &x in &b[..Self::LEN] {
            v = (v << 8) | u64::from(x);
        }
        Ok(Self(v))
    }

    /// Bounds-checked read from a buffer at `off`.
    pub fn read_from(buf: &Buffer, off: usize) -> Result<Self, ProtocolError> {
        Self::from_bytes(buf.bytes_at(off, Self::LEN)?)
    }

    /// The MAC a member device uses on a given network.
    ///
    /// Deterministic in (address, network): first octet is locally
    /// administered and derived from the network ID, the low 40 bits are the
    /// member address, and the middle bits fold in the rest of the network
    /// ID so distinct networks yield distinct MACs for the same member.
    pub fn from_address(addr: Address, nwid: u64) -> Self {
        let mut first = ((nwid & 0xfe) as u8) | 0x02;
        if first == 0x52 {
            // 0x52 collides with a common virtualization OUI
            first = 0x32;
        }
        let mut m = (u64::from(first) << 40) | addr.to_u64();
        m ^= ((nwid >> 8) & 0xff) << 32;
        m ^= ((nwid >> 16) & 0xff) << 24;
        m ^= ((nwid >> 24) & 0xff) << 16;
        m ^= ((nwid >> 32) & 0xff) << 8;
        m ^= (nwid >> 40) & 0xff;
        Self(m)
    }

    /// Numeric value (48 bits).
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// Big-endian serialized form.
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let b = self.0.to_be_bytes();
        [b[2], b[3], b[4], b[5], b[6], b[7]]
    }

    /// Append the 6-byte form to a buffer.
    pub fn append_to(self, buf: &mut Buffer) {
        buf.append_bytes(&self.to_bytes());
    }

    /// True for the all-zero MAC.
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// Group bit of the first octet.
    pub fn is_multicast(self) -> bool {
        (self.0 >> 40) & 0x01 != 0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Multicast group: destination MAC plus 32-bit additional distinguishing
/// information (nonzero only for things like IPv4 ARP-style scoping).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MulticastGroup {
    /// Group MAC address
    pub mac: Mac,
    /// Additional distinguishing information
    pub adi: u32,
}

impl MulticastGroup {
    /// Construct from parts.
    pub fn new(mac: Mac, adi: u32) -> Self {
        Self { mac, adi }
    }
}

impl fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}", self.mac, self.adi)
    }
}
