//! Physical endpoint addresses and their wire serialization.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::buffer::Buffer;
use crate::error::ProtocolError;

/// An IP endpoint as carried in protocol fields.
///
/// Wire form is `[type:1]` where type 0 is nil (no further bytes), type 4 is
/// followed by `[ip:4][port:2]` and type 6 by `[ip:16][port:2]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InetAddress {
    /// No address
    #[default]
    Nil,
    /// IPv4 endpoint
    V4(Ipv4Addr, u16),
    /// IPv6 endpoint
    V6(Ipv6Addr, u16),
}

impl InetAddress {
    /// Build an IPv4 endpoint from raw octets.
    pub fn v4(octets: [u8; 4], port: u16) -> Self {
        Self::V4(Ipv4Addr::from(octets), port)
    }

    /// Build an IPv6 endpoint from raw octets.
    pub fn v6(octets: [u8; 16], port: u16) -> Self {
        Self::V6(Ipv6Addr::from(octets), port)
    }

    /// True for the nil endpoint.
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Port, or zero for nil.
    pub fn port(&self) -> u16 {
        match self {
            Self::Nil => 0,
            Self::V4(_, p) | Self::V6(_, p) => *p,
        }
    }

    /// Append the wire form to a buffer. Nil serializes as a single zero.
    pub fn serialize(&self, buf: &mut Buffer) {
        match self {
            Self::Nil => buf.append_u8(0),
            Self::V4(ip, port) => {
                buf.append_u8(4);
                buf.append_bytes(&ip.octets());
                buf.append_u16(*port);
            }
            Self::V6(ip, port) => {
                buf.append_u8(6);
                buf.append_bytes(&ip.octets());
                buf.append_u16(*port);
            }
        }
    }

    /// Decode from `buf` at `off`, returning the address and consumed length.
    pub fn deserialize(buf: &Buffer, off: usize) -> Result<(Self, usize), ProtocolError> {
        match buf.u8_at(off)? {
            0 => Ok((Self::Nil, 1)),
            4 => {
                let b = buf.bytes_at(off + 1, 4)?;
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                let port = buf.u16_at(off + 5)?;
                Ok((Self::V4(ip, port), 7))
            }
            6 => {
                let b = buf.bytes_at(off + 1, 16)?;
                let mut o = [0u8; 16];
                o.copy_from_slice(b);
                let port = buf.u16_at(off + 17)?;
                Ok((Self::V6(Ipv6Addr::from(o), port), 19))
            }
            _ => Err(ProtocolError::Malformed),
        }
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "(nil)"),
            Self::V4(ip, port) => write!(f, "{}:{}", ip, port),
            Self::V6(ip, port) => write!(f, "[{}]:{}", ip, port),
        }
    }
}
