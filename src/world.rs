//! The signed root-server roster ("world") shared by cooperating peers.

use crate::buffer::Buffer;
use crate::error::ProtocolError;
use crate::identity::{Identity, LocalIdentity};
use crate::inet::InetAddress;

/// A root server entry: its identity and stable physical endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Root {
    /// Root identity
    pub identity: Identity,
    /// Stable endpoints the root listens on
    pub endpoints: Vec<InetAddress>,
}

/// Signed, timestamped roster of root servers scoped by a 64-bit world ID.
///
/// Each peer caches exactly one world. HELLO exchanges compare world IDs and
/// timestamps; a peer with a newer roster for the same world attaches it to
/// its OK(HELLO) so the other side can catch up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct World {
    /// World identifier; zero means "no world"
    pub id: u64,
    /// Roster revision timestamp (milliseconds)
    pub timestamp: u64,
    /// Ed25519 signature over the roster body
    pub signature: [u8; 64],
    /// Root entries
    pub roots: Vec<Root>,
}

impl World {
    /// Build and sign a world with the given signing identity.
    pub fn new_signed(id: u64, timestamp: u64, roots: Vec<Root>, signer: &LocalIdentity) -> Self {
        let mut w = Self { id, timestamp, signature: [0u8; 64], roots };
        let mut body = Buffer::new();
        w.serialize_body(&mut body);
        w.signature = signer.sign(body.as_bytes());
        w
    }

    fn serialize_body(&self, buf: &mut Buffer) {
        buf.append_u64(self.id);
        buf.append_u64(self.timestamp);
        buf.append_u8(self.roots.len() as u8);
        for root in &self.roots {
            root.identity.serialize(buf);
            buf.append_u8(root.endpoints.len() as u8);
            for ep in &root.endpoints {
                ep.serialize(buf);
            }
        }
    }

    /// Append the wire form: `[id:8][timestamp:8][sig:64][roster]`.
    pub fn serialize(&self, buf: &mut Buffer) {
        buf.append_u64(self.id);
        buf.append_u64(self.timestamp);
        buf.append_bytes(&self.signature);
        buf.append_u8(self.roots.len() as u8);
        for root in &self.roots {
            root.identity.serialize(buf);
            buf.append_u8(root.endpoints.len() as u8);
            for ep in &root.endpoints {
                ep.serialize(buf);
            }
        }
    }

    /// Decode from `buf` at `off`, returning the world and consumed length.
    pub fn deserialize(buf: &Buffer, off: usize) -> Result<(Self, usize), ProtocolError> {
        let id = buf.u64_at(off)?;
        let timestamp = buf.u64_at(off + 8)?;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(buf.bytes_at(off + 16, 64)?);
        let root_count = buf.u8_at(off + 80)? as usize;
        let mut ptr = off + 81;
        let mut roots = Vec::with_capacity(root_count);
        for _ in 0..root_count {
            let (identity, consumed) = Identity::deserialize(buf, ptr)?;
            ptr += consumed;
            let ep_count = buf.u8_at(ptr)? as usize;
            ptr += 1;
            let mut endpoints = Vec::with_capacity(ep_count);
            for _ in 0..ep_count {
                let (ep, consumed) = InetAddress::deserialize(buf, ptr)?;
                ptr += consumed;
                endpoints.push(ep);
            }
            roots.push(Root { identity, endpoints });
        }
        Ok((Self { id, timestamp, signature, roots }, ptr - off))
    }
}
