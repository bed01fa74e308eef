#![allow(missing_docs)]
//! Certificates of membership for private virtual networks.

use crate::address::Address;
use crate::buffer::Buffer;
use crate::error::ProtocolError;
use crate::identity::{Identity, LocalIdentity};

/// Serialized length of a certificate on the wire.
pub const COM_SERIALIZED_LEN: usize = 8 + 5 + 8 + 8 + 8 + 5 + 64;

// Length of the region covered by the signature.
const COM_SIGNED_LEN: usize = 8 + 5 + 8 + 8 + 8 + 5;

/// Signed admission token proving current membership of a virtual network.
///
/// Two certificates "agree" when they name the same network and their
/// issuance timestamps fall within both sides' tolerance windows, so a peer
/// holding a stale certificate stops agreeing with fresh ones once the
/// controller has moved on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateOfMembership {
    pub network_id: u64,
    pub issued_to: Address,
    pub timestamp: u64,
    pub revision: u64,
    pub max_delta: u64,
    pub signed_by: Address,
    pub signature: [u8; 64],
}

impl CertificateOfMembership {
    /// Issue and sign a certificate with the given controller identity.
    pub fn issue(
        network_id: u64,
        issued_to: Address,
        timestamp: u64,
        revision: u64,
        max_delta: u64,
        signer: &LocalIdentity,
    ) -> Self {
        let mut com = Self {
            network_id,
            issued_to,
            timestamp,
            revision,
            max_delta,
            signed_by: signer.address(),
            signature: [0u8; 64],
        };
        let mut body = Buffer::with_capacity(COM_SIGNED_LEN);
        com.serialize_signed_region(&mut body);
        com.signature = signer.sign(body.as_bytes());
        com
    }

    fn serialize_signed_region(&self, buf: &mut Buffer) {
        buf.append_u64(self.network_id);
        self.issued_to.append_to(buf);
        buf.append_u64(self.timestamp);
        buf.append_u64(self.revision);
        buf.append_u64(self.max_delta);
        self.signed_by.append_to(buf);
    }

    /// Append the full wire form.
    pub fn serialize(&self, buf: &mut Buffer) {
        self.serialize_signed_region(buf);
        buf.append_bytes(&self.signature);
    }

    /// Decode from `buf` at `off`, returning the certificate and consumed
    /// length. Shape only; signature is checked separately.
    pub fn deserialize(buf: &Buffer, off: usize) -> Result<(Self, usize), ProtocolError> {
        let network_id = buf.u64_at(off)?;
        let issued_to = Address::read_from(buf, off + 8)?;
        let timestamp = buf.u64_at(off + 13)?;
        let revision = buf.u64_at(off + 21)?;
        let max_delta = buf.u64_at(off + 29)?;
        let signed_by = Address::read_from(buf, off + 37)?;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(buf.bytes_at(off + 42, 64)?);
        Ok((
            Self { network_id, issued_to, timestamp, revision, max_delta, signed_by, signature },
            COM_SERIALIZED_LEN,
        ))
    }

    /// Verify the signature against the claimed signer's identity.
    pub fn verify_signature(&self, signer: &Identity) -> bool {
        if signer.address() != self.signed_by {
            return false;
        }
        let mut body = Buffer::with_capacity(COM_SIGNED_LEN);
        self.serialize_signed_region(&mut body);
        signer.verify(body.as_bytes(), &self.signature)
    }

    /// True iff both certificates admit each other's holder right now.
    pub fn agrees_with(&self, other: &Self) -> bool {
        if self.network_id != other.network_id {
            return false;
        }
        let delta = self.timestamp.abs_diff(other.timestamp);
        delta <= self.max_delta && delta <= other.max_delta
    }
}
