//! Peer identities: address-bound C25519 + Ed25519 key pairs.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::address::Address;
use crate::buffer::Buffer;
use crate::error::ProtocolError;

/// Length of a serialized identity on the wire.
pub const IDENTITY_SERIALIZED_LEN: usize = 5 + 1 + 32 + 32;

/// Length of a derived per-peer shared secret key.
pub const PEER_KEY_LEN: usize = 32;

// Address derivation criterion: the first byte of the key digest must fall
// below this bound, making address grinding proportionally expensive.
const ADDRESS_DERIVATION_MAX_FIRST_BYTE: u8 = 0x08;

/// Public half of a peer identity.
///
/// The address is not free-form: it is bound to the key material by a work
/// criterion on `SHA512(c25519 ‖ ed25519)` and equals the digest's last five
/// bytes. `locally_validate` re-checks that binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    address: Address,
    c25519: [u8; 32],
    ed25519: [u8; 32],
}

fn derive_address(c25519: &[u8; 32], ed25519: &[u8; 32]) -> Option<Address> {
    let mut h = Sha512::new();
    h.update(c25519);
    h.update(ed25519);
    let digest = h.finalize();
    if digest[0] >= ADDRESS_DERIVATION_MAX_FIRST_BYTE {
        return None;
    }
    let addr = Address::from_bytes(&digest[59..64]).ok()?;
    if addr.is_nil() || addr.is_reserved() {
        return None;
    }
    Some(addr)
}

impl Identity {
    /// The 40-bit address bound to this identity.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Raw C25519 (agreement) public key.
    pub fn c25519_public(&self) -> &[u8; 32] {
        &self.c25519
    }

    /// True iff the address is correctly bound to the key material.
    pub fn locally_validate(&self) -> bool {
        derive_address(&self.c25519, &self.ed25519) == Some(self.address)
    }

    /// Verify an Ed25519 signature made by this identity.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.ed25519) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(sig) else {
            return false;
        };
        vk.verify(msg, &sig).is_ok()
    }

    /// Append the wire form: `[address:5][type:1][c25519:32][ed25519:32]`.
    pub fn serialize(&self, buf: &mut Buffer) {
        self.address.append_to(buf);
        buf.append_u8(0); // identity type 0: C25519/Ed25519
        buf.append_bytes(&self.c25519);
        buf.append_bytes(&self.ed25519);
    }

    /// Decode from `buf` at `off`, returning the identity and consumed length.
    ///
    /// Only checks shape; call `locally_validate` before trusting it.
    pub fn deserialize(buf: &Buffer, off: usize) -> Result<(Self, usize), ProtocolError> {
        let address = Address::read_from(buf, off)?;
        if buf.u8_at(off + 5)? != 0 {
            return Err(ProtocolError::Malformed);
        }
        let mut c25519 = [0u8; 32];
        c25519.copy_from_slice(buf.bytes_at(off + 6, 32)?);
        let mut ed25519 = [0u8; 32];
        ed25519.copy_from_slice(buf.bytes_at(off + 38, 32)?);
        Ok((Self { address, c25519, ed25519 }, IDENTITY_SERIALIZED_LEN))
    }
}

/// A full local identity including secret keys.
pub struct LocalIdentity {
    identity: Identity,
    agreement_secret: StaticSecret,
    signing_key: SigningKey,
}

impl LocalIdentity {
    /// Generate a new identity, grinding keys until the address criterion
    /// is satisfied.
    pub fn generate() -> Self {
        loop {
            let agreement_secret = StaticSecret::random_from_rng(OsRng);
            let signing_key = SigningKey::generate(&mut OsRng);
            let c25519 = PublicKey::from(&agreement_secret).to_bytes();
            let ed25519 = signing_key.verifying_key().to_bytes();
            if let Some(address) = derive_address(&c25519, &ed25519) {
                return Self {
                    identity: Identity { address, c25519, ed25519 },
                    agreement_secret,
                    signing_key,
                };
            }
        }
    }

    /// Our address.
    pub fn address(&self) -> Address {
        self.identity.address
    }

    /// The public identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Derive the shared secret key used to armor traffic with `other`.
    ///
    /// Curve25519 agreement hashed through SHA-512; both sides arrive at the
    /// same 32 bytes.
    pub fn agree(&self, other: &Identity) -> Result<[u8; PEER_KEY_LEN], ProtocolError> {
        let shared = self
            .agreement_secret
            .diffie_hellman(&PublicKey::from(other.c25519));
        // All-zero output means a low-order remote point
        if shared.as_bytes().iter().all(|b| *b == 0) {
            return Err(ProtocolError::KeyAgreement);
        }
        let digest = Sha512::digest(shared.as_bytes());
        let mut key = [0u8; PEER_KEY_LEN];
        key.copy_from_slice(&digest[..PEER_KEY_LEN]);
        Ok(key)
    }

    /// Sign a message with our Ed25519 key.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.signing_key.sign(msg).to_bytes()
    }
}
