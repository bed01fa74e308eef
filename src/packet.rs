//! Packet format, cipher suites and the armor / dearmor wire codec.

use std::io::{Read, Write};
use std::ops::{Deref, DerefMut};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa12;

use crate::address::Address;
use crate::buffer::Buffer;
use crate::error::ProtocolError;
use crate::identity::PEER_KEY_LEN;

/// Offset of the 5-byte destination address.
pub const IDX_DESTINATION: usize = 0;
/// Offset of the 5-byte source address.
pub const IDX_SOURCE: usize = 5;
/// Offset of the flags/hops byte (bit 6 = fragmented, low nibble = hops).
pub const IDX_FLAGS: usize = 10;
/// Offset of the 8-byte MAC (first half of the Poly1305 tag).
pub const IDX_MAC: usize = 11;
/// Offset of the 8-byte packet ID (cipher nonce and correlation key).
pub const IDX_PACKET_ID: usize = 19;
/// Offset of the cipher+flags byte (upper 3 bits = suite, bit 0 = compressed).
pub const IDX_CIPHER: usize = 27;
/// Offset of the verb byte.
pub const IDX_VERB: usize = 28;
/// Offset where the verb payload begins.
pub const IDX_PAYLOAD: usize = 29;

/// Fixed header length; the shortest valid packet.
pub const HEADER_LEN: usize = IDX_PAYLOAD;

/// Hard upper bound on an armored packet.
pub const MAX_PACKET_LENGTH: usize = 1444;

/// Largest Ethernet frame payload deliverable to the tap.
pub const IF_MTU: usize = 2800;

/// Protocol version spoken by this implementation.
pub const PROTO_VERSION: u8 = 5;
/// Oldest protocol version we will talk to.
pub const MIN_PROTO_VERSION: u8 = 4;

/// Software major version advertised in HELLO.
pub const VERSION_MAJOR: u8 = 1;
/// Software minor version advertised in HELLO.
pub const VERSION_MINOR: u8 = 2;
/// Software revision advertised in HELLO.
pub const VERSION_REVISION: u16 = 0;

// Compressed-payload bit within the cipher+flags byte.
const FLAG_COMPRESSED: u8 = 0x01;

// Refuse to inflate beyond this; a hostile stream cannot balloon memory.
const DECOMPRESS_LIMIT: usize = 16384;

/// Cipher suite selecting how a packet is armored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherSuite {
    /// Poly1305 MAC over the clear payload; used exclusively by HELLO
    NonePoly1305,
    /// Salsa20/12 encrypted payload with Poly1305 over the ciphertext
    Salsa2012Poly1305,
}

impl CipherSuite {
    /// Decode the upper-3-bit suite field.
    pub fn from_bits(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::NonePoly1305),
            1 => Some(Self::Salsa2012Poly1305),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::NonePoly1305 => 0,
            Self::Salsa2012Poly1305 => 1,
        }
    }
}

/// One-byte tag identifying the kind of message carried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// No operation; also the "nothing in-re" marker
    Nop,
    /// First-contact identity exchange
    Hello,
    /// Error response correlated to an earlier packet
    Error,
    /// Success response correlated to an earlier packet
    Ok,
    /// Identity lookup request
    Whois,
    /// NAT hole-punch instruction from a relay
    Rendezvous,
    /// Unicast Ethernet frame (implied addressing)
    Frame,
    /// Unicast Ethernet frame with explicit MACs and bridging
    ExtFrame,
    /// Payload echo request
    Echo,
    /// Multicast group subscription advertisement
    MulticastLike,
    /// Membership certificate push
    NetworkMembershipCertificate,
    /// Network configuration request to a controller
    NetworkConfigRequest,
    /// Controller-initiated configuration refresh hint
    NetworkConfigRefresh,
    /// Multicast subscriber sampling request
    MulticastGather,
    /// Multicast Ethernet frame
    MulticastFrame,
    /// Direct physical path advertisement
    PushDirectPaths,
    /// Signed graph-walk diagnostic
    CircuitTest,
    /// Hop report for a circuit test
    CircuitTestReport,
    /// Memory-hard proof-of-work request (roots only)
    RequestProofOfWork,
    /// Verb from a newer protocol revision; counted but not interpreted
    Unknown(u8),
}

impl Verb {
    /// Decode a verb byte. Unknown values are carried, not rejected.
    pub fn from_u8(b: u8) -> Self {
        match b {
            0x00 => Self::Nop,
            0x01 => Self::Hello,
            0x02 => Self::Error,
            0x03 => Self::Ok,
            0x04 => Self::Whois,
            0x05 => Self::Rendezvous,
            0x06 => Self::Frame,
            0x07 => Self::ExtFrame,
            0x08 => Self::Echo,
            0x09 => Self::MulticastLike,
            0x0a => Self::NetworkMembershipCertificate,
            0x0b => Self::NetworkConfigRequest,
            0x0c => Self::NetworkConfigRefresh,
            0x0d => Self::MulticastGather,
            0x0e => Self::MulticastFrame,
            0x10 => Self::PushDirectPaths,
            0x11 => Self::CircuitTest,
            0x12 => Self::CircuitTestReport,
            0x13 => Self::RequestProofOfWork,
            other => Self::Unknown(other),
        }
    }

    /// The wire byte for this verb.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Nop => 0x00,
            Self::Hello => 0x01,
            Self::Error => 0x02,
            Self::Ok => 0x03,
            Self::Whois => 0x04,
            Self::Rendezvous => 0x05,
            Self::Frame => 0x06,
            Self::ExtFrame => 0x07,
            Self::Echo => 0x08,
            Self::MulticastLike => 0x09,
            Self::NetworkMembershipCertificate => 0x0a,
            Self::NetworkConfigRequest => 0x0b,
            Self::NetworkConfigRefresh => 0x0c,
            Self::MulticastGather => 0x0d,
            Self::MulticastFrame => 0x0e,
            Self::PushDirectPaths => 0x10,
            Self::CircuitTest => 0x11,
            Self::CircuitTestReport => 0x12,
            Self::RequestProofOfWork => 0x13,
            Self::Unknown(b) => b,
        }
    }
}

/// Error codes carried by ERROR responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// Request was structurally valid but not serviceable
    InvalidRequest,
    /// Operation not supported by this node
    UnsupportedOperation,
    /// Referenced object does not exist here
    ObjNotFound,
    /// Sender's address is claimed by a different identity
    IdentityCollision,
    /// A current membership certificate is required
    NeedMembershipCertificate,
    /// Network controller refused access
    NetworkAccessDenied,
    /// Receiver does not want this multicast group
    UnwantedMulticast,
    /// Code from a newer protocol revision
    Unknown(u8),
}

impl ErrorCode {
    /// Decode an error code byte.
    pub fn from_u8(b: u8) -> Self {
        match b {
            0x01 => Self::InvalidRequest,
            0x02 => Self::UnsupportedOperation,
            0x04 => Self::ObjNotFound,
            0x05 => Self::IdentityCollision,
            0x06 => Self::NeedMembershipCertificate,
            0x07 => Self::NetworkAccessDenied,
            0x08 => Self::UnwantedMulticast,
            other => Self::Unknown(other),
        }
    }

    /// The wire byte for this code.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::InvalidRequest => 0x01,
            Self::UnsupportedOperation => 0x02,
            Self::ObjNotFound => 0x04,
            Self::IdentityCollision => 0x05,
            Self::NeedMembershipCertificate => 0x06,
            Self::NetworkAccessDenied => 0x07,
            Self::UnwantedMulticast => 0x08,
            Self::Unknown(b) => b,
        }
    }
}

/// A protocol packet: fixed 29-byte header plus verb payload.
///
/// Dereferences to [`Buffer`] so payload fields can be appended and read
/// with the bounds-checked accessors.
#[derive(Clone, Debug)]
pub struct Packet {
    b: Buffer,
}

// Derive the one-time Poly1305 key for a packet and leave the stream cipher
// positioned at the start of the payload keystream.
fn mac_key_for(key: &[u8; PEER_KEY_LEN], packet_id: u64) -> (Salsa12, [u8; 32]) {
    let nonce = packet_id.to_be_bytes();
    let mut cipher = Salsa12::new(
        salsa20::Key::from_slice(key),
        salsa20::Nonce::from_slice(&nonce),
    );
    let mut block = [0u8; 64];
    cipher.apply_keystream(&mut block);
    let mut mac_key = [0u8; 32];
    mac_key.copy_from_slice(&block[..32]);
    (cipher, mac_key)
}

fn poly1305_tag8(mac_key: &[u8; 32], data: &[u8]) -> [u8; 8] {
    let tag = Poly1305::new(poly1305::Key::from_slice(mac_key)).compute_unpadded(data);
    let mut out = [0u8; 8];
    out.copy_from_slice(&tag.as_slice()[..8]);
    out
}

impl Packet {
    /// Start a new outbound packet with a freshly generated packet ID.
    pub fn new(destination: Address, source: Address, verb: Verb) -> Self {
        let mut b = Buffer::with_capacity(HEADER_LEN + 64);
        destination.append_to(&mut b);
        source.append_to(&mut b);
        b.append_u8(0); // flags/hops
        b.append_zeroes(8); // MAC, filled by armor
        b.append_u64(rand::random::<u64>());
        b.append_u8(0); // cipher+flags
        b.append_u8(verb.to_u8());
        Self { b }
    }

    /// Wrap received bytes; fails if shorter than the fixed header.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated);
        }
        Ok(Self { b: Buffer::from_bytes(data) })
    }

    /// Destination address from the header.
    pub fn destination(&self) -> Address {
        Address::read_from(&self.b, IDX_DESTINATION).unwrap_or_default()
    }

    /// Source address from the header.
    pub fn source(&self) -> Address {
        Address::read_from(&self.b, IDX_SOURCE).unwrap_or_default()
    }

    /// Hops-traveled counter (low nibble of the flags byte).
    pub fn hops(&self) -> u8 {
        self.b.u8_at(IDX_FLAGS).unwrap_or(0) & 0x0f
    }

    /// 64-bit packet ID: cipher nonce and request/response correlator.
    pub fn packet_id(&self) -> u64 {
        self.b.u64_at(IDX_PACKET_ID).unwrap_or(0)
    }

    /// Cipher suite, or None for a suite we do not know.
    pub fn cipher(&self) -> Option<CipherSuite> {
        CipherSuite::from_bits(self.b.u8_at(IDX_CIPHER).unwrap_or(0xff) >> 5)
    }

    /// Verb tag. Meaningless before `dearmor` for encrypted suites.
    pub fn verb(&self) -> Verb {
        Verb::from_u8(self.b.u8_at(IDX_VERB).unwrap_or(0))
    }

    /// Length of the verb payload.
    pub fn payload_len(&self) -> usize {
        self.b.len().saturating_sub(IDX_PAYLOAD)
    }

    /// Redirect the packet to a different destination (circuit-test fan-out).
    pub fn set_destination(&mut self, destination: Address) {
        let _ = self.b.set_bytes_at(IDX_DESTINATION, &destination.to_bytes());
    }

    /// Generate a fresh packet ID so a re-sent copy gets its own nonce.
    pub fn new_packet_id(&mut self) {
        let _ = self.b.set_u64_at(IDX_PACKET_ID, rand::random::<u64>());
    }

    fn compressed_flag(&self) -> bool {
        self.b.u8_at(IDX_CIPHER).unwrap_or(0) & FLAG_COMPRESSED != 0
    }

    fn set_cipher_byte(&mut self, suite: CipherSuite, compressed: bool) {
        let flags = if compressed { FLAG_COMPRESSED } else { 0 };
        let _ = self.b.set_bytes_at(IDX_CIPHER, &[(suite.bits() << 5) | flags]);
    }

    /// MAC (and for the Salsa suite, encrypt in place) for sending.
    pub fn armor(&mut self, key: &[u8; PEER_KEY_LEN], encrypt: bool) {
        let suite = if encrypt {
            CipherSuite::Salsa2012Poly1305
        } else {
            CipherSuite::NonePoly1305
        };
        self.set_cipher_byte(suite, self.compressed_flag());
        let (mut cipher, mac_key) = mac_key_for(key, self.packet_id());
        if encrypt {
            cipher.apply_keystream(&mut self.b.as_bytes_mut()[IDX_VERB..]);
        }
        let tag = {
            let region = &self.b.as_bytes()[IDX_VERB..];
            poly1305_tag8(&mac_key, region)
        };
        let _ = self.b.set_bytes_at(IDX_MAC, &tag);
    }

    /// Verify the MAC and decrypt in place for the Salsa suite.
    ///
    /// Returns false on an unknown suite or MAC mismatch; the payload is
    /// left untouched in both failure cases.
    pub fn dearmor(&mut self, key: &[u8; PEER_KEY_LEN]) -> bool {
        let Some(suite) = self.cipher() else {
            return false;
        };
        let (mut cipher, mac_key) = mac_key_for(key, self.packet_id());
        let expected = {
            let region = &self.b.as_bytes()[IDX_VERB..];
            poly1305_tag8(&mac_key, region)
        };
        let stored = match self.b.bytes_at(IDX_MAC, 8) {
            Ok(s) => s,
            Err(_) => return false,
        };
        if stored != &expected[..] {
            return false;
        }
        if suite == CipherSuite::Salsa2012Poly1305 {
            cipher.apply_keystream(&mut self.b.as_bytes_mut()[IDX_VERB..]);
        }
        true
    }

    /// Deflate the payload in place if that makes it smaller.
    ///
    /// Returns true iff the packet now carries the compressed flag. Must be
    /// called before `armor`.
    pub fn compress(&mut self) -> bool {
        if self.compressed_flag() || self.b.len() <= IDX_PAYLOAD {
            return self.compressed_flag();
        }
        let payload = match self.b.bytes_at(IDX_PAYLOAD, self.payload_len()) {
            Ok(p) => p.to_vec(),
            Err(_) => return false,
        };
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        if enc.write_all(&payload).is_err() {
            return false;
        }
        let Ok(compressed) = enc.finish() else {
            return false;
        };
        if compressed.len() < payload.len() {
            self.b.truncate(IDX_PAYLOAD);
            self.b.append_bytes(&compressed);
            let suite = self.cipher().unwrap_or(CipherSuite::NonePoly1305);
            self.set_cipher_byte(suite, true);
        }
        self.compressed_flag()
    }

    /// Inflate the payload in place if the compressed flag is set.
    ///
    /// Returns false on a malformed or oversized stream. Must be called
    /// after `dearmor`.
    pub fn uncompress(&mut self) -> bool {
        if !self.compressed_flag() {
            return true;
        }
        let compressed = match self.b.bytes_at(IDX_PAYLOAD, self.payload_len()) {
            Ok(p) => p.to_vec(),
            Err(_) => return false,
        };
        let mut inflated = Vec::with_capacity(compressed.len() * 2);
        let mut dec = DeflateDecoder::new(&compressed[..]).take(DECOMPRESS_LIMIT as u64 + 1);
        if dec.read_to_end(&mut inflated).is_err() || inflated.len() > DECOMPRESS_LIMIT {
            return false;
        }
        self.b.truncate(IDX_PAYLOAD);
        self.b.append_bytes(&inflated);
        let suite = self.cipher().unwrap_or(CipherSuite::NonePoly1305);
        self.set_cipher_byte(suite, false);
        true
    }
}

impl Deref for Packet {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.b
    }
}

impl DerefMut for Packet {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.b
    }
}
