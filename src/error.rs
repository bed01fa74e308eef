//! Error types for the filament wire protocol.

use thiserror::Error;

/// Protocol-level errors raised while decoding or acting on a packet.
///
/// These never escape `IncomingPacket::try_decode`: the dispatcher converts
/// every variant into a logged drop. They exist so decode sites can use `?`
/// instead of hand-rolled bounds checks.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A read past the end of the packet buffer
    #[error("truncated packet")]
    Truncated,
    /// Structurally invalid field contents
    #[error("malformed packet")]
    Malformed,
    /// Peer speaks a protocol version older than we support
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    /// An identity whose address does not bind to its key material
    #[error("invalid identity")]
    InvalidIdentity,
    /// A signature that does not verify
    #[error("bad signature")]
    BadSignature,
    /// Elliptic-curve agreement produced no usable shared secret
    #[error("key agreement failed")]
    KeyAgreement,
}
