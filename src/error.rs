//! Top-level error type.

use crate::protocol::crypto::CryptoError;
use crate::protocol::pairing::PairingError;
use crate::protocol::pairing::tlv::TlvError;

/// Top-level error type for the client library.
///
/// Every public fallible function returns `Result<T, MrpError>`. Subsystem
/// errors convert in via `#[from]` so call sites can use `?` without manual
/// wrapping.
#[derive(Debug, thiserror::Error)]
pub enum MrpError {
    /// The peer sent a message that violates the protocol (malformed
    /// framing, unexpected message kind in the current state, bad TLV).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A cryptographic operation failed: key derivation, AEAD seal/open,
    /// signature verification, or the pairing handshake itself.
    #[error("cryptographic error: {0}")]
    Cryptographic(#[from] CryptoError),

    /// A pairing-level failure (TLV decode, SRP/verify failure, device
    /// returned an error code).
    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    /// Malformed TLV8 data.
    #[error("tlv error: {0}")]
    Tlv(#[from] TlvError),

    /// Underlying transport failed: connection refused/reset, I/O error,
    /// or a request timed out.
    #[error("transport error: {0}")]
    Transport(String),

    /// An I/O error from the underlying socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer reported an application-level error (e.g. a Companion
    /// error frame, or an MRP error response).
    #[error("peer error: {0}")]
    PeerError(String),

    /// Invalid configuration supplied by the caller.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A request/response exchange exceeded its configured timeout.
    #[error("operation timed out")]
    Timeout,
}

impl From<crate::net::TimeoutError> for MrpError {
    fn from(_: crate::net::TimeoutError) -> Self {
        MrpError::Timeout
    }
}
