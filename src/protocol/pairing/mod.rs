//! HomeKit-derived pairing handshakes used to reach a ready control
//! session: pair-setup (SRP-6a, PIN-based, produces a long-term
//! [`storage::Credential`]) and pair-verify (X25519 + mutual Ed25519
//! proofs, produces the per-connection [`verify::SessionKeys`] that feed
//! a [`crate::protocol::hap::HapSession`] or
//! [`crate::protocol::companion::CompanionSession`]).

pub mod setup;
pub mod storage;
pub mod tlv;
pub mod verify;

#[cfg(test)]
mod tests;

pub use setup::{PairSetup, SetupStepResult};
pub use storage::{Credential, CredentialHalf, CredentialStorage, FileStorage, MemoryStorage, StorageError};
pub use tlv::{TlvDecoder, TlvEncoder, TlvError, TlvType};
pub use verify::{PairVerify, PairVerifyVariant, SessionKeys, VerifyStepResult};

/// Errors shared by pair-setup and pair-verify.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("invalid TLV: {0}")]
    InvalidTlv(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("SRP verification failed")]
    SrpVerificationFailed,

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("crypto error: {0}")]
    CryptoError(#[from] crate::protocol::crypto::CryptoError),

    #[error("device returned error: {code}")]
    DeviceError { code: u8 },

    #[error("pairing required (no stored credential)")]
    PairingRequired,

    #[error("TLV error: {0}")]
    Tlv(#[from] tlv::TlvError),
}
