//! Pair-Verify: fast, PIN-free session establishment using a stored
//! [`Credential`], run at the start of every connection.

use super::storage::CredentialHalf;
use super::tlv::{TlvDecoder, TlvEncoder, TlvType, errors};
use super::PairingError;
use crate::protocol::crypto::{
    ChaCha20Poly1305Cipher, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, HkdfSha512, Nonce,
    X25519KeyPair, X25519PublicKey,
};

/// Which side of the protocol pair-verify is running for, since the
/// final key derivation differs between the two (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairVerifyVariant {
    /// AirPlay control channel: `HKDF(shared, "Control-Salt", ...)`.
    AirPlay,
    /// Companion Link: `HKDF(shared, <empty salt>, ...)`.
    Companion,
}

/// Session keys produced by a successful pair-verify, ready to build a
/// [`crate::protocol::hap::HapSession`] (AirPlay) or
/// [`crate::protocol::companion::CompanionSession`] (Companion).
#[derive(Clone, Debug)]
pub struct SessionKeys {
    /// Key for encrypting data sent to the device.
    pub write_key: [u8; 32],
    /// Key for decrypting data received from the device.
    pub read_key: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    WaitingM2,
    Verifying,
    Complete,
    Failed,
}

/// Outcome of feeding one message into [`PairVerify`].
#[derive(Debug)]
pub enum VerifyStepResult {
    /// Send this to the device and wait for a reply.
    SendData(Vec<u8>),
    /// Waiting on more data; nothing to send yet.
    NeedData,
    /// Verification complete; here are the session keys.
    Complete(SessionKeys),
}

/// Pair-Verify session, built from a previously stored credential.
pub struct PairVerify {
    variant: PairVerifyVariant,
    phase: Phase,
    our_identifier: String,
    our_long_term: Ed25519KeyPair,
    device_ltpk: Ed25519PublicKey,
    ephemeral_keypair: X25519KeyPair,
    shared_secret: Option<[u8; 32]>,
    session_key: Option<[u8; 32]>,
}

impl PairVerify {
    /// Create a new Pair-Verify session for `variant` from a stored
    /// credential half.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored keys are not valid key material.
    pub fn new(variant: PairVerifyVariant, credential: &CredentialHalf) -> Result<Self, PairingError> {
        let our_long_term = Ed25519KeyPair::from_bytes(&credential.client_long_term_private)?;
        let device_ltpk = Ed25519PublicKey::from_bytes(&credential.server_long_term_public)?;

        Ok(Self {
            variant,
            phase: Phase::Init,
            our_identifier: credential.client_identifier.clone(),
            our_long_term,
            device_ltpk,
            ephemeral_keypair: X25519KeyPair::generate(),
            shared_secret: None,
            session_key: None,
        })
    }

    /// Start verification - returns M1: sequence=1, our ephemeral key.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside the initial state.
    pub fn start(&mut self) -> Result<Vec<u8>, PairingError> {
        if self.phase != Phase::Init {
            return Err(PairingError::InvalidState {
                expected: "Init".to_string(),
                actual: format!("{:?}", self.phase),
            });
        }

        let m1 = TlvEncoder::new()
            .add_sequence(1)
            .add(TlvType::PublicKey, self.ephemeral_keypair.public_key().as_bytes())
            .build();

        self.phase = Phase::WaitingM2;
        Ok(m1)
    }

    /// Process M2 and produce M3.
    ///
    /// # Errors
    ///
    /// Returns an error if the device's signature fails to verify.
    pub fn process_m2(&mut self, data: &[u8]) -> Result<VerifyStepResult, PairingError> {
        let tlv = TlvDecoder::decode(data)?;

        if let Some(error) = tlv.get_error() {
            self.phase = Phase::Failed;
            return Err(PairingError::DeviceError { code: error });
        }

        let sequence = tlv.get_sequence()?;
        if sequence != 2 {
            return Err(PairingError::InvalidState {
                expected: "2".to_string(),
                actual: sequence.to_string(),
            });
        }

        let device_ephemeral_bytes = tlv.get_required(TlvType::PublicKey)?;
        let encrypted_data = tlv.get_required(TlvType::EncryptedData)?;

        let device_ephemeral = X25519PublicKey::from_bytes(device_ephemeral_bytes)?;
        let shared = self.ephemeral_keypair.diffie_hellman(&device_ephemeral);

        let hkdf = HkdfSha512::new(Some(b"Pair-Verify-Encrypt-Salt"), shared.as_bytes());
        let session_key = hkdf.expand_fixed::<32>(b"Pair-Verify-Encrypt-Info")?;
        let cipher = ChaCha20Poly1305Cipher::new(&session_key)?;

        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..].copy_from_slice(b"PV-Msg02");
        let nonce = Nonce::from_bytes(&nonce_bytes)?;
        let decrypted = cipher.decrypt(&nonce, encrypted_data)?;

        let device_tlv = TlvDecoder::decode(&decrypted)?;
        let device_identifier = device_tlv.get_required(TlvType::Identifier)?;
        let device_signature = device_tlv.get_required(TlvType::Signature)?;

        let mut verify_data = Vec::new();
        verify_data.extend_from_slice(device_ephemeral_bytes);
        verify_data.extend_from_slice(device_identifier);
        verify_data.extend_from_slice(self.ephemeral_keypair.public_key().as_bytes());

        let signature = Ed25519Signature::from_bytes(device_signature)?;
        self.device_ltpk.verify(&verify_data, &signature)?;

        let mut sign_data = Vec::new();
        sign_data.extend_from_slice(self.ephemeral_keypair.public_key().as_bytes());
        sign_data.extend_from_slice(self.our_identifier.as_bytes());
        sign_data.extend_from_slice(device_ephemeral_bytes);

        let our_signature = self.our_long_term.sign(&sign_data);

        let inner_tlv = TlvEncoder::new()
            .add(TlvType::Identifier, self.our_identifier.as_bytes())
            .add(TlvType::Signature, &our_signature.to_bytes())
            .build();

        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..].copy_from_slice(b"PV-Msg03");
        let nonce = Nonce::from_bytes(&nonce_bytes)?;
        let encrypted = cipher.encrypt(&nonce, &inner_tlv)?;

        let m3 = TlvEncoder::new()
            .add_sequence(3)
            .add(TlvType::EncryptedData, &encrypted)
            .build();

        self.shared_secret = Some(*shared.as_bytes());
        self.session_key = Some(session_key);
        self.phase = Phase::Verifying;

        Ok(VerifyStepResult::SendData(m3))
    }

    /// Process M4 - completes verification and derives the session keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the device reports an authentication failure.
    pub fn process_m4(&mut self, data: &[u8]) -> Result<VerifyStepResult, PairingError> {
        let tlv = TlvDecoder::decode(data)?;

        if let Some(error) = tlv.get_error() {
            self.phase = Phase::Failed;
            if error == errors::AUTHENTICATION {
                return Err(PairingError::SignatureVerificationFailed);
            }
            return Err(PairingError::DeviceError { code: error });
        }

        let sequence = tlv.get_sequence()?;
        if sequence != 4 {
            return Err(PairingError::InvalidState {
                expected: "4".to_string(),
                actual: sequence.to_string(),
            });
        }

        let shared_secret = self.shared_secret.ok_or(PairingError::InvalidState {
            expected: "shared_secret".to_string(),
            actual: "none".to_string(),
        })?;

        let session_keys = match self.variant {
            PairVerifyVariant::AirPlay => {
                let hkdf = HkdfSha512::new(Some(b"Control-Salt"), &shared_secret);
                SessionKeys {
                    write_key: hkdf.expand_fixed::<32>(b"Control-Write-Encryption-Key")?,
                    read_key: hkdf.expand_fixed::<32>(b"Control-Read-Encryption-Key")?,
                }
            }
            PairVerifyVariant::Companion => {
                let hkdf = HkdfSha512::new(None, &shared_secret);
                SessionKeys {
                    write_key: hkdf.expand_fixed::<32>(b"ClientEncrypt-main")?,
                    read_key: hkdf.expand_fixed::<32>(b"ServerEncrypt-main")?,
                }
            }
        };

        self.phase = Phase::Complete;
        Ok(VerifyStepResult::Complete(session_keys))
    }

    /// The raw X25519 shared secret established by this handshake, once
    /// M2 has been processed. AirPlay derives the event and data channel
    /// keys from this same secret with different HKDF salts (§3), so the
    /// connection state machine needs it beyond the control keys already
    /// returned by [`VerifyStepResult::Complete`].
    #[must_use]
    pub fn shared_secret(&self) -> Option<[u8; 32]> {
        self.shared_secret
    }

    /// Drive the state machine with received data (`None` only for the
    /// very first call, which produces M1).
    ///
    /// # Errors
    ///
    /// Returns an error if processing fails or the state machine has
    /// already failed.
    pub fn step(&mut self, data: Option<&[u8]>) -> Result<VerifyStepResult, PairingError> {
        match self.phase {
            Phase::Init => {
                let m1 = self.start()?;
                Ok(VerifyStepResult::SendData(m1))
            }
            Phase::WaitingM2 => {
                let data = data.ok_or(PairingError::InvalidState {
                    expected: "data".to_string(),
                    actual: "none".to_string(),
                })?;
                self.process_m2(data)
            }
            Phase::Verifying => {
                let data = data.ok_or(PairingError::InvalidState {
                    expected: "data".to_string(),
                    actual: "none".to_string(),
                })?;
                self.process_m4(data)
            }
            Phase::Complete => Err(PairingError::InvalidState {
                expected: "not complete".to_string(),
                actual: "Complete".to_string(),
            }),
            Phase::Failed => Err(PairingError::InvalidState {
                expected: "not failed".to_string(),
                actual: "Failed".to_string(),
            }),
        }
    }
}
