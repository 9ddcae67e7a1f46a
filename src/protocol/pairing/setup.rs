//! Pair-Setup: PIN-based pairing using SRP-6a, producing a long-term
//! [`Credential`]. Used the first time a device is paired; afterwards
//! `pair-verify` re-establishes a session from the stored credential
//! without the PIN.

use super::storage::Credential;
use super::tlv::{TlvDecoder, TlvEncoder, TlvType, errors, methods};
use super::PairingError;
use crate::protocol::crypto::{
    ChaCha20Poly1305Cipher, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature, HkdfSha512, Nonce,
    SrpClient, SrpVerifier,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    WaitingM2,
    WaitingM4,
    WaitingM6,
    Complete,
    Failed,
}

/// Outcome of feeding one message into [`PairSetup`].
#[derive(Debug)]
pub enum SetupStepResult {
    /// Send this to the device and wait for a reply.
    SendData(Vec<u8>),
    /// Waiting on more data; nothing to send yet.
    NeedData,
    /// Pairing complete; here is the long-term credential to persist.
    Complete(Credential),
}

/// Pair-Setup session. Drive with [`PairSetup::step`], feeding back
/// whatever the device returns after each `SendData`.
pub struct PairSetup {
    phase: Phase,
    pin: Option<String>,
    client_identifier: String,
    signing_keypair: Ed25519KeyPair,
    srp_verifier: Option<SrpVerifier>,
    session_key: Option<Vec<u8>>,
}

impl PairSetup {
    /// Create a new Pair-Setup session. `client_identifier` is this
    /// client's durable identity string (typically a UUID), persisted
    /// in the resulting [`Credential`].
    #[must_use]
    pub fn new(client_identifier: String) -> Self {
        Self {
            phase: Phase::Init,
            pin: None,
            client_identifier,
            signing_keypair: Ed25519KeyPair::generate(),
            srp_verifier: None,
            session_key: None,
        }
    }

    /// Set the PIN displayed by the device. Must be called before the
    /// M2 response is processed.
    pub fn set_pin(&mut self, pin: &str) {
        self.pin = Some(pin.to_string());
    }

    /// Start pairing - returns M1. Field order on the wire is
    /// Method then Sequence.
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
            .add_method(methods::PAIR_SETUP)
            .add_sequence(1)
            .build();

        self.phase = Phase::WaitingM2;
        Ok(m1)
    }

    /// Process M2 (salt + server public key) and produce M3.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLV is malformed, the device reports an
    /// error, or the PIN has not been set.
    pub fn process_m2(&mut self, data: &[u8]) -> Result<SetupStepResult, PairingError> {
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

        let salt = tlv.get_required(TlvType::Salt)?;
        let server_public = tlv.get_required(TlvType::PublicKey)?;

        let pin = self
            .pin
            .as_ref()
            .ok_or_else(|| PairingError::AuthenticationFailed("PIN not set".to_string()))?;

        let srp_client = SrpClient::new()?;
        let client_public = srp_client.public_key().to_vec();

        let verifier =
            srp_client.process_challenge(b"Pair-Setup", pin.as_bytes(), salt, server_public)?;

        let m3 = TlvEncoder::new()
            .add_sequence(3)
            .add(TlvType::PublicKey, &client_public)
            .add(TlvType::Proof, verifier.client_proof())
            .build();

        self.srp_verifier = Some(verifier);
        self.phase = Phase::WaitingM4;

        Ok(SetupStepResult::SendData(m3))
    }

    /// Process M4 (server proof) and produce M5.
    ///
    /// # Errors
    ///
    /// Returns an error if the server proof does not verify.
    pub fn process_m4(&mut self, data: &[u8]) -> Result<SetupStepResult, PairingError> {
        let tlv = TlvDecoder::decode(data)?;

        if let Some(error) = tlv.get_error() {
            self.phase = Phase::Failed;
            if error == errors::AUTHENTICATION {
                return Err(PairingError::SrpVerificationFailed);
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

        let server_proof = tlv.get_required(TlvType::Proof)?;

        let verifier = self.srp_verifier.as_ref().ok_or(PairingError::InvalidState {
            expected: "srp_verifier".to_string(),
            actual: "none".to_string(),
        })?;

        let session_key = verifier
            .verify_server(server_proof)
            .map_err(|_| PairingError::SrpVerificationFailed)?
            .as_bytes()
            .to_vec();

        let hkdf_enc = HkdfSha512::new(Some(b"Pair-Setup-Encrypt-Salt"), &session_key);
        let encrypt_key = hkdf_enc.expand_fixed::<32>(b"Pair-Setup-Encrypt-Info")?;

        let hkdf_sign = HkdfSha512::new(Some(b"Pair-Setup-Controller-Sign-Salt"), &session_key);
        let mut sign_data = hkdf_sign.expand(b"Pair-Setup-Controller-Sign-Info", 32)?;
        sign_data.extend_from_slice(self.client_identifier.as_bytes());
        sign_data.extend_from_slice(self.signing_keypair.public_key().as_bytes());

        let signature = self.signing_keypair.sign(&sign_data);

        let signed_tlv = TlvEncoder::new()
            .add(TlvType::Identifier, self.client_identifier.as_bytes())
            .add(TlvType::PublicKey, self.signing_keypair.public_key().as_bytes())
            .add(TlvType::Signature, &signature.to_bytes())
            .build();

        let cipher = ChaCha20Poly1305Cipher::new(&encrypt_key)?;
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..].copy_from_slice(b"PS-Msg05");
        let nonce = Nonce::from_bytes(&nonce_bytes)?;
        let encrypted = cipher.encrypt(&nonce, &signed_tlv)?;

        let m5 = TlvEncoder::new()
            .add_sequence(5)
            .add(TlvType::EncryptedData, &encrypted)
            .build();

        self.session_key = Some(session_key);
        self.phase = Phase::WaitingM6;

        Ok(SetupStepResult::SendData(m5))
    }

    /// Process M6 (device's long-term identity) - completes pairing.
    ///
    /// # Errors
    ///
    /// Returns an error if decryption, a required field, or the
    /// device's signature fails to verify.
    pub fn process_m6(&mut self, data: &[u8]) -> Result<SetupStepResult, PairingError> {
        let tlv = TlvDecoder::decode(data)?;

        if let Some(error) = tlv.get_error() {
            self.phase = Phase::Failed;
            return Err(PairingError::DeviceError { code: error });
        }

        let sequence = tlv.get_sequence()?;
        if sequence != 6 {
            return Err(PairingError::InvalidState {
                expected: "6".to_string(),
                actual: sequence.to_string(),
            });
        }

        let encrypted = tlv.get_required(TlvType::EncryptedData)?;

        let session_key = self.session_key.as_ref().ok_or(PairingError::InvalidState {
            expected: "session_key".to_string(),
            actual: "none".to_string(),
        })?;

        let hkdf = HkdfSha512::new(Some(b"Pair-Setup-Encrypt-Salt"), session_key);
        let decrypt_key = hkdf.expand_fixed::<32>(b"Pair-Setup-Encrypt-Info")?;

        let cipher = ChaCha20Poly1305Cipher::new(&decrypt_key)?;
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..].copy_from_slice(b"PS-Msg06");
        let nonce = Nonce::from_bytes(&nonce_bytes)?;
        let decrypted = cipher.decrypt(&nonce, encrypted)?;

        let device_tlv = TlvDecoder::decode(&decrypted)?;
        let device_ltpk_bytes = device_tlv.get_required(TlvType::PublicKey)?;
        let device_identifier = device_tlv.get_required(TlvType::Identifier)?;
        let device_signature_bytes = device_tlv.get_required(TlvType::Signature)?;

        let hkdf = HkdfSha512::new(Some(b"Pair-Setup-Accessory-Sign-Salt"), session_key);
        let accessory_key = hkdf.expand_fixed::<32>(b"Pair-Setup-Accessory-Sign-Info")?;

        let mut signed_data =
            Vec::with_capacity(accessory_key.len() + device_identifier.len() + device_ltpk_bytes.len());
        signed_data.extend_from_slice(&accessory_key);
        signed_data.extend_from_slice(device_identifier);
        signed_data.extend_from_slice(device_ltpk_bytes);

        let device_ltpk = Ed25519PublicKey::from_bytes(device_ltpk_bytes)
            .map_err(|_| PairingError::InvalidTlv("invalid device public key".to_string()))?;
        let signature = Ed25519Signature::from_bytes(device_signature_bytes)
            .map_err(|_| PairingError::InvalidTlv("invalid device signature".to_string()))?;

        device_ltpk
            .verify(&signed_data, &signature)
            .map_err(|_| PairingError::SignatureVerificationFailed)?;

        let server_identifier = String::from_utf8(device_identifier.to_vec())
            .map_err(|_| PairingError::InvalidTlv("device identifier is not utf-8".to_string()))?;

        let mut device_ltpk_fixed = [0u8; 32];
        device_ltpk_fixed.copy_from_slice(device_ltpk_bytes);

        self.phase = Phase::Complete;

        let credential = super::storage::CredentialHalf {
            client_identifier: self.client_identifier.clone(),
            client_long_term_private: self.signing_keypair.secret_bytes(),
            client_long_term_public: *self.signing_keypair.public_key().as_bytes(),
            server_long_term_public: device_ltpk_fixed,
            server_identifier,
        };

        Ok(SetupStepResult::Complete(Credential {
            primary: credential,
            companion: None,
        }))
    }

    /// Drive the state machine with received data (`None` only for the
    /// very first call, which produces M1).
    ///
    /// # Errors
    ///
    /// Returns an error if processing fails or the state machine has
    /// already failed or completed.
    pub fn step(&mut self, data: Option<&[u8]>) -> Result<SetupStepResult, PairingError> {
        match self.phase {
            Phase::Init => {
                let m1 = self.start()?;
                Ok(SetupStepResult::SendData(m1))
            }
            Phase::WaitingM2 => {
                let data = data.ok_or(PairingError::InvalidState {
                    expected: "data".to_string(),
                    actual: "none".to_string(),
                })?;
                self.process_m2(data)
            }
            Phase::WaitingM4 => {
                let data = data.ok_or(PairingError::InvalidState {
                    expected: "data".to_string(),
                    actual: "none".to_string(),
                })?;
                self.process_m4(data)
            }
            Phase::WaitingM6 => {
                let data = data.ok_or(PairingError::InvalidState {
                    expected: "data".to_string(),
                    actual: "none".to_string(),
                })?;
                self.process_m6(data)
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
