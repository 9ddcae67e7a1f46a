use super::frame::{CompanionFrame, FrameType};
use crate::protocol::crypto::{ChaCha20Poly1305Cipher, CryptoError, Nonce};

/// Post-pair-verify Companion session: a single write cipher/counter and
/// read cipher/counter. Unlike HAP, each logical message is sealed as a
/// single AEAD invocation (no 1024-byte chunking) and the AAD is the
/// 4-byte outer frame header rather than a length prefix.
pub struct CompanionSession {
    write_cipher: ChaCha20Poly1305Cipher,
    read_cipher: ChaCha20Poly1305Cipher,
    write_counter: u64,
    read_counter: u64,
}

impl CompanionSession {
    /// # Errors
    ///
    /// Returns an error if either key is not 32 bytes.
    pub fn new(write_key: &[u8], read_key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            write_cipher: ChaCha20Poly1305Cipher::new(write_key)?,
            read_cipher: ChaCha20Poly1305Cipher::new(read_key)?,
            write_counter: 0,
            read_counter: 0,
        })
    }

    /// Encrypt `plaintext` into a single `E_OPACK` frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the AEAD seal operation fails.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<CompanionFrame, CryptoError> {
        let sealed_len = (plaintext.len() + 16) as u32;
        let len_be = sealed_len.to_be_bytes();
        let header = [FrameType::EOpack as u8, len_be[1], len_be[2], len_be[3]];
        let nonce = Nonce::from_counter(self.write_counter);
        self.write_counter += 1;
        let sealed = self.write_cipher.encrypt_with_aad(&nonce, &header, plaintext)?;
        Ok(CompanionFrame::new(FrameType::EOpack, sealed))
    }

    /// Decrypt a frame previously produced by the peer's `encrypt`.
    ///
    /// # Errors
    ///
    /// Returns an error if the AEAD tag fails to verify.
    pub fn decrypt(&mut self, frame: &CompanionFrame) -> Result<Vec<u8>, CryptoError> {
        let header = frame.header();
        let nonce = Nonce::from_counter(self.read_counter);
        self.read_counter += 1;
        self.read_cipher.decrypt_with_aad(&nonce, &header, &frame.payload)
    }
}
