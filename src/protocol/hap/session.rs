use super::MAX_PLAINTEXT_CHUNK;
use crate::protocol::crypto::{ChaCha20Poly1305Cipher, CryptoError, Nonce};

/// A HAP-encrypted channel: one directional write key/counter and one
/// directional read key/counter, each with its own ChaCha20-Poly1305
/// cipher.
///
/// A frame is `[2-byte LE plaintext length][ciphertext][16-byte tag]`.
/// The AAD for both directions is the 2-byte length prefix. The nonce's
/// low 4 bytes are zero; the high 8 bytes are the directional counter,
/// little-endian, incremented once per AEAD invocation. Writes longer
/// than [`MAX_PLAINTEXT_CHUNK`] are split across multiple frames, each
/// consuming the next nonce.
pub struct HapSession {
    write_cipher: ChaCha20Poly1305Cipher,
    read_cipher: ChaCha20Poly1305Cipher,
    write_counter: u64,
    read_counter: u64,
}

impl HapSession {
    /// Create a session from a 32-byte write key and a 32-byte read key.
    /// Both counters start at 0.
    ///
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

    /// Current outbound counter value (number of frames written so far).
    #[must_use]
    pub fn write_counter(&self) -> u64 {
        self.write_counter
    }

    /// Current inbound counter value (number of frames read so far).
    #[must_use]
    pub fn read_counter(&self) -> u64 {
        self.read_counter
    }

    /// Encrypt `plaintext` into one or more HAP frames, concatenated.
    ///
    /// # Errors
    ///
    /// Returns an error if the AEAD seal operation fails.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.is_empty() {
            return self.encrypt_chunk(&[]);
        }
        let mut out = Vec::with_capacity(plaintext.len() + plaintext.len() / MAX_PLAINTEXT_CHUNK * 18 + 18);
        for chunk in plaintext.chunks(MAX_PLAINTEXT_CHUNK) {
            out.extend(self.encrypt_chunk(chunk)?);
        }
        Ok(out)
    }

    fn encrypt_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
        #[allow(clippy::cast_possible_truncation)]
        let len_prefix = (chunk.len() as u16).to_le_bytes();
        let nonce = Nonce::from_counter(self.write_counter);
        self.write_counter += 1;
        let sealed = self.write_cipher.encrypt_with_aad(&nonce, &len_prefix, chunk)?;
        let mut frame = Vec::with_capacity(2 + sealed.len());
        frame.extend_from_slice(&len_prefix);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Decrypt one frame's worth of plaintext from the front of `buf`,
    /// returning the plaintext and the number of bytes consumed. Returns
    /// `Ok(None)` if `buf` does not yet contain a full frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the AEAD tag fails to verify; per §4.3 this is
    /// always fatal for the session.
    pub fn decrypt_frame(&mut self, buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, CryptoError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let frame_len = 2 + len + 16;
        if buf.len() < frame_len {
            return Ok(None);
        }
        let len_prefix = &buf[0..2];
        let sealed = &buf[2..frame_len];
        let nonce = Nonce::from_counter(self.read_counter);
        self.read_counter += 1;
        let plaintext = self.read_cipher.decrypt_with_aad(&nonce, len_prefix, sealed)?;
        Ok(Some((plaintext, frame_len)))
    }

    /// Decrypt and reassemble every complete frame currently in `buf`,
    /// returning the concatenated plaintext and the number of bytes
    /// consumed from `buf` (the remainder, if any, is a partial frame).
    ///
    /// # Errors
    ///
    /// Returns an error if any frame's tag fails to verify.
    pub fn decrypt_available(&mut self, buf: &[u8]) -> Result<(Vec<u8>, usize), CryptoError> {
        let mut plaintext = Vec::new();
        let mut consumed = 0;
        while let Some((chunk, used)) = self.decrypt_frame(&buf[consumed..])? {
            plaintext.extend(chunk);
            consumed += used;
        }
        Ok((plaintext, consumed))
    }
}
