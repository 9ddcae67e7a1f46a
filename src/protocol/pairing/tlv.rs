//! TLV8 encoding used by the `HomeKit`/Companion pairing handshakes.

use std::collections::HashMap;
use thiserror::Error;

/// TLV type codes used in the pairing handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    /// Method to use (pairing method).
    Method = 0x00,
    /// Pairing identifier.
    Identifier = 0x01,
    /// Salt for SRP.
    Salt = 0x02,
    /// Public key.
    PublicKey = 0x03,
    /// Proof (M1/M2 in SRP).
    Proof = 0x04,
    /// Encrypted data.
    EncryptedData = 0x05,
    /// Pairing sequence number (which message of the exchange this is).
    Sequence = 0x06,
    /// Error code.
    Error = 0x07,
    /// Seconds to wait before retrying, present alongside a backoff error.
    BackOff = 0x08,
    /// Certificate.
    Certificate = 0x09,
    /// Signature.
    Signature = 0x0A,
    /// Permissions.
    Permissions = 0x0B,
    /// Fragment data.
    FragmentData = 0x0C,
    /// Fragment last.
    FragmentLast = 0x0D,
    /// Peer display name.
    Name = 0x11,
    /// Flags.
    Flags = 0x13,
}

impl TlvType {
    /// Create from byte value.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Method),
            0x01 => Some(Self::Identifier),
            0x02 => Some(Self::Salt),
            0x03 => Some(Self::PublicKey),
            0x04 => Some(Self::Proof),
            0x05 => Some(Self::EncryptedData),
            0x06 => Some(Self::Sequence),
            0x07 => Some(Self::Error),
            0x08 => Some(Self::BackOff),
            0x09 => Some(Self::Certificate),
            0x0A => Some(Self::Signature),
            0x0B => Some(Self::Permissions),
            0x0C => Some(Self::FragmentData),
            0x0D => Some(Self::FragmentLast),
            0x11 => Some(Self::Name),
            0x13 => Some(Self::Flags),
            _ => None,
        }
    }
}

/// TLV encoding errors.
#[derive(Debug, Error)]
pub enum TlvError {
    #[error("buffer too small")]
    BufferTooSmall,

    #[error("invalid TLV structure")]
    InvalidStructure,

    #[error("unknown type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("missing required field: {0:?}")]
    MissingField(TlvType),

    #[error("invalid value for {0:?}")]
    InvalidValue(TlvType),
}

/// TLV encoder.
pub struct TlvEncoder {
    buffer: Vec<u8>,
}

impl TlvEncoder {
    /// Create a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Add a TLV item, fragmenting values longer than 255 bytes across
    /// repeated entries of the same type per the TLV8 convention.
    #[must_use]
    pub fn add(mut self, tlv_type: TlvType, value: &[u8]) -> Self {
        if value.is_empty() {
            self.buffer.push(tlv_type as u8);
            self.buffer.push(0);
            return self;
        }

        for chunk in value.chunks(255) {
            self.buffer.push(tlv_type as u8);
            #[allow(clippy::cast_possible_truncation)]
            self.buffer.push(chunk.len() as u8);
            self.buffer.extend_from_slice(chunk);
        }

        self
    }

    /// Add a single byte value.
    #[must_use]
    pub fn add_byte(self, tlv_type: TlvType, value: u8) -> Self {
        self.add(tlv_type, &[value])
    }

    /// Add a single byte value (alias for `add_byte`).
    #[must_use]
    pub fn add_u8(self, tlv_type: TlvType, value: u8) -> Self {
        self.add_byte(tlv_type, value)
    }

    /// Add bytes (alias for `add`).
    #[must_use]
    pub fn add_bytes(self, tlv_type: TlvType, value: &[u8]) -> Self {
        self.add(tlv_type, value)
    }

    /// Build the encoded TLV data (alias for `build`).
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        self.build()
    }

    /// Add the sequence number field.
    #[must_use]
    pub fn add_sequence(self, sequence: u8) -> Self {
        self.add_byte(TlvType::Sequence, sequence)
    }

    /// Add the method field.
    #[must_use]
    pub fn add_method(self, method: u8) -> Self {
        self.add_byte(TlvType::Method, method)
    }

    /// Build the encoded TLV data.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for TlvEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// TLV decoder.
///
/// Repeated entries of the same type are concatenated in order, which is
/// how fragmented (>255 byte) values are reassembled.
pub struct TlvDecoder {
    items: HashMap<u8, Vec<u8>>,
}

impl TlvDecoder {
    /// Decode TLV data.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is truncated mid-entry.
    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut items: HashMap<u8, Vec<u8>> = HashMap::new();
        let mut pos = 0;

        while pos < data.len() {
            if pos + 2 > data.len() {
                return Err(TlvError::BufferTooSmall);
            }

            let tlv_type = data[pos];
            let length = data[pos + 1] as usize;
            pos += 2;

            if pos + length > data.len() {
                return Err(TlvError::BufferTooSmall);
            }

            let value = &data[pos..pos + length];
            pos += length;

            items.entry(tlv_type).or_default().extend_from_slice(value);
        }

        Ok(Self { items })
    }

    /// Get a value by type.
    #[must_use]
    pub fn get(&self, tlv_type: TlvType) -> Option<&[u8]> {
        self.items
            .get(&(tlv_type as u8))
            .map(std::vec::Vec::as_slice)
    }

    /// Get a value by type (alias for `get`).
    #[must_use]
    pub fn get_bytes(&self, tlv_type: TlvType) -> Option<&[u8]> {
        self.get(tlv_type)
    }

    /// Get a single byte value.
    #[must_use]
    pub fn get_u8(&self, tlv_type: TlvType) -> Option<u8> {
        self.get(tlv_type).and_then(|v| v.first().copied())
    }

    /// Get a required value.
    ///
    /// # Errors
    ///
    /// Returns error if the field is missing.
    pub fn get_required(&self, tlv_type: TlvType) -> Result<&[u8], TlvError> {
        self.get(tlv_type).ok_or(TlvError::MissingField(tlv_type))
    }

    /// Get the sequence number field.
    ///
    /// # Errors
    ///
    /// Returns error if the field is missing or not exactly one byte.
    pub fn get_sequence(&self) -> Result<u8, TlvError> {
        let value = self.get_required(TlvType::Sequence)?;
        if value.len() != 1 {
            return Err(TlvError::InvalidValue(TlvType::Sequence));
        }
        Ok(value[0])
    }

    /// Get the error code, if present.
    #[must_use]
    pub fn get_error(&self) -> Option<u8> {
        self.get(TlvType::Error).and_then(|v| v.first().copied())
    }

    /// Check whether an error field is present.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.get(TlvType::Error).is_some()
    }
}

/// Pairing method constants.
pub mod methods {
    /// Pair-Setup.
    pub const PAIR_SETUP: u8 = 0;
    /// Pair-Setup with auth (`MFi`).
    pub const PAIR_SETUP_AUTH: u8 = 1;
    /// Pair-Verify.
    pub const PAIR_VERIFY: u8 = 2;
    /// Add pairing.
    pub const ADD_PAIRING: u8 = 3;
    /// Remove pairing.
    pub const REMOVE_PAIRING: u8 = 4;
    /// List pairings.
    pub const LIST_PAIRINGS: u8 = 5;
}

/// Error codes from the device.
pub mod errors {
    pub const UNKNOWN: u8 = 0x01;
    pub const AUTHENTICATION: u8 = 0x02;
    pub const BACKOFF: u8 = 0x03;
    pub const MAX_PEERS: u8 = 0x04;
    pub const MAX_TRIES: u8 = 0x05;
    pub const UNAVAILABLE: u8 = 0x06;
    pub const BUSY: u8 = 0x07;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_entry() {
        let encoded = TlvEncoder::new()
            .add_method(0)
            .add_sequence(1)
            .add_bytes(TlvType::PublicKey, &[0xAA; 32])
            .build();
        let decoded = TlvDecoder::decode(&encoded).unwrap();
        assert_eq!(decoded.get_u8(TlvType::Method), Some(0));
        assert_eq!(decoded.get_sequence().unwrap(), 1);
        assert_eq!(decoded.get(TlvType::PublicKey), Some([0xAAu8; 32].as_slice()));
    }

    #[test]
    fn fragments_values_over_255_bytes_and_reassembles() {
        let value = vec![0x42u8; 512];
        let encoded = TlvEncoder::new().add(TlvType::Certificate, &value).build();
        // Three chunks: 255, 255, 2.
        assert_eq!(encoded[1], 255);
        assert_eq!(encoded[2 + 255], 255);
        assert_eq!(encoded[2 + 255 + 2 + 255], 2);
        let decoded = TlvDecoder::decode(&encoded).unwrap();
        assert_eq!(decoded.get(TlvType::Certificate), Some(value.as_slice()));
    }

    #[test]
    fn empty_value_encodes_as_zero_length_entry() {
        let encoded = TlvEncoder::new().add(TlvType::Error, &[]).build();
        assert_eq!(encoded, vec![TlvType::Error as u8, 0]);
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        assert!(matches!(
            TlvDecoder::decode(&[0x01]),
            Err(TlvError::BufferTooSmall)
        ));
        assert!(matches!(
            TlvDecoder::decode(&[0x01, 0x05, 0xAA]),
            Err(TlvError::BufferTooSmall)
        ));
    }

    #[test]
    fn unknown_tag_byte_round_trips_via_raw_lookup() {
        assert_eq!(TlvType::from_byte(0xFE), None);
        assert_eq!(TlvType::from_byte(0x11), Some(TlvType::Name));
    }
}
