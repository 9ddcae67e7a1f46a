use plist::{Dictionary, Value as PlistValue};
use thiserror::Error;
use std::io::Cursor;

const HEADER_LEN: usize = 32;

/// Errors building or parsing a DataStream frame.
#[derive(Debug, Error)]
pub enum DataStreamError {
    #[error("frame shorter than the 32-byte header")]
    TooShort,

    #[error("unrecognized message type bytes")]
    UnknownMessageType,

    #[error("property-list decode failed: {0}")]
    Plist(#[from] plist::Error),

    #[error("payload is missing the expected params.data entry")]
    MissingPayload,

    #[error("truncated protobuf length varint")]
    TruncatedVarint,
}

/// The two DataStream message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Sync,
    Reply,
}

impl MessageKind {
    fn as_ascii(self) -> [u8; 4] {
        match self {
            MessageKind::Sync => *b"sync",
            MessageKind::Reply => *b"rply",
        }
    }

    fn from_ascii(bytes: [u8; 4]) -> Option<Self> {
        match &bytes {
            b"sync" => Some(MessageKind::Sync),
            b"rply" => Some(MessageKind::Reply),
            _ => None,
        }
    }
}

/// A decoded DataStream frame: 32-byte header plus, for `sync` frames, a
/// plist-wrapped protobuf payload.
#[derive(Debug, Clone)]
pub struct DataStreamFrame {
    pub kind: MessageKind,
    pub sequence: u64,
    /// Raw protobuf bytes, present only on `sync` frames.
    pub protobuf_payload: Vec<u8>,
}

impl DataStreamFrame {
    /// Build an outbound `sync` frame carrying `protobuf_payload`.
    #[must_use]
    pub fn sync(sequence: u64, protobuf_payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Sync,
            sequence,
            protobuf_payload,
        }
    }

    /// Build a header-only `rply` frame acknowledging `sequence`.
    #[must_use]
    pub fn reply(sequence: u64) -> Self {
        Self {
            kind: MessageKind::Reply,
            sequence,
            protobuf_payload: Vec::new(),
        }
    }

    /// Encode the frame to bytes: 32-byte header followed by the
    /// plist-wrapped payload (empty for `rply` frames).
    ///
    /// # Errors
    ///
    /// Returns an error if the plist payload cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, DataStreamError> {
        let payload = if self.protobuf_payload.is_empty() {
            Vec::new()
        } else {
            encode_payload(&self.protobuf_payload)?
        };

        let total_size = (HEADER_LEN + payload.len()) as u32;
        let mut buf = Vec::with_capacity(total_size as usize);
        buf.extend_from_slice(&total_size.to_be_bytes());
        buf.extend_from_slice(&self.kind.as_ascii());
        buf.extend_from_slice(&[0u8; 8]);
        match self.kind {
            MessageKind::Sync => buf.extend_from_slice(b"comm"),
            MessageKind::Reply => buf.extend_from_slice(&[0u8; 4]),
        }
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Parse a single frame from the front of `buf`. Returns the frame
    /// and the number of bytes consumed, or `Ok(None)` if `buf` does not
    /// yet contain a complete frame.
    ///
    /// # Errors
    ///
    /// Returns an error on a malformed header or payload.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, DataStreamError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let total_size = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < total_size {
            return Ok(None);
        }
        if total_size < HEADER_LEN {
            return Err(DataStreamError::TooShort);
        }

        let kind = MessageKind::from_ascii(buf[4..8].try_into().unwrap())
            .ok_or(DataStreamError::UnknownMessageType)?;
        let sequence = u64::from_be_bytes(buf[20..28].try_into().unwrap());

        let payload_bytes = &buf[HEADER_LEN..total_size];
        let protobuf_payload = if payload_bytes.is_empty() {
            Vec::new()
        } else {
            decode_payload(payload_bytes)?
        };

        Ok(Some((
            Self {
                kind,
                sequence,
                protobuf_payload,
            },
            total_size,
        )))
    }
}

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn decode_varint(bytes: &[u8]) -> Result<(u64, usize), DataStreamError> {
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(DataStreamError::TruncatedVarint)
}

fn encode_payload(protobuf_bytes: &[u8]) -> Result<Vec<u8>, DataStreamError> {
    let mut data = Vec::with_capacity(10 + protobuf_bytes.len());
    encode_varint(protobuf_bytes.len() as u64, &mut data);
    data.extend_from_slice(protobuf_bytes);

    let mut params = Dictionary::new();
    params.insert("data".to_string(), PlistValue::Data(data));
    let mut root = Dictionary::new();
    root.insert("params".to_string(), PlistValue::Dictionary(params));

    let mut out = Vec::new();
    plist::to_writer_binary(&mut out, &PlistValue::Dictionary(root))?;
    Ok(out)
}

fn decode_payload(bytes: &[u8]) -> Result<Vec<u8>, DataStreamError> {
    let value = PlistValue::from_reader(Cursor::new(bytes))?;
    let data = value
        .as_dictionary()
        .and_then(|root| root.get("params"))
        .and_then(PlistValue::as_dictionary)
        .and_then(|params| params.get("data"))
        .and_then(PlistValue::as_data)
        .ok_or(DataStreamError::MissingPayload)?;

    let (len, offset) = decode_varint(data)?;
    let end = offset + len as usize;
    if end > data.len() {
        return Err(DataStreamError::TruncatedVarint);
    }
    Ok(data[offset..end].to_vec())
}
