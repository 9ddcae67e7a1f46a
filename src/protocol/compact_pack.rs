//! The compact typed binary format carried inside Companion Link payloads.
//!
//! Value space: null, bool, integers (1/2/4/8 byte, little-endian), a
//! 64-bit float, utf-8 strings, byte sequences, arrays, and ordered maps.
//! Tag assignment follows the Companion protocol exactly; see [`Value`] and
//! [`encode`]/[`decode`].

use std::collections::BTreeMap;
use thiserror::Error;

/// A compact-pack value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Ordered key/value pairs. Order is preserved on the wire, hence a
    /// `Vec` rather than a `HashMap`.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Convenience constructor for a string-keyed map, the common shape
    /// for Companion request/response bodies.
    #[must_use]
    pub fn map(entries: Vec<(&str, Value)>) -> Self {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::String(k.to_string()), v))
                .collect(),
        )
    }

    /// Look up a string key in a `Map` value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find_map(|(k, v)| match k {
                Value::String(s) if s == key => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }
}

/// Compact-pack decoding errors.
#[derive(Debug, Error)]
pub enum CompactPackError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unknown tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("invalid utf-8 string")]
    InvalidUtf8,

    #[error("trailing bytes after decoded value")]
    TrailingBytes,
}

const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x01;
const TAG_NULL: u8 = 0x04;
const TAG_SMALL_INT_BASE: u8 = 0x08;
const SMALL_INT_MAX: i64 = 39;
const TAG_INT8: u8 = 0x30;
const TAG_INT16: u8 = 0x31;
const TAG_INT32: u8 = 0x32;
const TAG_INT64: u8 = 0x33;
const TAG_FLOAT64: u8 = 0x36;
const TAG_STRING_INLINE_BASE: u8 = 0x40;
const STRING_INLINE_MAX: usize = 32;
const TAG_STRING_U8: u8 = 0x61;
const TAG_STRING_U16: u8 = 0x62;
const TAG_STRING_U24: u8 = 0x63;
const TAG_STRING_U32: u8 = 0x64;
const TAG_BYTES_INLINE_BASE: u8 = 0x70;
const BYTES_INLINE_MAX: usize = 32;
const TAG_BYTES_U8: u8 = 0x91;
const TAG_BYTES_U16: u8 = 0x92;
const TAG_BYTES_U32: u8 = 0x93;
const TAG_ARRAY_BASE: u8 = 0xD0;
const ARRAY_INLINE_MAX: usize = 14;
const TAG_ARRAY_EXT: u8 = 0xDF;
const TAG_MAP_BASE: u8 = 0xE0;
const MAP_INLINE_MAX: usize = 14;
const TAG_MAP_EXT: u8 = 0xEF;
const TAG_TERMINATOR: u8 = 0x03;

/// Encode a value to its compact-pack byte representation.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(true) => buf.push(TAG_TRUE),
        Value::Bool(false) => buf.push(TAG_FALSE),
        Value::Int(n) => encode_int(*n, buf),
        Value::Float(f) => {
            buf.push(TAG_FLOAT64);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Value::String(s) => encode_string(s, buf),
        Value::Bytes(b) => encode_bytes(b, buf),
        Value::Array(items) => encode_array(items, buf),
        Value::Map(entries) => encode_map(entries, buf),
    }
}

fn encode_int(n: i64, buf: &mut Vec<u8>) {
    if (0..=SMALL_INT_MAX).contains(&n) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        buf.push(TAG_SMALL_INT_BASE + n as u8);
        return;
    }
    if let Ok(v) = i8::try_from(n) {
        buf.push(TAG_INT8);
        buf.push(v as u8);
    } else if let Ok(v) = i16::try_from(n) {
        buf.push(TAG_INT16);
        buf.extend_from_slice(&v.to_le_bytes());
    } else if let Ok(v) = i32::try_from(n) {
        buf.push(TAG_INT32);
        buf.extend_from_slice(&v.to_le_bytes());
    } else {
        buf.push(TAG_INT64);
        buf.extend_from_slice(&n.to_le_bytes());
    }
}

fn encode_string(s: &str, buf: &mut Vec<u8>) {
    let bytes = s.as_bytes();
    if bytes.len() <= STRING_INLINE_MAX {
        #[allow(clippy::cast_possible_truncation)]
        buf.push(TAG_STRING_INLINE_BASE + bytes.len() as u8);
        buf.extend_from_slice(bytes);
        return;
    }
    let len = bytes.len();
    if let Ok(len8) = u8::try_from(len) {
        buf.push(TAG_STRING_U8);
        buf.push(len8);
    } else if let Ok(len16) = u16::try_from(len) {
        buf.push(TAG_STRING_U16);
        buf.extend_from_slice(&len16.to_le_bytes());
    } else if len <= 0xFF_FFFF {
        buf.push(TAG_STRING_U24);
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&(len as u32).to_le_bytes()[..3]);
    } else {
        buf.push(TAG_STRING_U32);
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&(len as u32).to_le_bytes());
    }
    buf.extend_from_slice(bytes);
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    if bytes.len() <= BYTES_INLINE_MAX {
        #[allow(clippy::cast_possible_truncation)]
        buf.push(TAG_BYTES_INLINE_BASE + bytes.len() as u8);
        buf.extend_from_slice(bytes);
        return;
    }
    let len = bytes.len();
    if let Ok(len8) = u8::try_from(len) {
        buf.push(TAG_BYTES_U8);
        buf.push(len8);
    } else if let Ok(len16) = u16::try_from(len) {
        buf.push(TAG_BYTES_U16);
        buf.extend_from_slice(&len16.to_le_bytes());
    } else {
        buf.push(TAG_BYTES_U32);
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&(len as u32).to_le_bytes());
    }
    buf.extend_from_slice(bytes);
}

fn encode_array(items: &[Value], buf: &mut Vec<u8>) {
    if items.len() < ARRAY_INLINE_MAX + 1 {
        #[allow(clippy::cast_possible_truncation)]
        buf.push(TAG_ARRAY_BASE + items.len() as u8);
    } else {
        buf.push(TAG_ARRAY_EXT);
    }
    for item in items {
        encode_into(item, buf);
    }
    if items.len() >= ARRAY_INLINE_MAX + 1 {
        buf.push(TAG_TERMINATOR);
    }
}

fn encode_map(entries: &[(Value, Value)], buf: &mut Vec<u8>) {
    if entries.len() < MAP_INLINE_MAX + 1 {
        #[allow(clippy::cast_possible_truncation)]
        buf.push(TAG_MAP_BASE + (entries.len() * 2) as u8);
    } else {
        buf.push(TAG_MAP_EXT);
    }
    for (k, v) in entries {
        encode_into(k, buf);
        encode_into(v, buf);
    }
    if entries.len() >= MAP_INLINE_MAX + 1 {
        buf.push(TAG_TERMINATOR);
    }
}

/// Decode a single compact-pack value, requiring the entire input to be
/// consumed.
///
/// # Errors
///
/// Returns an error on truncated input, unknown tags, or trailing bytes.
pub fn decode(data: &[u8]) -> Result<Value, CompactPackError> {
    let mut pos = 0;
    let value = decode_value(data, &mut pos)?;
    if pos != data.len() {
        return Err(CompactPackError::TrailingBytes);
    }
    Ok(value)
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], CompactPackError> {
    if *pos + len > data.len() {
        return Err(CompactPackError::UnexpectedEof);
    }
    let slice = &data[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

fn take_u8(data: &[u8], pos: &mut usize) -> Result<u8, CompactPackError> {
    Ok(take(data, pos, 1)?[0])
}

fn decode_value(data: &[u8], pos: &mut usize) -> Result<Value, CompactPackError> {
    let tag = take_u8(data, pos)?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_FALSE => Ok(Value::Bool(false)),
        t if (TAG_SMALL_INT_BASE..=TAG_SMALL_INT_BASE + SMALL_INT_MAX as u8).contains(&t) => {
            Ok(Value::Int(i64::from(t - TAG_SMALL_INT_BASE)))
        }
        TAG_INT8 => {
            let b = take_u8(data, pos)?;
            Ok(Value::Int(i64::from(b as i8)))
        }
        TAG_INT16 => {
            let bytes = take(data, pos, 2)?;
            Ok(Value::Int(i64::from(i16::from_le_bytes(
                bytes.try_into().unwrap(),
            ))))
        }
        TAG_INT32 => {
            let bytes = take(data, pos, 4)?;
            Ok(Value::Int(i64::from(i32::from_le_bytes(
                bytes.try_into().unwrap(),
            ))))
        }
        TAG_INT64 => {
            let bytes = take(data, pos, 8)?;
            Ok(Value::Int(i64::from_le_bytes(bytes.try_into().unwrap())))
        }
        TAG_FLOAT64 => {
            let bytes = take(data, pos, 8)?;
            Ok(Value::Float(f64::from_le_bytes(bytes.try_into().unwrap())))
        }
        t if (TAG_STRING_INLINE_BASE..=TAG_STRING_INLINE_BASE + STRING_INLINE_MAX as u8)
            .contains(&t) =>
        {
            let len = (t - TAG_STRING_INLINE_BASE) as usize;
            decode_string(data, pos, len)
        }
        TAG_STRING_U8 => {
            let len = take_u8(data, pos)? as usize;
            decode_string(data, pos, len)
        }
        TAG_STRING_U16 => {
            let bytes = take(data, pos, 2)?;
            let len = u16::from_le_bytes(bytes.try_into().unwrap()) as usize;
            decode_string(data, pos, len)
        }
        TAG_STRING_U24 => {
            let bytes = take(data, pos, 3)?;
            let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) as usize;
            decode_string(data, pos, len)
        }
        TAG_STRING_U32 => {
            let bytes = take(data, pos, 4)?;
            let len = u32::from_le_bytes(bytes.try_into().unwrap()) as usize;
            decode_string(data, pos, len)
        }
        t if (TAG_BYTES_INLINE_BASE..=TAG_BYTES_INLINE_BASE + BYTES_INLINE_MAX as u8)
            .contains(&t) =>
        {
            let len = (t - TAG_BYTES_INLINE_BASE) as usize;
            Ok(Value::Bytes(take(data, pos, len)?.to_vec()))
        }
        TAG_BYTES_U8 => {
            let len = take_u8(data, pos)? as usize;
            Ok(Value::Bytes(take(data, pos, len)?.to_vec()))
        }
        TAG_BYTES_U16 => {
            let bytes = take(data, pos, 2)?;
            let len = u16::from_le_bytes(bytes.try_into().unwrap()) as usize;
            Ok(Value::Bytes(take(data, pos, len)?.to_vec()))
        }
        TAG_BYTES_U32 => {
            let bytes = take(data, pos, 4)?;
            let len = u32::from_le_bytes(bytes.try_into().unwrap()) as usize;
            Ok(Value::Bytes(take(data, pos, len)?.to_vec()))
        }
        t if (TAG_ARRAY_BASE..=TAG_ARRAY_BASE + ARRAY_INLINE_MAX as u8).contains(&t) => {
            let count = (t - TAG_ARRAY_BASE) as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(data, pos)?);
            }
            Ok(Value::Array(items))
        }
        TAG_ARRAY_EXT => {
            let mut items = Vec::new();
            while take_peek(data, *pos)? != TAG_TERMINATOR {
                items.push(decode_value(data, pos)?);
            }
            *pos += 1;
            Ok(Value::Array(items))
        }
        t if (TAG_MAP_BASE..=TAG_MAP_BASE + (MAP_INLINE_MAX as u8 * 2)).contains(&t)
            && (t - TAG_MAP_BASE) % 2 == 0 =>
        {
            let count = ((t - TAG_MAP_BASE) / 2) as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let k = decode_value(data, pos)?;
                let v = decode_value(data, pos)?;
                entries.push((k, v));
            }
            Ok(Value::Map(entries))
        }
        TAG_MAP_EXT => {
            let mut entries = Vec::new();
            while take_peek(data, *pos)? != TAG_TERMINATOR {
                let k = decode_value(data, pos)?;
                let v = decode_value(data, pos)?;
                entries.push((k, v));
            }
            *pos += 1;
            Ok(Value::Map(entries))
        }
        other => Err(CompactPackError::UnknownTag(other)),
    }
}

fn take_peek(data: &[u8], pos: usize) -> Result<u8, CompactPackError> {
    data.get(pos).copied().ok_or(CompactPackError::UnexpectedEof)
}

fn decode_string(data: &[u8], pos: &mut usize, len: usize) -> Result<Value, CompactPackError> {
    let bytes = take(data, pos, len)?;
    String::from_utf8(bytes.to_vec())
        .map(Value::String)
        .map_err(|_| CompactPackError::InvalidUtf8)
}

/// Build a `BTreeMap<String, Value>` view of a map value's string keys,
/// for convenient field lookup. Non-string keys are skipped.
#[must_use]
pub fn as_string_map(value: &Value) -> BTreeMap<String, Value> {
    match value {
        Value::Map(entries) => entries
            .iter()
            .filter_map(|(k, v)| match k {
                Value::String(s) => Some((s.clone(), v.clone())),
                _ => None,
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_tag_assignment_matches_spec_examples() {
        assert_eq!(encode(&Value::Int(0)), vec![0x08]);
        assert_eq!(encode(&Value::Int(20)), vec![0x1C]);
        assert_eq!(encode(&Value::Int(-1)), vec![0x30, 0xFF]);
        assert_eq!(encode(&Value::Int(256)), vec![0x31, 0x00, 0x01]);
        assert_eq!(
            encode(&Value::String("hi".to_string())),
            vec![0x42, 0x68, 0x69]
        );
    }

    #[test]
    fn round_trips_all_scalar_kinds() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(39),
            Value::Int(40),
            Value::Int(-128),
            Value::Int(70_000),
            Value::Int(i64::MAX),
            Value::Float(3.5),
            Value::String("x".repeat(32)),
            Value::String("x".repeat(33)),
            Value::Bytes(vec![1, 2, 3]),
            Value::Bytes(vec![0xAB; 300]),
        ] {
            let encoded = encode(&value);
            assert_eq!(decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn round_trips_arrays_and_maps_at_inline_boundary() {
        let small_array = Value::Array((0..14).map(Value::Int).collect());
        assert_eq!(decode(&encode(&small_array)).unwrap(), small_array);

        let big_array = Value::Array((0..20).map(Value::Int).collect());
        let encoded = encode(&big_array);
        assert_eq!(encoded[0], TAG_ARRAY_EXT);
        assert_eq!(decode(&encoded).unwrap(), big_array);

        let map = Value::map(vec![("_i", Value::String("abc".into())), ("_x", Value::Int(1))]);
        assert_eq!(decode(&encode(&map)).unwrap(), map);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(decode(&[0xFF]), Err(CompactPackError::UnknownTag(0xFF))));
    }

    #[test]
    fn get_looks_up_string_keyed_map_entries() {
        let map = Value::map(vec![("_x", Value::Int(5))]);
        assert_eq!(map.get("_x"), Some(&Value::Int(5)));
        assert_eq!(map.get("missing"), None);
    }
}
