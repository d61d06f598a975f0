//! Self-describing binary document codec.
//!
//! This module implements the wire format for a CrushDB document body: an ordered
//! sequence of `(field name, typed value)` pairs encoded big-endian, with a one-byte
//! type tag driving decode. The codec is stateless — it knows nothing about pages,
//! offsets, or compression; the page layer (see [`super::page`]) prepends and strips
//! the per-document metadata frame around the bytes this module produces.
//!
//! # Wire format
//!
//! ```text
//! repeat for each field:
//!   u16 keyLen; bytes[keyLen] key (UTF-8);
//!   u8 typeTag;
//!   value-by-type
//! ```
//!
//! Values: STRING `u16 len; bytes[len]`; INT `i32`; LONG `i64`; FLOAT `f32`; DOUBLE
//! `f64`; BOOLEAN `u8 in {0,1}`. All integers are big-endian.

use ordered_float::OrderedFloat;
use thiserror::Error;

/// Closed set of value types a document field may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BsonType {
    String,
    Int,
    Long,
    Float,
    Double,
    Boolean,
}

impl BsonType {
    fn tag(self) -> u8 {
        match self {
            BsonType::String => 0x01,
            BsonType::Int => 0x02,
            BsonType::Long => 0x03,
            BsonType::Float => 0x04,
            BsonType::Double => 0x05,
            BsonType::Boolean => 0x06,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0x01 => Ok(BsonType::String),
            0x02 => Ok(BsonType::Int),
            0x03 => Ok(BsonType::Long),
            0x04 => Ok(BsonType::Float),
            0x05 => Ok(BsonType::Double),
            0x06 => Ok(BsonType::Boolean),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

/// A single typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum BsonValue {
    String(String),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
}

impl BsonValue {
    #[must_use]
    pub fn value_type(&self) -> BsonType {
        match self {
            BsonValue::String(_) => BsonType::String,
            BsonValue::Int(_) => BsonType::Int,
            BsonValue::Long(_) => BsonType::Long,
            BsonValue::Float(_) => BsonType::Float,
            BsonValue::Double(_) => BsonType::Double,
            BsonValue::Boolean(_) => BsonType::Boolean,
        }
    }

    /// Converts this value into the ordered-index key representation, rejecting
    /// mismatches against `expected`.
    pub fn into_index_key(self, expected: BsonType) -> Result<IndexKey, CodecError> {
        if self.value_type() != expected {
            return Err(CodecError::TypeMismatch {
                expected,
                actual: self.value_type(),
            });
        }
        Ok(match self {
            BsonValue::String(s) => IndexKey::Str(s),
            BsonValue::Int(v) => IndexKey::Int(v),
            BsonValue::Long(v) => IndexKey::Long(v),
            BsonValue::Float(v) => IndexKey::Float(OrderedFloat(v)),
            BsonValue::Double(v) => IndexKey::Double(OrderedFloat(v)),
            BsonValue::Boolean(v) => IndexKey::Bool(v),
        })
    }
}

/// Totally-ordered index key derived from a [`BsonValue`]; the currency B+Tree nodes
/// store and compare.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexKey {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(OrderedFloat<f32>),
    Double(OrderedFloat<f64>),
    Str(String),
}

impl IndexKey {
    #[must_use]
    pub fn value_type(&self) -> BsonType {
        match self {
            IndexKey::Str(_) => BsonType::String,
            IndexKey::Int(_) => BsonType::Int,
            IndexKey::Long(_) => BsonType::Long,
            IndexKey::Float(_) => BsonType::Float,
            IndexKey::Double(_) => BsonType::Double,
            IndexKey::Bool(_) => BsonType::Boolean,
        }
    }
}

/// A document's ordered field map: insertion order is preserved so re-encoding
/// reproduces the original byte layout.
pub type FieldMap = Vec<(String, BsonValue)>;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("unknown type tag 0x{0:02x} in document body")]
    UnknownTag(u8),
    #[error("document body truncated while decoding field")]
    Truncated,
    #[error("field key is not valid UTF-8")]
    InvalidUtf8,
    #[error("expected index key type {expected:?}, found {actual:?}")]
    TypeMismatch { expected: BsonType, actual: BsonType },
}

/// Encodes a field map into the big-endian body layout described above.
#[must_use]
pub fn encode(fields: &FieldMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in fields {
        let key_bytes = key.as_bytes();
        out.extend_from_slice(&(key_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(key_bytes);
        out.push(value.value_type().tag());
        match value {
            BsonValue::String(s) => {
                let bytes = s.as_bytes();
                out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            BsonValue::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            BsonValue::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
            BsonValue::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
            BsonValue::Double(v) => out.extend_from_slice(&v.to_be_bytes()),
            BsonValue::Boolean(v) => out.push(if *v { 1 } else { 0 }),
        }
    }
    out
}

/// Decodes a full body buffer (exactly `bytes.len()` consumed) into a field map.
pub fn decode(bytes: &[u8]) -> Result<FieldMap, CodecError> {
    let mut cursor = Cursor::new(bytes);
    let mut fields = Vec::new();
    while cursor.remaining() > 0 {
        fields.push(decode_field(&mut cursor)?);
    }
    Ok(fields)
}

fn decode_field(cursor: &mut Cursor<'_>) -> Result<(String, BsonValue), CodecError> {
    let key_len = cursor.read_u16()? as usize;
    let key_bytes = cursor.read_bytes(key_len)?;
    let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
    let tag = cursor.read_u8()?;
    let value = match BsonType::from_tag(tag)? {
        BsonType::String => {
            let len = cursor.read_u16()? as usize;
            let bytes = cursor.read_bytes(len)?;
            BsonValue::String(String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)?)
        }
        BsonType::Int => BsonValue::Int(i32::from_be_bytes(cursor.read_array::<4>()?)),
        BsonType::Long => BsonValue::Long(i64::from_be_bytes(cursor.read_array::<8>()?)),
        BsonType::Float => BsonValue::Float(f32::from_be_bytes(cursor.read_array::<4>()?)),
        BsonType::Double => BsonValue::Double(f64::from_be_bytes(cursor.read_array::<8>()?)),
        BsonType::Boolean => BsonValue::Boolean(cursor.read_u8()? != 0),
    };
    Ok((key, value))
}

/// Minimal byte cursor; kept local to the codec since its only job is to drive
/// sequential big-endian reads over a body slice.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        let b = *self.bytes.get(self.pos).ok_or(CodecError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.read_array::<2>()?))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let slice = self.read_bytes(N)?;
        slice.try_into().map_err(|_| CodecError::Truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_types() {
        let fields: FieldMap = vec![
            ("name".to_string(), BsonValue::String("Subaru".to_string())),
            ("year".to_string(), BsonValue::Int(2024)),
            ("vin".to_string(), BsonValue::Long(123_456_789_012)),
            ("price".to_string(), BsonValue::Float(27999.5)),
            ("mileage".to_string(), BsonValue::Double(12345.678)),
            ("used".to_string(), BsonValue::Boolean(false)),
        ];

        let bytes = encode(&fields);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn decode_empty_body() {
        assert_eq!(decode(&[]).unwrap(), vec![]);
    }

    #[test]
    fn unknown_tag_is_fatal() {
        // one field with a valid 0-length key and an invalid type tag
        let bytes = vec![0x00, 0x00, 0xff];
        assert_eq!(decode(&bytes), Err(CodecError::UnknownTag(0xff)));
    }

    #[test]
    fn truncated_body_is_rejected() {
        // key length says 4 bytes but only 1 is present
        let bytes = vec![0x00, 0x04, b'a'];
        assert_eq!(decode(&bytes), Err(CodecError::Truncated));
    }

    #[test]
    fn index_key_type_mismatch_is_rejected() {
        let err = BsonValue::Int(1).into_index_key(BsonType::String).unwrap_err();
        assert_eq!(
            err,
            CodecError::TypeMismatch {
                expected: BsonType::String,
                actual: BsonType::Int
            }
        );
    }

    #[test]
    fn preserves_field_order() {
        let fields: FieldMap = vec![
            ("b".to_string(), BsonValue::Int(2)),
            ("a".to_string(), BsonValue::Int(1)),
        ];
        let decoded = decode(&encode(&fields)).unwrap();
        assert_eq!(decoded[0].0, "b");
        assert_eq!(decoded[1].0, "a");
    }
}
