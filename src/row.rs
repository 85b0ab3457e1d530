//! Row representation and serialization.
//!
//! A [`Row`] is one result row, consisting of multiple [`Value`]s. Rows are
//! encoded to a compact, self-describing binary form before they are appended
//! to a row buffer store, so the store never needs the column schema to read
//! them back.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::datum::{Kind, Value};

/// Tag byte for SQL NULL.
const NULL_TAG: u8 = 0;

/// Errors from row decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ended before the row was complete.
    #[error("buffer too small: need {required} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required.
        required: usize,
        /// Bytes available.
        available: usize,
    },
    /// A value carried a tag that does not name a known type.
    #[error("unknown value tag: {0}")]
    UnknownTag(u8),
    /// A text value was not valid UTF-8.
    #[error("invalid UTF-8 in text value")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Returns `CodecError::BufferTooSmall` if fewer than `$required` bytes remain.
macro_rules! ensure_remaining {
    ($buf:expr, $required:expr) => {
        if $buf.remaining() < $required {
            return Err(CodecError::BufferTooSmall {
                required: $required,
                available: $buf.remaining(),
            });
        }
    };
}

/// A single result row.
///
/// # Serialization Format
///
/// ```text
/// +----------------------------+
/// | Column count (u32 LE)      |
/// +----------------------------+
/// | Tag[0] | Payload[0]        |  tag 0 = NULL, no payload
/// | Tag[1] | Payload[1]        |  text/bytes: u32 LE length + data
/// | ...                        |
/// +----------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    /// Column values in order.
    pub values: Vec<Value>,
}

impl Row {
    /// Creates a new row with the given values.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the encoded size of this row in bytes.
    pub fn encoded_size(&self) -> usize {
        let payload: usize = self
            .values
            .iter()
            .map(|v| match v {
                Value::Null => 0,
                Value::Text(s) => 4 + s.len(),
                Value::Bytes(b) => 4 + b.len(),
                other => other
                    .kind()
                    .and_then(Kind::fixed_size)
                    .unwrap_or_default(),
            })
            .sum();
        4 + self.values.len() + payload
    }

    /// Appends the encoded row to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_size());
        dst.put_u32_le(self.values.len() as u32);
        for value in &self.values {
            let Some(kind) = value.kind() else {
                dst.put_u8(NULL_TAG);
                continue;
            };
            dst.put_u8(kind.tag());
            match value {
                Value::Null => {}
                Value::Boolean(b) => dst.put_u8(u8::from(*b)),
                Value::Int16(n) => dst.put_i16_le(*n),
                Value::Int32(n) => dst.put_i32_le(*n),
                Value::Int64(n) => dst.put_i64_le(*n),
                Value::Float32(n) => dst.put_f32_le(*n),
                Value::Float64(n) => dst.put_f64_le(*n),
                Value::Text(s) => {
                    dst.put_u32_le(s.len() as u32);
                    dst.put_slice(s.as_bytes());
                }
                Value::Bytes(b) => {
                    dst.put_u32_le(b.len() as u32);
                    dst.put_slice(b);
                }
            }
        }
    }

    /// Decodes one row from the front of `src`, advancing it past the row.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is truncated or malformed.
    pub fn decode(src: &mut impl Buf) -> Result<Self, CodecError> {
        ensure_remaining!(src, 4);
        let num_cols = src.get_u32_le() as usize;
        // Every value takes at least its tag byte
        let mut values = Vec::with_capacity(num_cols.min(src.remaining()));

        for _ in 0..num_cols {
            ensure_remaining!(src, 1);
            let tag = src.get_u8();
            if tag == NULL_TAG {
                values.push(Value::Null);
                continue;
            }
            let kind = Kind::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;
            if let Some(size) = kind.fixed_size() {
                ensure_remaining!(src, size);
            }
            let value = match kind {
                Kind::Boolean => Value::Boolean(src.get_u8() != 0),
                Kind::Int16 => Value::Int16(src.get_i16_le()),
                Kind::Int32 => Value::Int32(src.get_i32_le()),
                Kind::Int64 => Value::Int64(src.get_i64_le()),
                Kind::Float32 => Value::Float32(src.get_f32_le()),
                Kind::Float64 => Value::Float64(src.get_f64_le()),
                Kind::Text => Value::Text(String::from_utf8(get_length_prefixed(src)?)?),
                Kind::Bytes => Value::Bytes(get_length_prefixed(src)?),
            };
            values.push(value);
        }

        Ok(Row { values })
    }
}

/// Reads a u32 length prefix followed by that many bytes.
fn get_length_prefixed(src: &mut impl Buf) -> Result<Vec<u8>, CodecError> {
    ensure_remaining!(src, 4);
    let len = src.get_u32_le() as usize;
    ensure_remaining!(src, len);
    let mut data = vec![0u8; len];
    src.copy_to_slice(&mut data);
    Ok(data)
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row::new(values)
    }
}
