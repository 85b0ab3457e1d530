//! Result cells.
//!
//! A [`Value`] is one cell of a result row as read from the data source.
//! [`Kind`] names its storage class; the row codec writes the kind's
//! discriminant in front of every non-NULL cell.

use std::fmt::{self, Write as _};

/// Storage class of a non-NULL cell.
///
/// The discriminant is the codec tag. Zero is left free for NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Boolean = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    Float32 = 5,
    Float64 = 6,
    Text = 7,
    Bytes = 8,
}

impl Kind {
    /// Every kind, in tag order.
    pub const ALL: [Kind; 8] = [
        Kind::Boolean,
        Kind::Int16,
        Kind::Int32,
        Kind::Int64,
        Kind::Float32,
        Kind::Float64,
        Kind::Text,
        Kind::Bytes,
    ];

    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Looks up the kind written as `tag`, if any.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Encoded payload width of fixed-width kinds.
    ///
    /// Text and bytes are length-prefixed and return `None`.
    pub const fn fixed_size(self) -> Option<usize> {
        Some(match self {
            Kind::Boolean => 1,
            Kind::Int16 => 2,
            Kind::Int32 | Kind::Float32 => 4,
            Kind::Int64 | Kind::Float64 => 8,
            Kind::Text | Kind::Bytes => return None,
        })
    }
}

/// One cell of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Storage class of the cell, `None` when it is NULL.
    pub fn kind(&self) -> Option<Kind> {
        let kind = match self {
            Value::Null => return None,
            Value::Boolean(_) => Kind::Boolean,
            Value::Int16(_) => Kind::Int16,
            Value::Int32(_) => Kind::Int32,
            Value::Int64(_) => Kind::Int64,
            Value::Float32(_) => Kind::Float32,
            Value::Float64(_) => Kind::Float64,
            Value::Text(_) => Kind::Text,
            Value::Bytes(_) => Kind::Bytes,
        };
        Some(kind)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text shown for the cell in a results grid and in CSV exports.
    pub fn to_display(&self) -> String {
        self.to_string()
    }

    /// JSON form of the cell used by JSON exports.
    ///
    /// Non-finite floats and binary cells have no JSON number form and fall
    /// back to their display text.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Int16(n) => Json::from(*n),
            Value::Int32(n) => Json::from(*n),
            Value::Int64(n) => Json::from(*n),
            Value::Float32(n) => float_json(f64::from(*n)),
            Value::Float64(n) => float_json(*n),
            Value::Text(s) => Json::String(s.clone()),
            Value::Bytes(_) => Json::String(self.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Boolean(b) => f.write_char(if *b { '1' } else { '0' }),
            Value::Int16(n) => write!(f, "{n}"),
            Value::Int32(n) => write!(f, "{n}"),
            Value::Int64(n) => write!(f, "{n}"),
            Value::Float32(n) if n.is_finite() => write!(f, "{n}"),
            Value::Float32(n) => write_float(f, f64::from(*n)),
            Value::Float64(n) => write_float(f, *n),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(bytes) => {
                f.write_str("0x")?;
                bytes.iter().try_for_each(|b| write!(f, "{b:02X}"))
            }
        }
    }
}

fn write_float(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.is_nan() {
        f.write_str("NaN")
    } else if n.is_infinite() {
        f.write_str(if n > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        write!(f, "{n}")
    }
}

fn float_json(n: f64) -> serde_json::Value {
    match serde_json::Number::from_f64(n) {
        Some(number) => serde_json::Value::Number(number),
        None => serde_json::Value::String(Value::Float64(n).to_string()),
    }
}
