//! Conversion between typed values and raw data block bytes.
//!
//! S7 data blocks store words big-endian. Writes are byte-granular, so a
//! single bit is written by reading the containing byte, flipping the bit and
//! writing the byte back.

use serde::Serialize;
use serde_json::Number;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while converting values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid value type '{0}' (expected bool, byte or int)")]
    InvalidType(String),
    #[error("{value_type} needs {needed} byte(s), got {got}")]
    ShortBuffer {
        value_type: ValueType,
        needed: usize,
        got: usize,
    },
    #[error("bit offset {0} out of range (0-7)")]
    BitOffset(u8),
}

/// Type of a subscribed or written location.
///
/// The wire names are `bool`, `byte` and `int`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueType {
    /// A single bit inside a byte.
    #[serde(rename = "bool")]
    Bit,
    /// An unsigned 8-bit byte.
    #[serde(rename = "byte")]
    Byte,
    /// A signed 16-bit word, big-endian on the device.
    #[serde(rename = "int")]
    Word,
}

impl ValueType {
    /// Number of bytes read from or written to the device.
    pub fn width(self) -> usize {
        match self {
            ValueType::Bit | ValueType::Byte => 1,
            ValueType::Word => 2,
        }
    }

    /// Wire name of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Bit => "bool",
            ValueType::Byte => "byte",
            ValueType::Word => "int",
        }
    }

    /// The value reported when nothing better is known.
    pub fn zero(self) -> PlcValue {
        match self {
            ValueType::Bit => PlcValue::Bit(false),
            ValueType::Byte => PlcValue::Byte(0),
            ValueType::Word => PlcValue::Word(0),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(ValueType::Bit),
            "byte" => Ok(ValueType::Byte),
            "int" => Ok(ValueType::Word),
            other => Err(CodecError::InvalidType(other.to_string())),
        }
    }
}

/// A decoded value. Serializes as a bare JSON boolean or number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PlcValue {
    Bit(bool),
    Byte(u8),
    Word(i16),
}

impl PlcValue {
    /// Type this value belongs to.
    pub fn value_type(&self) -> ValueType {
        match self {
            PlcValue::Bit(_) => ValueType::Bit,
            PlcValue::Byte(_) => ValueType::Byte,
            PlcValue::Word(_) => ValueType::Word,
        }
    }

    /// Build a byte value from an arbitrary integer, keeping the low 8 bits.
    pub fn byte_wrapping(n: i64) -> Self {
        PlcValue::Byte(n as u8)
    }

    /// Build a word value from an arbitrary integer, keeping the low 16 bits.
    ///
    /// `40000` becomes `-25536`; out-of-range input wraps instead of failing.
    pub fn word_wrapping(n: i64) -> Self {
        PlcValue::Word(n as u16 as i16)
    }
}

/// Integer part of a JSON number. Fractions truncate toward zero, as a C
/// cast would; values past the `i64` range saturate.
pub fn truncate_number(n: &Number) -> Option<i64> {
    n.as_i64()
        .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
        .or_else(|| n.as_f64().map(|f| f as i64))
}

fn check_bit(bit: u8) -> Result<u8, CodecError> {
    if bit > 7 {
        return Err(CodecError::BitOffset(bit));
    }
    Ok(1 << bit)
}

/// Decode the bytes read at an address.
///
/// `bit` is only consulted for [`ValueType::Bit`].
pub fn decode(value_type: ValueType, bit: u8, raw: &[u8]) -> Result<PlcValue, CodecError> {
    if raw.len() < value_type.width() {
        return Err(CodecError::ShortBuffer {
            value_type,
            needed: value_type.width(),
            got: raw.len(),
        });
    }

    match value_type {
        ValueType::Bit => {
            let mask = check_bit(bit)?;
            Ok(PlcValue::Bit(raw[0] & mask != 0))
        }
        ValueType::Byte => Ok(PlcValue::Byte(raw[0])),
        ValueType::Word => Ok(PlcValue::Word(i16::from_be_bytes([raw[0], raw[1]]))),
    }
}

/// Set or clear one bit of `existing`, leaving the other seven untouched.
pub fn encode_bit(existing: u8, bit: u8, value: bool) -> Result<u8, CodecError> {
    let mask = check_bit(bit)?;
    Ok(if value {
        existing | mask
    } else {
        existing & !mask
    })
}

/// How a value has to be written to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePlan {
    /// Read the byte, apply [`encode_bit`], write it back.
    ReadModifyWrite { bit: u8, value: bool },
    /// Write these bytes as they are.
    Direct(Vec<u8>),
}

/// Work out the device access needed to store `value`.
pub fn plan_write(value: PlcValue, bit: u8) -> WritePlan {
    match value {
        PlcValue::Bit(value) => WritePlan::ReadModifyWrite { bit, value },
        PlcValue::Byte(b) => WritePlan::Direct(vec![b]),
        PlcValue::Word(w) => WritePlan::Direct(w.to_be_bytes().to_vec()),
    }
}
