//! Host-side values exchanged with contracts.
//!
//! [`Value`] is the closed set of types the runtime can pass to a contract
//! entry point, receive back as a result, or see as a host-call argument.
//! Each value has a [`ValueType`] tag used by the marshalling layer and by
//! host parameter schemas.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Bool,
    String,
    Bytes,
}

impl ValueType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Bytes => "bytes",
        }
    }

    /// Strings and byte buffers live in linear memory as a `(ptr, len)` pair.
    pub const fn is_buffer(self) -> bool {
        matches!(self, Self::String | Self::Bytes)
    }

    /// Number of native words one value of this type occupies.
    pub const fn word_count(self) -> usize {
        if self.is_buffer() { 2 } else { 1 }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "i32" => Ok(Self::I32),
            "u32" => Ok(Self::U32),
            "i64" => Ok(Self::I64),
            "u64" => Ok(Self::U64),
            "f32" => Ok(Self::F32),
            "f64" => Ok(Self::F64),
            "bool" => Ok(Self::Bool),
            "string" | "str" => Ok(Self::String),
            "bytes" => Ok(Self::Bytes),
            other => Err(format!("unknown value type '{other}'")),
        }
    }
}

/// A typed host value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::U32(_) => ValueType::U32,
            Value::I64(_) => ValueType::I64,
            Value::U64(_) => ValueType::U64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::Bool(_) => ValueType::Bool,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
        }
    }

    /// Byte payload of a string or buffer value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Numeric view used by threat scoring. Buffers and strings have none.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I32(v) => Some(f64::from(*v)),
            Value::U32(v) => Some(f64::from(*v)),
            Value::I64(v) => Some(*v as f64),
            Value::U64(v) => Some(*v as f64),
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
            Value::Bool(_) | Value::String(_) | Value::Bytes(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "i32:{v}"),
            Value::U32(v) => write!(f, "u32:{v}"),
            Value::I64(v) => write!(f, "i64:{v}"),
            Value::U64(v) => write!(f, "u64:{v}"),
            Value::F32(v) => write!(f, "f32:{v}"),
            Value::F64(v) => write!(f, "f64:{v}"),
            Value::Bool(v) => write!(f, "bool:{v}"),
            Value::String(v) => write!(f, "string:{v}"),
            Value::Bytes(v) => {
                write!(f, "bytes:")?;
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Parses the `type:value` form used on the command line, e.g. `i32:2`,
/// `string:hello` or `bytes:deadbeef`.
impl FromStr for Value {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, raw) = s
            .split_once(':')
            .ok_or_else(|| format!("expected 'type:value', got '{s}'"))?;
        let ty: ValueType = ty.parse()?;
        let bad = |e: &dyn fmt::Display| format!("invalid {ty} '{raw}': {e}");

        Ok(match ty {
            ValueType::I32 => Value::I32(raw.parse().map_err(|e| bad(&e))?),
            ValueType::U32 => Value::U32(raw.parse().map_err(|e| bad(&e))?),
            ValueType::I64 => Value::I64(raw.parse().map_err(|e| bad(&e))?),
            ValueType::U64 => Value::U64(raw.parse().map_err(|e| bad(&e))?),
            ValueType::F32 => Value::F32(raw.parse().map_err(|e| bad(&e))?),
            ValueType::F64 => Value::F64(raw.parse().map_err(|e| bad(&e))?),
            ValueType::Bool => Value::Bool(raw.parse().map_err(|e| bad(&e))?),
            ValueType::String => Value::String(raw.to_string()),
            ValueType::Bytes => Value::Bytes(decode_hex(raw).map_err(|e| bad(&e))?),
        })
    }
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, String> {
    if raw.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| {
            raw.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("bad hex at offset {i}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_tags() {
        assert_eq!(Value::I32(1).value_type(), ValueType::I32);
        assert_eq!(Value::Bytes(vec![1]).value_type(), ValueType::Bytes);
        assert_eq!(ValueType::String.word_count(), 2);
        assert_eq!(ValueType::F64.word_count(), 1);
    }

    #[test]
    fn test_parse_cli_values() {
        assert_eq!("i32:-2".parse::<Value>().unwrap(), Value::I32(-2));
        assert_eq!("u64:7".parse::<Value>().unwrap(), Value::U64(7));
        assert_eq!("bool:true".parse::<Value>().unwrap(), Value::Bool(true));
        assert_eq!(
            "string:a:b".parse::<Value>().unwrap(),
            Value::String("a:b".into())
        );
        assert_eq!(
            "bytes:dead".parse::<Value>().unwrap(),
            Value::Bytes(vec![0xde, 0xad])
        );

        assert!("i32".parse::<Value>().is_err());
        assert!("i32:abc".parse::<Value>().is_err());
        assert!("bytes:abc".parse::<Value>().is_err());
        assert!("nope:1".parse::<Value>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for v in [Value::I64(-9), Value::F32(1.5), Value::Bytes(vec![0, 255])] {
            assert_eq!(v.to_string().parse::<Value>().unwrap(), v);
        }
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_string(&Value::U32(3)).unwrap();
        assert_eq!(json, r#"{"type":"u32","value":3}"#);
    }
}
