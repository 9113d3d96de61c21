//! Typed leaf values.

use crate::codec::{ByteReader, PutBytes};
use crate::error::{CoreError, CoreResult};
use crate::types::TypeKey;
use std::fmt;

/// The payload of a resource, tagged by its [`TypeKey`].
///
/// Complex nodes carry [`Value::Complex`] / [`Value::ComplexArr`], which have
/// no content: their data lives in child resources.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean leaf.
    Boolean(bool),
    /// Integer leaf.
    Int(i32),
    /// Long leaf, also used for time stamps.
    Long(i64),
    /// Float leaf.
    Float(f32),
    /// String leaf.
    String(String),
    /// Opaque bytes.
    Opaque(Vec<u8>),
    /// Boolean array.
    BooleanArr(Vec<bool>),
    /// Integer array.
    IntArr(Vec<i32>),
    /// Long array.
    LongArr(Vec<i64>),
    /// Float array.
    FloatArr(Vec<f32>),
    /// String array.
    StringArr(Vec<String>),
    /// Structured node.
    Complex,
    /// Resource list.
    ComplexArr,
}

impl Value {
    /// The value a freshly created resource of `key` starts with.
    #[must_use]
    pub fn default_for(key: TypeKey) -> Self {
        match key {
            TypeKey::Boolean => Value::Boolean(false),
            TypeKey::Int => Value::Int(0),
            TypeKey::Long => Value::Long(0),
            TypeKey::Float => Value::Float(0.0),
            TypeKey::String => Value::String(String::new()),
            TypeKey::Opaque => Value::Opaque(Vec::new()),
            TypeKey::BooleanArr => Value::BooleanArr(Vec::new()),
            TypeKey::IntArr => Value::IntArr(Vec::new()),
            TypeKey::LongArr => Value::LongArr(Vec::new()),
            TypeKey::FloatArr => Value::FloatArr(Vec::new()),
            TypeKey::StringArr => Value::StringArr(Vec::new()),
            TypeKey::Complex => Value::Complex,
            TypeKey::ComplexArr => Value::ComplexArr,
        }
    }

    /// Returns the key this value belongs to.
    #[must_use]
    pub fn type_key(&self) -> TypeKey {
        match self {
            Value::Boolean(_) => TypeKey::Boolean,
            Value::Int(_) => TypeKey::Int,
            Value::Long(_) => TypeKey::Long,
            Value::Float(_) => TypeKey::Float,
            Value::String(_) => TypeKey::String,
            Value::Opaque(_) => TypeKey::Opaque,
            Value::BooleanArr(_) => TypeKey::BooleanArr,
            Value::IntArr(_) => TypeKey::IntArr,
            Value::LongArr(_) => TypeKey::LongArr,
            Value::FloatArr(_) => TypeKey::FloatArr,
            Value::StringArr(_) => TypeKey::StringArr,
            Value::Complex => TypeKey::Complex,
            Value::ComplexArr => TypeKey::ComplexArr,
        }
    }

    /// Returns `self + delta` for numeric values of the same key.
    ///
    /// Integer arithmetic wraps, matching fixed-width counters.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidType`] for non-numeric or mismatched keys.
    pub fn checked_add(&self, delta: &Value) -> CoreResult<Value> {
        match (self, delta) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
            (Value::Long(a), Value::Long(b)) => Ok(Value::Long(a.wrapping_add(*b))),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
            _ => Err(CoreError::invalid_type(format!(
                "cannot add {} to {}",
                delta.type_key(),
                self.type_key()
            ))),
        }
    }

    /// Returns the float content, if this is a float.
    #[must_use]
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an int.
    #[must_use]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the long content, if this is a long.
    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    /// Appends the payload bytes. The key is stored separately by the caller.
    pub(crate) fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Boolean(v) => buf.put_u8(u8::from(*v)),
            Value::Int(v) => buf.put_i32(*v),
            Value::Long(v) => buf.put_i64(*v),
            Value::Float(v) => buf.put_f32(*v),
            Value::String(v) => buf.put_str(v),
            Value::Opaque(v) => buf.put_bytes(v),
            Value::BooleanArr(v) => {
                buf.put_u32(v.len() as u32);
                v.iter().for_each(|b| buf.put_u8(u8::from(*b)));
            }
            Value::IntArr(v) => {
                buf.put_u32(v.len() as u32);
                v.iter().for_each(|x| buf.put_i32(*x));
            }
            Value::LongArr(v) => {
                buf.put_u32(v.len() as u32);
                v.iter().for_each(|x| buf.put_i64(*x));
            }
            Value::FloatArr(v) => {
                buf.put_u32(v.len() as u32);
                v.iter().for_each(|x| buf.put_f32(*x));
            }
            Value::StringArr(v) => {
                buf.put_u32(v.len() as u32);
                v.iter().for_each(|s| buf.put_str(s));
            }
            Value::Complex | Value::ComplexArr => {}
        }
    }

    /// Decodes a payload written by [`Value::encode_payload`] for `key`.
    pub(crate) fn decode_payload(key: TypeKey, r: &mut ByteReader<'_>) -> CoreResult<Self> {
        let value = match key {
            TypeKey::Boolean => Value::Boolean(decode_bool(r)?),
            TypeKey::Int => Value::Int(r.i32()?),
            TypeKey::Long => Value::Long(r.i64()?),
            TypeKey::Float => Value::Float(r.f32()?),
            TypeKey::String => Value::String(r.string()?),
            TypeKey::Opaque => Value::Opaque(r.bytes()?),
            TypeKey::BooleanArr => {
                let n = r.count(1)?;
                Value::BooleanArr((0..n).map(|_| decode_bool(r)).collect::<CoreResult<_>>()?)
            }
            TypeKey::IntArr => {
                let n = r.count(4)?;
                Value::IntArr((0..n).map(|_| r.i32()).collect::<CoreResult<_>>()?)
            }
            TypeKey::LongArr => {
                let n = r.count(8)?;
                Value::LongArr((0..n).map(|_| r.i64()).collect::<CoreResult<_>>()?)
            }
            TypeKey::FloatArr => {
                let n = r.count(4)?;
                Value::FloatArr((0..n).map(|_| r.f32()).collect::<CoreResult<_>>()?)
            }
            TypeKey::StringArr => {
                let n = r.count(4)?;
                Value::StringArr((0..n).map(|_| r.string()).collect::<CoreResult<_>>()?)
            }
            TypeKey::Complex => Value::Complex,
            TypeKey::ComplexArr => Value::ComplexArr,
        };
        Ok(value)
    }
}

fn decode_bool(r: &mut ByteReader<'_>) -> CoreResult<bool> {
    match r.u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(CoreError::corruption(format!("invalid boolean byte {b}"))),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Opaque(v) => write!(f, "<{} bytes>", v.len()),
            Value::BooleanArr(v) => write!(f, "{v:?}"),
            Value::IntArr(v) => write!(f, "{v:?}"),
            Value::LongArr(v) => write!(f, "{v:?}"),
            Value::FloatArr(v) => write!(f, "{v:?}"),
            Value::StringArr(v) => write!(f, "{v:?}"),
            Value::Complex => f.write_str("{}"),
            Value::ComplexArr => f.write_str("[]"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Opaque(v)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::FloatArr(v)
    }
}

impl From<Vec<i32>> for Value {
    fn from(v: Vec<i32>) -> Self {
        Value::IntArr(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::LongArr(v)
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Self {
        Value::BooleanArr(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringArr(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reencode(value: &Value) -> Value {
        let mut buf = Vec::new();
        value.encode_payload(&mut buf);
        let mut r = ByteReader::new(&buf);
        let decoded = Value::decode_payload(value.type_key(), &mut r).unwrap();
        r.expect_end().unwrap();
        decoded
    }

    #[test]
    fn defaults_match_their_key() {
        for key in TypeKey::ALL {
            assert_eq!(Value::default_for(key).type_key(), key);
        }
    }

    #[test]
    fn string_array_survives_encoding() {
        let value = Value::StringArr(vec!["a".into(), String::new(), "übung".into()]);
        assert_eq!(reencode(&value), value);
    }

    #[test]
    fn complex_has_empty_payload() {
        let mut buf = Vec::new();
        Value::Complex.encode_payload(&mut buf);
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_boolean_byte_is_rejected() {
        let mut r = ByteReader::new(&[2]);
        assert!(Value::decode_payload(TypeKey::Boolean, &mut r).is_err());
    }

    #[test]
    fn checked_add_numeric_only() {
        assert_eq!(
            Value::Int(i32::MAX).checked_add(&Value::Int(1)).unwrap(),
            Value::Int(i32::MIN)
        );
        assert_eq!(
            Value::Float(1.5).checked_add(&Value::Float(1.0)).unwrap(),
            Value::Float(2.5)
        );
        assert!(Value::Int(1).checked_add(&Value::Long(1)).is_err());
        assert!(Value::Boolean(true).checked_add(&Value::Boolean(true)).is_err());
    }

    #[test]
    fn conversions() {
        assert_eq!(Value::from(10.0f32).as_float(), Some(10.0));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(3i64).as_long(), Some(3));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::from(4).as_int(), Some(4));
    }
}
