//! Core type definitions for restree.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a real resource.
///
/// Ids are handed out by the store's [`crate::index::IdSequence`], never
/// reused, and survive restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u32);

impl ResourceId {
    /// Creates a resource id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res:{}", self.0)
    }
}

/// Number of a generation file within its family (`resMap<n>`, `resData<n>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

impl Generation {
    /// Creates a generation number.
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Returns the raw number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following generation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen:{}", self.0)
    }
}

/// Sequence number of a completed flush.
///
/// Structure generations remember the flush that wrote them and value
/// generations end each flush with a commit marker carrying it, which lets
/// recovery tell a complete flush from an interrupted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FlushSequence(pub u64);

impl FlushSequence {
    /// Creates a flush sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FlushSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flush:{}", self.0)
    }
}

/// Storage classification of a resource type.
///
/// Every schema type maps to exactly one key. Persistence tags each value
/// record with the key's byte and writes dispatch on it, so nothing below the
/// schema registry needs to know type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeKey {
    /// Single boolean.
    Boolean = 0,
    /// 32-bit integer.
    Int = 1,
    /// 64-bit integer; also used for timestamps.
    Long = 2,
    /// 32-bit float.
    Float = 3,
    /// UTF-8 string.
    String = 4,
    /// Opaque byte array.
    Opaque = 5,
    /// Boolean array.
    BooleanArr = 6,
    /// Integer array.
    IntArr = 7,
    /// Long array.
    LongArr = 8,
    /// Float array.
    FloatArr = 9,
    /// String array.
    StringArr = 10,
    /// Structured node without a value of its own.
    Complex = 11,
    /// Homogeneous list of structured nodes.
    ComplexArr = 12,
}

impl TypeKey {
    /// All keys, in tag order.
    pub const ALL: [TypeKey; 13] = [
        TypeKey::Boolean,
        TypeKey::Int,
        TypeKey::Long,
        TypeKey::Float,
        TypeKey::String,
        TypeKey::Opaque,
        TypeKey::BooleanArr,
        TypeKey::IntArr,
        TypeKey::LongArr,
        TypeKey::FloatArr,
        TypeKey::StringArr,
        TypeKey::Complex,
        TypeKey::ComplexArr,
    ];

    /// Returns the persisted tag.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Decodes a persisted tag.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }

    /// Returns `true` if resources of this key carry a leaf value.
    #[must_use]
    pub const fn has_value(self) -> bool {
        !matches!(self, TypeKey::Complex | TypeKey::ComplexArr)
    }

    /// Returns `true` for the array forms of the primitive keys.
    #[must_use]
    pub const fn is_array(self) -> bool {
        matches!(
            self,
            TypeKey::BooleanArr
                | TypeKey::IntArr
                | TypeKey::LongArr
                | TypeKey::FloatArr
                | TypeKey::StringArr
        )
    }

    /// Returns `true` for keys that support `get_and_add`.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, TypeKey::Int | TypeKey::Long | TypeKey::Float)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKey::Boolean => "BOOLEAN",
            TypeKey::Int => "INT",
            TypeKey::Long => "LONG",
            TypeKey::Float => "FLOAT",
            TypeKey::String => "STRING",
            TypeKey::Opaque => "OPAQUE",
            TypeKey::BooleanArr => "BOOLEAN_ARR",
            TypeKey::IntArr => "INT_ARR",
            TypeKey::LongArr => "LONG_ARR",
            TypeKey::FloatArr => "FLOAT_ARR",
            TypeKey::StringArr => "STRING_ARR",
            TypeKey::Complex => "COMPLEX",
            TypeKey::ComplexArr => "COMPLEX_ARR",
        };
        f.write_str(name)
    }
}

/// How a session may touch a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Reads and writes are allowed.
    #[default]
    Shared,
    /// Writes are refused: plain setters report `false`, atomic updates fail.
    ReadOnly,
}

/// Timestamp value meaning "never written" or "use the current time".
pub const NO_TIMESTAMP: i64 = -1;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_key_tags_round_trip() {
        for key in TypeKey::ALL {
            assert_eq!(TypeKey::from_byte(key.as_byte()), Some(key));
        }
        assert_eq!(TypeKey::from_byte(13), None);
    }

    #[test]
    fn type_key_classification() {
        assert!(TypeKey::Float.has_value());
        assert!(!TypeKey::Complex.has_value());
        assert!(!TypeKey::ComplexArr.has_value());
        assert!(TypeKey::StringArr.is_array());
        assert!(!TypeKey::Opaque.is_array());
        assert!(TypeKey::Long.is_numeric());
        assert!(!TypeKey::Boolean.is_numeric());
        assert_eq!(TypeKey::FloatArr.to_string(), "FLOAT_ARR");
    }

    #[test]
    fn displays() {
        assert_eq!(ResourceId::new(7).to_string(), "res:7");
        assert_eq!(Generation::new(3).next().to_string(), "gen:4");
        assert_eq!(FlushSequence::new(9).to_string(), "flush:9");
    }

    #[test]
    fn clock_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }
}
