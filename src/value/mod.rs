//! # Typed Column Values
//!
//! Provides the typed value model shared by every cache tier:
//! - [`Value`]: a tagged variant holding one primitive plus a null flag
//! - Typed comparators used by the query planner and the B+Tree
//! - Canonical stringification used inside cache keys
//! - A 32-bit content hash used for consistent-hash server selection

pub mod coder;
pub mod record;

pub use coder::{decode_primary_key, decode_primary_key_list, decode_record, encode_primary_key,
    encode_primary_key_list, encode_record};
pub use record::{ColumnDef, ColumnType, Record, RecordType, RecordTypeBuilder};

use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Ordering;

/// A typed column value.
///
/// Every variant carries `Option<T>` so that SQL `NULL` is representable for
/// each column type without losing the type tag. Arithmetic comparisons
/// between differently-tagged values are undefined; the query planner
/// type-aligns conditions before comparing.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 8-bit signed integer
    Int8(Option<i8>),
    /// 16-bit signed integer
    Int16(Option<i16>),
    /// 32-bit signed integer
    Int32(Option<i32>),
    /// 64-bit signed integer
    Int64(Option<i64>),
    /// 8-bit unsigned integer
    Uint8(Option<u8>),
    /// 16-bit unsigned integer
    Uint16(Option<u16>),
    /// 32-bit unsigned integer
    Uint32(Option<u32>),
    /// 64-bit unsigned integer
    Uint64(Option<u64>),
    /// 32-bit float
    Float32(Option<f32>),
    /// 64-bit float
    Float64(Option<f64>),
    /// Boolean
    Bool(Option<bool>),
    /// UTF-8 string
    String(Option<std::string::String>),
    /// Raw byte sequence
    Bytes(Option<Vec<u8>>),
    /// Timestamp with nanosecond precision
    Time(Option<DateTime<Utc>>),
    /// Homogeneous slice of values
    Slice(Option<Vec<Value>>),
    /// Nested struct value
    Struct(Option<Record>),
}

impl Value {
    /// Whether the value is SQL `NULL`
    pub fn is_nil(&self) -> bool {
        match self {
            Value::Int8(v) => v.is_none(),
            Value::Int16(v) => v.is_none(),
            Value::Int32(v) => v.is_none(),
            Value::Int64(v) => v.is_none(),
            Value::Uint8(v) => v.is_none(),
            Value::Uint16(v) => v.is_none(),
            Value::Uint32(v) => v.is_none(),
            Value::Uint64(v) => v.is_none(),
            Value::Float32(v) => v.is_none(),
            Value::Float64(v) => v.is_none(),
            Value::Bool(v) => v.is_none(),
            Value::String(v) => v.is_none(),
            Value::Bytes(v) => v.is_none(),
            Value::Time(v) => v.is_none(),
            Value::Slice(v) => v.is_none(),
            Value::Struct(v) => v.is_none(),
        }
    }

    /// Discriminant used for cross-tag total ordering and diagnostics
    fn tag_rank(&self) -> u8 {
        match self {
            Value::Int8(_) => 0,
            Value::Int16(_) => 1,
            Value::Int32(_) => 2,
            Value::Int64(_) => 3,
            Value::Uint8(_) => 4,
            Value::Uint16(_) => 5,
            Value::Uint32(_) => 6,
            Value::Uint64(_) => 7,
            Value::Float32(_) => 8,
            Value::Float64(_) => 9,
            Value::Bool(_) => 10,
            Value::String(_) => 11,
            Value::Bytes(_) => 12,
            Value::Time(_) => 13,
            Value::Slice(_) => 14,
            Value::Struct(_) => 15,
        }
    }

    /// Compare two same-tagged, non-nil values.
    ///
    /// Returns `None` when the tags differ, either side is nil, or a float
    /// comparison is undefined (NaN).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int8(Some(a)), Value::Int8(Some(b))) => Some(a.cmp(b)),
            (Value::Int16(Some(a)), Value::Int16(Some(b))) => Some(a.cmp(b)),
            (Value::Int32(Some(a)), Value::Int32(Some(b))) => Some(a.cmp(b)),
            (Value::Int64(Some(a)), Value::Int64(Some(b))) => Some(a.cmp(b)),
            (Value::Uint8(Some(a)), Value::Uint8(Some(b))) => Some(a.cmp(b)),
            (Value::Uint16(Some(a)), Value::Uint16(Some(b))) => Some(a.cmp(b)),
            (Value::Uint32(Some(a)), Value::Uint32(Some(b))) => Some(a.cmp(b)),
            (Value::Uint64(Some(a)), Value::Uint64(Some(b))) => Some(a.cmp(b)),
            (Value::Float32(Some(a)), Value::Float32(Some(b))) => a.partial_cmp(b),
            (Value::Float64(Some(a)), Value::Float64(Some(b))) => a.partial_cmp(b),
            (Value::Bool(Some(a)), Value::Bool(Some(b))) => Some(a.cmp(b)),
            (Value::String(Some(a)), Value::String(Some(b))) => Some(a.cmp(b)),
            (Value::Bytes(Some(a)), Value::Bytes(Some(b))) => Some(a.cmp(b)),
            (Value::Time(Some(a)), Value::Time(Some(b))) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order over values of any tag.
    ///
    /// Nil sorts before every non-nil value; differing tags order by tag
    /// rank; floats use IEEE total ordering. The B+Tree relies on this being
    /// a total order even though mixed-tag keys never occur within one index.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self.is_nil(), other.is_nil()) {
            (true, true) => return self.tag_rank().cmp(&other.tag_rank()),
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        match (self, other) {
            (Value::Float32(Some(a)), Value::Float32(Some(b))) => a.total_cmp(b),
            (Value::Float64(Some(a)), Value::Float64(Some(b))) => a.total_cmp(b),
            _ => self
                .compare(other)
                .unwrap_or_else(|| self.tag_rank().cmp(&other.tag_rank())),
        }
    }

    /// Equality comparator. Two nil values of any tag compare equal.
    pub fn eq_value(&self, other: &Value) -> bool {
        if self.is_nil() && other.is_nil() {
            return true;
        }
        matches!(self.compare(other), Some(Ordering::Equal))
    }

    /// Inequality comparator
    pub fn neq_value(&self, other: &Value) -> bool {
        !self.eq_value(other)
    }

    /// Strictly-less comparator
    pub fn lt_value(&self, other: &Value) -> bool {
        matches!(self.compare(other), Some(Ordering::Less))
    }

    /// Less-or-equal comparator
    pub fn lte_value(&self, other: &Value) -> bool {
        matches!(
            self.compare(other),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }

    /// Strictly-greater comparator
    pub fn gt_value(&self, other: &Value) -> bool {
        matches!(self.compare(other), Some(Ordering::Greater))
    }

    /// Greater-or-equal comparator
    pub fn gte_value(&self, other: &Value) -> bool {
        matches!(
            self.compare(other),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        )
    }

    /// Canonical string form used inside cache keys.
    ///
    /// Integers render decimal, booleans `true`/`false`, strings quoted,
    /// bytes hex, timestamps as Unix seconds, nil as the literal `nil`.
    pub fn canonical_string(&self) -> String {
        if self.is_nil() {
            return "nil".to_string();
        }
        match self {
            Value::Int8(Some(v)) => v.to_string(),
            Value::Int16(Some(v)) => v.to_string(),
            Value::Int32(Some(v)) => v.to_string(),
            Value::Int64(Some(v)) => v.to_string(),
            Value::Uint8(Some(v)) => v.to_string(),
            Value::Uint16(Some(v)) => v.to_string(),
            Value::Uint32(Some(v)) => v.to_string(),
            Value::Uint64(Some(v)) => v.to_string(),
            Value::Float32(Some(v)) => v.to_string(),
            Value::Float64(Some(v)) => v.to_string(),
            Value::Bool(Some(v)) => v.to_string(),
            Value::String(Some(v)) => format!("{:?}", v),
            Value::Bytes(Some(v)) => hex::encode(v),
            Value::Time(Some(v)) => v.timestamp().to_string(),
            Value::Slice(Some(items)) => {
                let joined: Vec<String> = items.iter().map(|v| v.canonical_string()).collect();
                format!("[{}]", joined.join(","))
            }
            Value::Struct(Some(record)) => record.canonical_string(),
            _ => unreachable!("nil handled above"),
        }
    }

    /// 32-bit FNV-1a content hash over the canonical string.
    ///
    /// The key/value client maps this hash onto its consistent-hash ring.
    pub fn hash32(&self) -> u32 {
        fnv1a32(self.canonical_string().as_bytes())
    }
}

/// FNV-1a, 32-bit
pub(crate) fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Build a [`Value::Time`] from Unix seconds and nanoseconds
pub fn time_from_unix(secs: i64, nanos: u32) -> Value {
    Value::Time(Utc.timestamp_opt(secs, nanos).single())
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(Some(v))
                }
            }
            impl From<Option<$ty>> for Value {
                fn from(v: Option<$ty>) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_value_from! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
    f32 => Float32,
    f64 => Float64,
    bool => Bool,
    std::string::String => String,
    Vec<u8> => Bytes,
    DateTime<Utc> => Time,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Some(v.to_string()))
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(Some(v.to_vec()))
    }
}
