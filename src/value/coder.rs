//! # Binary Codec
//!
//! Msgpack-compatible framing for cached payloads. Every payload starts with
//! a single schema-version byte, followed by one `<tag><payload>` frame per
//! column in declaration order:
//!
//! - fixed-width integers big-endian under their msgpack tag
//! - strings and byte sequences length-prefixed (`str32` / `bin32`)
//! - timestamps as the msgpack `timestamp 96` extension (nanos, then secs)
//! - nil as the single `0xc0` tag
//! - slices as `array32`, nested structs as `array32` over their columns
//!
//! Encoders are driven purely by the [`RecordType`] descriptor; decoding
//! tolerates short input by populating trailing columns with nil defaults,
//! which makes adding a trailing column a compatible schema change.
//!
//! Secondary-index cache entries do not hold row payloads. A unique-index
//! entry stores one primary cache key, a non-unique entry stores a list of
//! them; both share the version byte so stale index entries age out with the
//! schema they were written under.

use crate::error::{CacheError, Result};
use crate::value::record::{ColumnType, Record, RecordType};
use crate::value::{time_from_unix, Value};
use std::sync::Arc;

const TAG_NIL: u8 = 0xc0;
const TAG_FALSE: u8 = 0xc2;
const TAG_TRUE: u8 = 0xc3;
const TAG_BIN32: u8 = 0xc6;
const TAG_EXT8: u8 = 0xc7;
const TAG_FLOAT32: u8 = 0xca;
const TAG_FLOAT64: u8 = 0xcb;
const TAG_UINT8: u8 = 0xcc;
const TAG_UINT16: u8 = 0xcd;
const TAG_UINT32: u8 = 0xce;
const TAG_UINT64: u8 = 0xcf;
const TAG_INT8: u8 = 0xd0;
const TAG_INT16: u8 = 0xd1;
const TAG_INT32: u8 = 0xd2;
const TAG_INT64: u8 = 0xd3;
const TAG_STR32: u8 = 0xdb;
const TAG_ARRAY32: u8 = 0xdd;

const EXT_TIMESTAMP: u8 = 0xff;
const TIMESTAMP96_LEN: u8 = 12;

/// Version byte 0 marks a negative-cache entry ("no such key").
const NEGATIVE_VERSION: u8 = 0x00;

/// Payload stored for keys known not to exist
pub fn negative_marker() -> Vec<u8> {
    vec![NEGATIVE_VERSION]
}

/// Whether a payload is a negative-cache marker
pub fn is_negative_marker(bytes: &[u8]) -> bool {
    bytes == [NEGATIVE_VERSION]
}

/// Encode a record under its descriptor
pub fn encode_record(record: &Record) -> Result<Vec<u8>> {
    let ty = record.ty();
    let mut buf = Vec::with_capacity(16 * ty.columns().len() + 1);
    buf.push(ty.version());
    for (def, value) in ty.columns().iter().zip(record.values().iter()) {
        encode_value(&mut buf, &def.ty, value, &def.name)?;
    }
    Ok(buf)
}

/// Decode a record; the payload's version byte must match the descriptor
pub fn decode_record(ty: &Arc<RecordType>, bytes: &[u8]) -> Result<Record> {
    let mut reader = Reader::new(bytes);
    check_version(&mut reader, ty.version())?;
    let mut record = Record::new(Arc::clone(ty));
    for (index, def) in ty.columns().iter().enumerate() {
        if reader.exhausted() {
            // Trailing columns added after the entry was written decode to
            // their nil defaults.
            break;
        }
        let value = decode_value(&mut reader, &def.ty, &def.name)?;
        record.set_by_index(index, value);
    }
    Ok(record)
}

/// Encode the primary-key reference stored under a unique-index key
pub fn encode_primary_key(version: u8, primary_key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(primary_key.len() + 6);
    buf.push(version);
    write_str(&mut buf, primary_key);
    buf
}

/// Decode a unique-index entry back to its primary cache key
pub fn decode_primary_key(version: u8, bytes: &[u8]) -> Result<String> {
    let mut reader = Reader::new(bytes);
    check_version(&mut reader, version)?;
    read_str(&mut reader)
}

/// Encode the primary-key list stored under a non-unique index key
pub fn encode_primary_key_list(version: u8, primary_keys: &[String]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 5 + primary_keys.iter().map(|k| k.len() + 5).sum::<usize>());
    buf.push(version);
    buf.push(TAG_ARRAY32);
    buf.extend_from_slice(&(primary_keys.len() as u32).to_be_bytes());
    for key in primary_keys {
        write_str(&mut buf, key);
    }
    buf
}

/// Decode a non-unique index entry back to its primary cache keys
pub fn decode_primary_key_list(version: u8, bytes: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::new(bytes);
    check_version(&mut reader, version)?;
    let tag = reader.read_u8()?;
    if tag != TAG_ARRAY32 {
        return Err(CacheError::Decode(format!(
            "expected array tag for key list, found {:#04x}",
            tag
        )));
    }
    let count = reader.read_u32()? as usize;
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        keys.push(read_str(&mut reader)?);
    }
    Ok(keys)
}

fn check_version(reader: &mut Reader<'_>, expected: u8) -> Result<()> {
    let encoded = reader.read_u8().map_err(|_| {
        CacheError::Decode("empty payload".to_string())
    })?;
    if encoded != expected {
        return Err(CacheError::SchemaMismatch { encoded, expected });
    }
    Ok(())
}

fn encode_value(buf: &mut Vec<u8>, ty: &ColumnType, value: &Value, column: &str) -> Result<()> {
    if !ty.accepts(value) {
        return Err(CacheError::TypeMismatch {
            column: column.to_string(),
            tag: 0,
        });
    }
    if value.is_nil() {
        buf.push(TAG_NIL);
        return Ok(());
    }
    match value {
        Value::Int8(Some(v)) => {
            buf.push(TAG_INT8);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Int16(Some(v)) => {
            buf.push(TAG_INT16);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Int32(Some(v)) => {
            buf.push(TAG_INT32);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Int64(Some(v)) => {
            buf.push(TAG_INT64);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Uint8(Some(v)) => {
            buf.push(TAG_UINT8);
            buf.push(*v);
        }
        Value::Uint16(Some(v)) => {
            buf.push(TAG_UINT16);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Uint32(Some(v)) => {
            buf.push(TAG_UINT32);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Uint64(Some(v)) => {
            buf.push(TAG_UINT64);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Float32(Some(v)) => {
            buf.push(TAG_FLOAT32);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Float64(Some(v)) => {
            buf.push(TAG_FLOAT64);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Bool(Some(v)) => {
            buf.push(if *v { TAG_TRUE } else { TAG_FALSE });
        }
        Value::String(Some(v)) => {
            write_str(buf, v);
        }
        Value::Bytes(Some(v)) => {
            buf.push(TAG_BIN32);
            buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
            buf.extend_from_slice(v);
        }
        Value::Time(Some(v)) => {
            buf.push(TAG_EXT8);
            buf.push(TIMESTAMP96_LEN);
            buf.push(EXT_TIMESTAMP);
            buf.extend_from_slice(&v.timestamp_subsec_nanos().to_be_bytes());
            buf.extend_from_slice(&v.timestamp().to_be_bytes());
        }
        Value::Slice(Some(items)) => {
            let element = match ty {
                ColumnType::Slice(element) => element,
                _ => unreachable!("accepts() checked the tag"),
            };
            buf.push(TAG_ARRAY32);
            buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_value(buf, element, item, column)?;
            }
        }
        Value::Struct(Some(record)) => {
            buf.push(TAG_ARRAY32);
            buf.extend_from_slice(&(record.values().len() as u32).to_be_bytes());
            for (def, item) in record.ty().columns().iter().zip(record.values().iter()) {
                encode_value(buf, &def.ty, item, &def.name)?;
            }
        }
        _ => unreachable!("nil handled above"),
    }
    Ok(())
}

fn decode_value(reader: &mut Reader<'_>, ty: &ColumnType, column: &str) -> Result<Value> {
    let tag = reader.read_u8()?;
    if tag == TAG_NIL {
        return Ok(ty.nil_value());
    }
    let mismatch = |tag: u8| CacheError::TypeMismatch {
        column: column.to_string(),
        tag,
    };
    let value = match ty {
        ColumnType::Int8 if tag == TAG_INT8 => Value::Int8(Some(reader.read_i8()?)),
        ColumnType::Int16 if tag == TAG_INT16 => {
            Value::Int16(Some(i16::from_be_bytes(reader.read_array()?)))
        }
        ColumnType::Int32 if tag == TAG_INT32 => {
            Value::Int32(Some(i32::from_be_bytes(reader.read_array()?)))
        }
        ColumnType::Int64 if tag == TAG_INT64 => {
            Value::Int64(Some(i64::from_be_bytes(reader.read_array()?)))
        }
        ColumnType::Uint8 if tag == TAG_UINT8 => Value::Uint8(Some(reader.read_u8()?)),
        ColumnType::Uint16 if tag == TAG_UINT16 => {
            Value::Uint16(Some(u16::from_be_bytes(reader.read_array()?)))
        }
        ColumnType::Uint32 if tag == TAG_UINT32 => Value::Uint32(Some(reader.read_u32()?)),
        ColumnType::Uint64 if tag == TAG_UINT64 => {
            Value::Uint64(Some(u64::from_be_bytes(reader.read_array()?)))
        }
        ColumnType::Float32 if tag == TAG_FLOAT32 => {
            Value::Float32(Some(f32::from_be_bytes(reader.read_array()?)))
        }
        ColumnType::Float64 if tag == TAG_FLOAT64 => {
            Value::Float64(Some(f64::from_be_bytes(reader.read_array()?)))
        }
        ColumnType::Bool if tag == TAG_TRUE => Value::Bool(Some(true)),
        ColumnType::Bool if tag == TAG_FALSE => Value::Bool(Some(false)),
        ColumnType::String if tag == TAG_STR32 => {
            let len = reader.read_u32()? as usize;
            let raw = reader.read_slice(len)?;
            let s = std::str::from_utf8(raw)
                .map_err(|e| CacheError::Decode(format!("invalid utf-8 in column {}: {}", column, e)))?;
            Value::String(Some(s.to_string()))
        }
        ColumnType::Bytes if tag == TAG_BIN32 => {
            let len = reader.read_u32()? as usize;
            Value::Bytes(Some(reader.read_slice(len)?.to_vec()))
        }
        ColumnType::Time if tag == TAG_EXT8 => {
            let len = reader.read_u8()?;
            let ext_type = reader.read_u8()?;
            if len != TIMESTAMP96_LEN || ext_type != EXT_TIMESTAMP {
                return Err(CacheError::Decode(format!(
                    "unexpected extension in column {}: len {} type {:#04x}",
                    column, len, ext_type
                )));
            }
            let nanos = reader.read_u32()?;
            let secs = i64::from_be_bytes(reader.read_array()?);
            time_from_unix(secs, nanos)
        }
        ColumnType::Slice(element) if tag == TAG_ARRAY32 => {
            let count = reader.read_u32()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(reader, element, column)?);
            }
            Value::Slice(Some(items))
        }
        ColumnType::Struct(nested_ty) if tag == TAG_ARRAY32 => {
            let count = reader.read_u32()? as usize;
            let mut record = Record::new(Arc::clone(nested_ty));
            for (index, def) in nested_ty.columns().iter().enumerate().take(count) {
                let value = decode_value(reader, &def.ty, &def.name)?;
                record.set_by_index(index, value);
            }
            Value::Struct(Some(record))
        }
        _ => return Err(mismatch(tag)),
    };
    Ok(value)
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.push(TAG_STR32);
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_str(reader: &mut Reader<'_>) -> Result<String> {
    let tag = reader.read_u8()?;
    if tag != TAG_STR32 {
        return Err(CacheError::Decode(format!(
            "expected string tag, found {:#04x}",
            tag
        )));
    }
    let len = reader.read_u32()? as usize;
    let raw = reader.read_slice(len)?;
    std::str::from_utf8(raw)
        .map(|s| s.to_string())
        .map_err(|e| CacheError::Decode(format!("invalid utf-8: {}", e)))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(CacheError::Decode("unexpected end of input".to_string()));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.read_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_slice(1)?[0])
    }

    fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::record::RecordTypeBuilder;
    use proptest::prelude::*;

    fn event_type() -> Arc<RecordType> {
        RecordTypeBuilder::new("events")
            .uint64("id")
            .uint64("event_id")
            .string("term")
            .bool("active")
            .float64("weight")
            .time("created_at")
            .bytes("payload")
            .build()
    }

    fn sample_record() -> Record {
        let mut record = Record::new(event_type());
        record.set("id", 1u64).unwrap();
        record.set("event_id", 1000u64).unwrap();
        record.set("term", "daytime").unwrap();
        record.set("active", true).unwrap();
        record.set("weight", 0.5f64).unwrap();
        record.set("created_at", time_from_unix(1500000000, 123)).unwrap();
        record.set("payload", vec![0xde_u8, 0xad_u8]).unwrap();
        record
    }

    #[test]
    fn test_round_trip() {
        let record = sample_record();
        let encoded = encode_record(&record).unwrap();
        let decoded = decode_record(record.ty(), &encoded).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn test_round_trip_preserves_nil() {
        let mut record = Record::new(event_type());
        record.set("id", 7u64).unwrap();
        // every other column stays nil
        let encoded = encode_record(&record).unwrap();
        let decoded = decode_record(record.ty(), &encoded).unwrap();
        assert_eq!(record, decoded);
        assert!(decoded.get("term").unwrap().is_nil());
    }

    #[test]
    fn test_version_mismatch_is_schema_error() {
        let record = sample_record();
        let mut encoded = encode_record(&record).unwrap();
        encoded[0] = 9;
        let err = decode_record(record.ty(), &encoded).unwrap_err();
        assert!(matches!(
            err,
            CacheError::SchemaMismatch { encoded: 9, expected: 1 }
        ));
    }

    #[test]
    fn test_trailing_column_defaults() {
        // Encode under a shorter descriptor, decode under one that gained a
        // trailing column.
        let old_ty = RecordTypeBuilder::new("events").uint64("id").build();
        let mut record = Record::new(Arc::clone(&old_ty));
        record.set("id", 42u64).unwrap();
        let encoded = encode_record(&record).unwrap();

        let new_ty = RecordTypeBuilder::new("events")
            .uint64("id")
            .string("term")
            .build();
        let decoded = decode_record(&new_ty, &encoded).unwrap();
        assert_eq!(decoded.uint64("id"), Some(42));
        assert!(decoded.get("term").unwrap().is_nil());
    }

    #[test]
    fn test_tag_mismatch_rejected() {
        let string_ty = RecordTypeBuilder::new("t").string("name").build();
        let int_ty = RecordTypeBuilder::new("t").uint64("name").build();
        let mut record = Record::new(string_ty);
        record.set("name", "x").unwrap();
        let encoded = encode_record(&record).unwrap();
        let err = decode_record(&int_ty, &encoded).unwrap_err();
        assert!(matches!(err, CacheError::TypeMismatch { .. }));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let record = sample_record();
        let encoded = encode_record(&record).unwrap();
        // Cut inside the second column's payload.
        let err = decode_record(record.ty(), &encoded[..12]).unwrap_err();
        assert!(matches!(err, CacheError::Decode(_)));
    }

    #[test]
    fn test_nested_struct_and_slice_round_trip() {
        let inner = RecordTypeBuilder::new("params")
            .uint64("key")
            .string("value")
            .build();
        let ty = RecordTypeBuilder::new("outer")
            .uint64("id")
            .nested("param", Arc::clone(&inner))
            .slice("tags", ColumnType::String)
            .build();

        let mut param = Record::new(inner);
        param.set("key", 3u64).unwrap();
        param.set("value", "high").unwrap();

        let mut record = Record::new(ty);
        record.set("id", 1u64).unwrap();
        record.set("param", Value::Struct(Some(param))).unwrap();
        record
            .set(
                "tags",
                Value::Slice(Some(vec![Value::from("a"), Value::from("b")])),
            )
            .unwrap();

        let encoded = encode_record(&record).unwrap();
        let decoded = decode_record(record.ty(), &encoded).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn test_primary_key_entry_round_trip() {
        let pk = "r/slc/user_logins/id#1";
        let encoded = encode_primary_key(1, pk);
        assert_eq!(decode_primary_key(1, &encoded).unwrap(), pk);
        assert!(matches!(
            decode_primary_key(2, &encoded).unwrap_err(),
            CacheError::SchemaMismatch { .. }
        ));
    }

    #[test]
    fn test_primary_key_list_round_trip() {
        let keys = vec![
            "r/slc/user_logins/id#1".to_string(),
            "r/slc/user_logins/id#2".to_string(),
        ];
        let encoded = encode_primary_key_list(1, &keys);
        assert_eq!(decode_primary_key_list(1, &encoded).unwrap(), keys);
    }

    #[test]
    fn test_negative_marker_is_distinct() {
        let record = sample_record();
        let encoded = encode_record(&record).unwrap();
        assert!(!is_negative_marker(&encoded));
        assert!(is_negative_marker(&negative_marker()));
        // A marker decodes as a schema mismatch, never as a record.
        let err = decode_record(record.ty(), &negative_marker()).unwrap_err();
        assert!(matches!(err, CacheError::SchemaMismatch { .. }));
    }

    proptest! {
        #[test]
        fn prop_scalar_round_trip(
            id in any::<u64>(),
            event_id in any::<u64>(),
            term in ".{0,64}",
            active in any::<bool>(),
            weight in any::<f64>().prop_filter("NaN breaks equality", |f| !f.is_nan()),
            secs in 0i64..4_000_000_000,
            nanos in 0u32..1_000_000_000,
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut record = Record::new(event_type());
            record.set("id", id).unwrap();
            record.set("event_id", event_id).unwrap();
            record.set("term", term.as_str()).unwrap();
            record.set("active", active).unwrap();
            record.set("weight", weight).unwrap();
            record.set("created_at", time_from_unix(secs, nanos)).unwrap();
            record.set("payload", payload).unwrap();

            let encoded = encode_record(&record).unwrap();
            let decoded = decode_record(record.ty(), &encoded).unwrap();
            prop_assert_eq!(record, decoded);
        }
    }
}
