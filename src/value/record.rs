//! # Record Types and Records
//!
//! A [`RecordType`] describes one table: column names mapped to types in
//! declaration order, plus a single-byte schema version embedded in every
//! encoded payload. Descriptors are built through [`RecordTypeBuilder`];
//! there is no runtime reflection anywhere in the codec.
//!
//! A [`Record`] is one row: a value per declared column, owned by the stash
//! for the duration of a transaction.

use crate::error::{CacheError, Result};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column type descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnType {
    /// 8-bit signed integer
    Int8,
    /// 16-bit signed integer
    Int16,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 8-bit unsigned integer
    Uint8,
    /// 16-bit unsigned integer
    Uint16,
    /// 32-bit unsigned integer
    Uint32,
    /// 64-bit unsigned integer
    Uint64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Boolean
    Bool,
    /// UTF-8 string
    String,
    /// Raw byte sequence
    Bytes,
    /// Timestamp
    Time,
    /// Homogeneous slice of the element type
    Slice(Box<ColumnType>),
    /// Nested struct with its own descriptor
    Struct(Arc<RecordType>),
}

impl ColumnType {
    /// Nil value of this type
    pub fn nil_value(&self) -> Value {
        match self {
            ColumnType::Int8 => Value::Int8(None),
            ColumnType::Int16 => Value::Int16(None),
            ColumnType::Int32 => Value::Int32(None),
            ColumnType::Int64 => Value::Int64(None),
            ColumnType::Uint8 => Value::Uint8(None),
            ColumnType::Uint16 => Value::Uint16(None),
            ColumnType::Uint32 => Value::Uint32(None),
            ColumnType::Uint64 => Value::Uint64(None),
            ColumnType::Float32 => Value::Float32(None),
            ColumnType::Float64 => Value::Float64(None),
            ColumnType::Bool => Value::Bool(None),
            ColumnType::String => Value::String(None),
            ColumnType::Bytes => Value::Bytes(None),
            ColumnType::Time => Value::Time(None),
            ColumnType::Slice(_) => Value::Slice(None),
            ColumnType::Struct(_) => Value::Struct(None),
        }
    }

    /// Whether a value carries this type's tag
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ColumnType::Int8, Value::Int8(_))
                | (ColumnType::Int16, Value::Int16(_))
                | (ColumnType::Int32, Value::Int32(_))
                | (ColumnType::Int64, Value::Int64(_))
                | (ColumnType::Uint8, Value::Uint8(_))
                | (ColumnType::Uint16, Value::Uint16(_))
                | (ColumnType::Uint32, Value::Uint32(_))
                | (ColumnType::Uint64, Value::Uint64(_))
                | (ColumnType::Float32, Value::Float32(_))
                | (ColumnType::Float64, Value::Float64(_))
                | (ColumnType::Bool, Value::Bool(_))
                | (ColumnType::String, Value::String(_))
                | (ColumnType::Bytes, Value::Bytes(_))
                | (ColumnType::Time, Value::Time(_))
                | (ColumnType::Slice(_), Value::Slice(_))
                | (ColumnType::Struct(_), Value::Struct(_))
        )
    }
}

/// One declared column
#[derive(Debug, Clone)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Column type
    pub ty: ColumnType,
}

/// Table descriptor: columns in declaration order plus a schema version.
///
/// Declaration order is the canonical serialization order. The version byte
/// gates decoding: payloads encoded under a different version are treated as
/// cache misses so that re-warm-up repopulates entries after ALTER.
#[derive(Debug)]
pub struct RecordType {
    table: String,
    version: u8,
    columns: Vec<ColumnDef>,
    by_name: HashMap<String, usize>,
}

impl RecordType {
    /// Table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Schema version byte (never 0; 0 is reserved for negative markers)
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Declared columns in serialization order
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Declaration index of a column
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Type of a column
    pub fn column_type(&self, name: &str) -> Option<&ColumnType> {
        self.column_index(name).map(|i| &self.columns[i].ty)
    }

    /// Whether the column is declared
    pub fn has_column(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

impl PartialEq for RecordType {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.version == other.version
    }
}

/// Builder for [`RecordType`]
pub struct RecordTypeBuilder {
    table: String,
    version: u8,
    columns: Vec<ColumnDef>,
}

impl RecordTypeBuilder {
    /// Start a descriptor for a table
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            version: 1,
            columns: Vec::new(),
        }
    }

    /// Set the schema version byte. Version 0 is reserved for negative-cache
    /// markers and is bumped to 1.
    pub fn version(mut self, version: u8) -> Self {
        self.version = version.max(1);
        self
    }

    /// Declare a column of an explicit type
    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            ty,
        });
        self
    }

    /// Declare an `Int8` column
    pub fn int8(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Int8)
    }

    /// Declare an `Int16` column
    pub fn int16(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Int16)
    }

    /// Declare an `Int32` column
    pub fn int32(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Int32)
    }

    /// Declare an `Int64` column
    pub fn int64(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Int64)
    }

    /// Declare a `Uint8` column
    pub fn uint8(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Uint8)
    }

    /// Declare a `Uint16` column
    pub fn uint16(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Uint16)
    }

    /// Declare a `Uint32` column
    pub fn uint32(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Uint32)
    }

    /// Declare a `Uint64` column
    pub fn uint64(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Uint64)
    }

    /// Declare a `Float32` column
    pub fn float32(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Float32)
    }

    /// Declare a `Float64` column
    pub fn float64(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Float64)
    }

    /// Declare a `Bool` column
    pub fn bool(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Bool)
    }

    /// Declare a `String` column
    pub fn string(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::String)
    }

    /// Declare a `Bytes` column
    pub fn bytes(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Bytes)
    }

    /// Declare a `Time` column
    pub fn time(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Time)
    }

    /// Declare a slice column of an element type
    pub fn slice(self, name: impl Into<String>, element: ColumnType) -> Self {
        self.column(name, ColumnType::Slice(Box::new(element)))
    }

    /// Declare a nested struct column
    pub fn nested(self, name: impl Into<String>, ty: Arc<RecordType>) -> Self {
        self.column(name, ColumnType::Struct(ty))
    }

    /// Finish the descriptor
    pub fn build(self) -> Arc<RecordType> {
        let by_name = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Arc::new(RecordType {
            table: self.table,
            version: self.version,
            columns: self.columns,
            by_name,
        })
    }
}

/// One row of a table, typed by its [`RecordType`].
#[derive(Debug, Clone)]
pub struct Record {
    ty: Arc<RecordType>,
    values: Vec<Value>,
}

impl Record {
    /// Empty record with every column nil
    pub fn new(ty: Arc<RecordType>) -> Self {
        let values = ty.columns().iter().map(|c| c.ty.nil_value()).collect();
        Self { ty, values }
    }

    /// Descriptor of this record
    pub fn ty(&self) -> &Arc<RecordType> {
        &self.ty
    }

    /// Table name
    pub fn table(&self) -> &str {
        self.ty.table()
    }

    /// Set a column value. The value's tag must match the declared type.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let index = self
            .ty
            .column_index(column)
            .ok_or_else(|| CacheError::UnknownColumn {
                column: column.to_string(),
                table: self.ty.table().to_string(),
            })?;
        if !self.ty.columns()[index].ty.accepts(&value) {
            return Err(CacheError::TypeMismatch {
                column: column.to_string(),
                tag: 0,
            });
        }
        self.values[index] = value;
        Ok(())
    }

    /// Value of a column
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.ty.column_index(column).map(|i| &self.values[i])
    }

    /// Values in declaration order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub(crate) fn set_by_index(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }

    /// `i64` accessor
    pub fn int64(&self, column: &str) -> Option<i64> {
        match self.get(column) {
            Some(Value::Int64(v)) => *v,
            _ => None,
        }
    }

    /// `u64` accessor
    pub fn uint64(&self, column: &str) -> Option<u64> {
        match self.get(column) {
            Some(Value::Uint64(v)) => *v,
            _ => None,
        }
    }

    /// `&str` accessor
    pub fn string(&self, column: &str) -> Option<&str> {
        match self.get(column) {
            Some(Value::String(Some(v))) => Some(v.as_str()),
            _ => None,
        }
    }

    /// `bool` accessor
    pub fn bool(&self, column: &str) -> Option<bool> {
        match self.get(column) {
            Some(Value::Bool(v)) => *v,
            _ => None,
        }
    }

    /// Canonical string of the whole record, used for nested struct values
    /// inside cache keys
    pub fn canonical_string(&self) -> String {
        let parts: Vec<String> = self
            .ty
            .columns()
            .iter()
            .zip(self.values.iter())
            .map(|(c, v)| format!("{}:{}", c.name, v.canonical_string()))
            .collect();
        format!("{{{}}}", parts.join(","))
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.ty == other.ty && self.values == other.values
    }
}
