//! # Table Index Metadata
//!
//! Per-table index descriptions derived from schema introspection at
//! warm-up. Each index carries its ordered column list and produces the
//! cache keys under which values (primary) or primary-key references
//! (unique, non-unique) are stored.
//!
//! When a shard key is configured for the table, the shard column is
//! appended to every index's column tuple: derived cache keys of one
//! logical row then all hash to the same server.

pub mod cache_key;

pub use cache_key::{CacheKey, CacheTier, ParsedCacheKey};

use crate::error::{CacheError, Result};
use crate::value::{Record, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Kind of index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// `PRIMARY KEY`
    Primary,
    /// `UNIQUE KEY`
    Unique,
    /// Plain `KEY`
    Key,
}

impl IndexKind {
    /// Cache-key tag segment for this kind
    pub fn tag(&self) -> &'static str {
        match self {
            IndexKind::Primary => "",
            IndexKind::Unique => "uq",
            IndexKind::Key => "idx",
        }
    }
}

/// One index of a table
#[derive(Debug, Clone)]
pub struct Index {
    kind: IndexKind,
    name: String,
    table: String,
    columns: Vec<String>,
    shard_key: Option<String>,
}

impl Index {
    /// Create an index description. When `shard_key` names a column that is
    /// not already part of the tuple it is appended.
    pub fn new(
        kind: IndexKind,
        name: impl Into<String>,
        table: impl Into<String>,
        mut columns: Vec<String>,
        shard_key: Option<&str>,
    ) -> Self {
        let shard_key = shard_key.map(|s| s.to_string());
        if let Some(shard) = &shard_key {
            if !columns.iter().any(|c| c == shard) {
                columns.push(shard.clone());
            }
        }
        Self {
            kind,
            name: name.into(),
            table: table.into(),
            columns,
            shard_key,
        }
    }

    /// Index kind
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Index name as reported by the database
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table this index belongs to
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Ordered column tuple (shard key included when configured)
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Whether the column participates in this index
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Cache key for a fully-populated record.
    ///
    /// Every indexed column must be declared by the record's type; a missing
    /// declaration fails with *missing-column*.
    pub fn cache_key(&self, record: &Record) -> Result<CacheKey> {
        let mut pairs: Vec<(&str, &Value)> = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let value = record.get(column).ok_or_else(|| CacheError::MissingColumn {
                column: column.clone(),
                index: self.name.clone(),
            })?;
            pairs.push((column.as_str(), value));
        }
        let shard_value = self
            .shard_key
            .as_deref()
            .and_then(|shard| record.get(shard));
        Ok(CacheKey::build(
            CacheTier::Slc,
            &self.table,
            self.kind.tag(),
            &pairs,
            shard_value,
        ))
    }

    /// Cache key from explicit column bindings (query fragments). Bindings
    /// must cover the full tuple, in any order.
    pub fn cache_key_from_bindings(&self, bindings: &[(String, Value)]) -> Result<CacheKey> {
        let mut pairs: Vec<(&str, &Value)> = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let value = bindings
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, value)| value)
                .ok_or_else(|| CacheError::MissingColumn {
                    column: column.clone(),
                    index: self.name.clone(),
                })?;
            pairs.push((column.as_str(), value));
        }
        let shard_value = self.shard_key.as_deref().and_then(|shard| {
            bindings
                .iter()
                .find(|(name, _)| name == shard)
                .map(|(_, value)| value)
        });
        Ok(CacheKey::build(
            CacheTier::Slc,
            &self.table,
            self.kind.tag(),
            &pairs,
            shard_value,
        ))
    }
}

/// All indexes of one table: the primary key plus unique and non-unique
/// indexes by name.
#[derive(Debug, Clone)]
pub struct TableIndexes {
    primary: Arc<Index>,
    unique: HashMap<String, Arc<Index>>,
    keys: HashMap<String, Arc<Index>>,
}

impl TableIndexes {
    /// Assemble a table's index map. Fails when no primary key is present.
    pub fn new(table: &str, indexes: Vec<Index>) -> Result<Self> {
        let mut primary = None;
        let mut unique = HashMap::new();
        let mut keys = HashMap::new();
        for index in indexes {
            let index = Arc::new(index);
            match index.kind() {
                IndexKind::Primary => primary = Some(index),
                IndexKind::Unique => {
                    unique.insert(index.name().to_string(), index);
                }
                IndexKind::Key => {
                    keys.insert(index.name().to_string(), index);
                }
            }
        }
        let primary = primary.ok_or_else(|| {
            CacheError::Config(format!("table {} has no primary key", table))
        })?;
        Ok(Self {
            primary,
            unique,
            keys,
        })
    }

    /// The primary index
    pub fn primary(&self) -> &Arc<Index> {
        &self.primary
    }

    /// Unique indexes by name
    pub fn unique(&self) -> &HashMap<String, Arc<Index>> {
        &self.unique
    }

    /// Non-unique indexes by name
    pub fn keys(&self) -> &HashMap<String, Arc<Index>> {
        &self.keys
    }

    /// All indexes: primary first, then unique, then non-unique
    pub fn all(&self) -> Vec<Arc<Index>> {
        let mut out = Vec::with_capacity(1 + self.unique.len() + self.keys.len());
        out.push(Arc::clone(&self.primary));
        out.extend(self.unique.values().cloned());
        out.extend(self.keys.values().cloned());
        out
    }

    /// Every cache key a record participates in: its primary key plus every
    /// unique and non-unique index key. Used to populate the stash after a
    /// database read and to invalidate on write.
    pub fn all_cache_keys(&self, record: &Record) -> Result<Vec<(Arc<Index>, CacheKey)>> {
        let mut out = Vec::with_capacity(1 + self.unique.len() + self.keys.len());
        for index in self.all() {
            let key = index.cache_key(record)?;
            out.push((index, key));
        }
        Ok(out)
    }
}

/// One row of index introspection output, in dialect-independent form
#[derive(Debug, Clone)]
pub struct IndexColumn {
    /// Index name (`PRIMARY` for the primary key)
    pub index_name: String,
    /// Index kind
    pub kind: IndexKind,
    /// Column name
    pub column: String,
    /// Position of the column within the index, starting at 0
    pub seq: usize,
}

/// Build a table's index map from introspection rows
pub fn indexes_from_introspection(
    table: &str,
    mut rows: Vec<IndexColumn>,
    shard_key: Option<&str>,
) -> Result<TableIndexes> {
    rows.sort_by(|a, b| a.index_name.cmp(&b.index_name).then(a.seq.cmp(&b.seq)));
    let mut grouped: Vec<(String, IndexKind, Vec<String>)> = Vec::new();
    for row in rows {
        match grouped.last_mut() {
            Some((name, _, columns)) if *name == row.index_name => {
                columns.push(row.column);
            }
            _ => grouped.push((row.index_name, row.kind, vec![row.column])),
        }
    }
    let indexes = grouped
        .into_iter()
        .map(|(name, kind, columns)| Index::new(kind, name, table, columns, shard_key))
        .collect();
    TableIndexes::new(table, indexes)
}
