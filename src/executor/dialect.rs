//! # SQL Dialect Adapter
//!
//! Differences between database engines are confined to this adapter:
//! placeholder style (`?` vs `$n`), identifier quoting (backtick vs double
//! quote) and the index-introspection statement used at warm-up.

use crate::error::{CacheError, Result};
use crate::index::{IndexColumn, IndexKind};
use crate::value::{Record, RecordType, RecordTypeBuilder};
use std::sync::Arc;

/// Supported SQL dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// MySQL-compatible: `?` placeholders, backtick quoting
    MySql,
    /// PostgreSQL-compatible: `$n` placeholders, double-quote quoting
    Postgres,
}

impl Dialect {
    /// Placeholder for the `n`-th parameter (1-based)
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::MySql => "?".to_string(),
            Dialect::Postgres => format!("${}", n),
        }
    }

    /// Quote an identifier
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", ident),
            Dialect::Postgres => format!("\"{}\"", ident),
        }
    }

    /// Suffix appended to row-locking reads
    pub fn for_update_suffix(&self) -> &'static str {
        " FOR UPDATE"
    }

    /// Statement whose result rows must follow [`introspection_record_type`]
    pub fn index_introspection_sql(&self, table: &str) -> String {
        match self {
            Dialect::MySql => format!(
                "SELECT INDEX_NAME AS index_name, \
                 CASE WHEN INDEX_NAME = 'PRIMARY' THEN 'primary' \
                      WHEN NON_UNIQUE = 0 THEN 'unique' \
                      ELSE 'key' END AS kind, \
                 COLUMN_NAME AS column_name, \
                 SEQ_IN_INDEX - 1 AS seq \
                 FROM information_schema.statistics \
                 WHERE table_schema = DATABASE() AND table_name = '{}'",
                table
            ),
            Dialect::Postgres => format!(
                "SELECT i.relname AS index_name, \
                 CASE WHEN ix.indisprimary THEN 'primary' \
                      WHEN ix.indisunique THEN 'unique' \
                      ELSE 'key' END AS kind, \
                 a.attname AS column_name, \
                 array_position(ix.indkey, a.attnum) - 1 AS seq \
                 FROM pg_class t \
                 JOIN pg_index ix ON t.oid = ix.indrelid \
                 JOIN pg_class i ON i.oid = ix.indexrelid \
                 JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
                 WHERE t.relname = '{}'",
                table
            ),
        }
    }
}

/// Record type of index-introspection result rows
pub fn introspection_record_type() -> Arc<RecordType> {
    RecordTypeBuilder::new("index_columns")
        .string("index_name")
        .string("kind")
        .string("column_name")
        .uint64("seq")
        .build()
}

/// Map introspection rows into dialect-independent index columns
pub fn index_columns_from_records(rows: &[Record]) -> Result<Vec<IndexColumn>> {
    rows.iter()
        .map(|row| {
            let index_name = row
                .string("index_name")
                .ok_or_else(|| CacheError::Sql("introspection row missing index_name".to_string()))?
                .to_string();
            let kind = match row.string("kind") {
                Some("primary") => IndexKind::Primary,
                Some("unique") => IndexKind::Unique,
                Some("key") => IndexKind::Key,
                other => {
                    return Err(CacheError::Sql(format!(
                        "introspection row carries unknown index kind {:?}",
                        other
                    )))
                }
            };
            let column = row
                .string("column_name")
                .ok_or_else(|| CacheError::Sql("introspection row missing column_name".to_string()))?
                .to_string();
            let seq = row.uint64("seq").unwrap_or(0) as usize;
            Ok(IndexColumn {
                index_name,
                kind,
                column,
                seq,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::MySql.placeholder(3), "?");
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
    }

    #[test]
    fn test_quoting() {
        assert_eq!(Dialect::MySql.quote("user_id"), "`user_id`");
        assert_eq!(Dialect::Postgres.quote("user_id"), "\"user_id\"");
    }

    #[test]
    fn test_introspection_mapping() {
        let ty = introspection_record_type();
        let mut row = Record::new(ty);
        row.set("index_name", "uq_session").unwrap();
        row.set("kind", "unique").unwrap();
        row.set("column_name", "user_id").unwrap();
        row.set("seq", 0u64).unwrap();

        let columns = index_columns_from_records(&[row]).unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].index_name, "uq_session");
        assert_eq!(columns[0].kind, IndexKind::Unique);
        assert_eq!(columns[0].column, "user_id");
        assert_eq!(columns[0].seq, 0);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let ty = introspection_record_type();
        let mut row = Record::new(ty);
        row.set("index_name", "x").unwrap();
        row.set("kind", "spatial").unwrap();
        row.set("column_name", "c").unwrap();
        row.set("seq", 0u64).unwrap();
        assert!(index_columns_from_records(&[row]).is_err());
    }
}
