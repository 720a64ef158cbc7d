//! # Database Executor Contract
//!
//! The SQL driver stays outside this crate. The cache engine renders
//! parameterised statements and hands them to an [`SqlExecutor`], which is
//! expected to run them inside the enclosing database transaction. Result
//! rows come back already typed under the table's [`RecordType`]; mapping
//! driver-native rows onto records is the adapter's concern.

pub mod dialect;

pub use dialect::{index_columns_from_records, introspection_record_type, Dialect};

use crate::error::Result;
use crate::value::{Record, RecordType, Value};
use async_trait::async_trait;
use std::sync::Arc;

/// Outcome of a write statement
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
    /// Auto-generated key of the inserted row, when the statement was an
    /// INSERT against an auto-increment primary key
    pub last_insert_id: u64,
    /// Number of rows the statement affected
    pub rows_affected: u64,
}

/// Abstract SQL executor bound to one database transaction.
///
/// Implementations must be safe to share across awaits within a single
/// cache transaction; the cache serialises calls per transaction. A
/// cancellation surfaced by the executor aborts the current operation and
/// leaves the transaction uncommitted; callers then roll back.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a SELECT and type its rows under `ty`
    async fn query(&self, sql: &str, args: &[Value], ty: &Arc<RecordType>) -> Result<Vec<Record>>;

    /// Run an INSERT/UPDATE/DELETE
    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult>;

    /// Commit the underlying database transaction
    async fn commit(&self) -> Result<()>;

    /// Roll back the underlying database transaction
    async fn rollback(&self) -> Result<()>;
}
