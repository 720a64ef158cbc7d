//! # Error Types
//!
//! All fallible operations in the crate return [`Result`], built on a single
//! [`CacheError`] enum. Retryable kinds (lock contention, CAS conflicts,
//! transient server failures) are distinguished so the commit loop can apply
//! its retry policy without inspecting error strings.

use thiserror::Error;

/// Cache error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// The requested key is not present in the cache. Internal: drives
    /// fall-through to the server or database and is never user-visible.
    #[error("cache miss")]
    CacheMiss,

    /// A pessimistic lock on the key is held by another transaction
    #[error("cache key {0} is locked by another transaction")]
    Locked(String),

    /// Optimistic concurrency token no longer matches the stored entry
    #[error("compare-and-swap conflict on cache key {0}")]
    CasConflict(String),

    /// Encoded payload carries a different schema version than the current
    /// record type; the entry is treated as a miss
    #[error("schema version mismatch: encoded {encoded}, expected {expected}")]
    SchemaMismatch {
        /// Version byte found in the payload
        encoded: u8,
        /// Version of the registered record type
        expected: u8,
    },

    /// Operation attempted on a transaction that already committed
    #[error("transaction is already committed")]
    AlreadyCommitted,

    /// A write-visible operation requires a database connection but none is
    /// attached to the transaction
    #[error("no database connection attached to transaction")]
    NoConnection,

    /// The table was never registered by a warm-up call
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Write requested against a table registered as read-only
    #[error("table {0} is read-only")]
    ReadOnlyTableWrite(String),

    /// Aggregated per-operation failures after the commit retry budget is
    /// exhausted; the failing operations are handed to the recovery callback
    #[error("cache commit failed for {} operation(s)", failed.len())]
    CommitFailed {
        /// Query logs of the operations that could not be applied
        failed: Vec<crate::QueryLog>,
    },

    /// A column required by an index is not bound in the value
    #[error("column {column} required by index {index} is not bound")]
    MissingColumn {
        /// Missing column name
        column: String,
        /// Index that required it
        index: String,
    },

    /// Column name not declared by the record type
    #[error("unknown column {column} for table {table}")]
    UnknownColumn {
        /// Column name
        column: String,
        /// Table whose record type was consulted
        table: String,
    },

    /// Encoded column tag does not match the descriptor
    #[error("type mismatch for column {column}: found tag {tag:#04x}")]
    TypeMismatch {
        /// Column being decoded
        column: String,
        /// Offending tag byte
        tag: u8,
    },

    /// Malformed encoded payload
    #[error("decode error: {0}")]
    Decode(String),

    /// Query cannot be planned or rendered
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Cache server error
    #[error("cache server error: {message}")]
    Server {
        /// Adapter-provided description
        message: String,
        /// Whether the commit loop may retry the operation
        retryable: bool,
    },

    /// Database executor error
    #[error("database error: {0}")]
    Sql(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Whether the commit retry policy applies to this error.
    ///
    /// Only lock contention, CAS conflicts and transient server failures are
    /// retried; everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Locked(_) | CacheError::CasConflict(_) => true,
            CacheError::Server { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Transient server error constructor used by server adapters
    pub fn server_transient(message: impl Into<String>) -> Self {
        CacheError::Server { message: message.into(), retryable: true }
    }

    /// Permanent server error constructor used by server adapters
    pub fn server_permanent(message: impl Into<String>) -> Self {
        CacheError::Server { message: message.into(), retryable: false }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
