//! # Tiercache - Multi-Tier Transactional Caching
//!
//! A caching library that accelerates relational-database access by
//! layering three coherent tiers behind one transactional API:
//!
//! - `flc`: first-level cache, a process-local B+Tree index over fully
//!   pre-loaded read-only tables
//! - `slc`: second-level cache, a Read-Through/Write-Through cache for
//!   read/write tables backed by a remote key/value server
//! - `llc`: last-level cache, a generic tag-keyed byte cache
//! - `tx`: per-transaction stash buffering reads, writes, locks and the
//!   pending cache operations applied at commit
//! - `value`: typed column values and the descriptor-driven binary codec
//! - `query`: query builder and index-selection planner
//! - `index`: per-table index metadata and deterministic cache keys
//! - `server`, `executor`: the key/value server and SQL executor contracts
//!
//! The SQL driver and the network client to the key/value server stay
//! outside the crate; both are consumed through traits.
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiercache::{Config, QueryBuilder, RecordTypeBuilder, TierCache};
//!
//! # async fn example(executor: Arc<dyn tiercache::SqlExecutor>) -> tiercache::Result<()> {
//! let cache = TierCache::connect(Config::default()).await?;
//! let ty = RecordTypeBuilder::new("user_logins")
//!     .uint64("id")
//!     .uint64("user_id")
//!     .uint64("user_session_id")
//!     .build();
//! cache.warm_up(executor.as_ref(), ty).await?;
//!
//! let mut tx = cache.begin(Some(executor));
//! let rows = tx
//!     .find_by_query_builder(
//!         &QueryBuilder::new("user_logins")
//!             .eq("user_id", 1u64)
//!             .eq("user_session_id", 1u64),
//!     )
//!     .await?;
//! println!("{} row(s)", rows.len());
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Ordered index structure shared by the first-level cache
pub mod btree;

// Facade owning registries, server handle and commit hooks
pub mod cache;

// Configuration structs
pub mod config;

// Error types
pub mod error;

// SQL executor contract and dialect adapter
pub mod executor;

// First-level cache (read-only B+Tree tier)
pub mod flc;

// Index metadata and cache keys
pub mod index;

// Last-level cache (tag-keyed byte values)
pub mod llc;

// Query builder and planner
pub mod query;

// Purge from captured commit logs
pub mod recovery;

// Key/value server contract and bundled implementations
pub mod server;

// Second-level cache (read-through/write-through tier)
pub mod slc;

// Transactions and the per-transaction stash
pub mod tx;

// Typed values, record descriptors and the binary codec
pub mod value;

// Re-export commonly used types
pub use cache::{CacheStats, Hooks, TierCache};
pub use config::{Config, LlcConfig, LogMode, ServerType, SlcConfig, TableOption, TagOption};
pub use error::{CacheError, Result};
pub use executor::{Dialect, ExecResult, SqlExecutor};
pub use index::{CacheKey, CacheTier, Index, IndexKind, TableIndexes};
pub use query::{Condition, OrderBy, QueryBuilder};
pub use server::{InMemoryServer, KVEntry, KVServer, RedisServer, ServerSelector};
pub use tx::{PendingCommand, PendingOp, QueryLog, Stash, Transaction};
pub use value::{ColumnType, Record, RecordType, RecordTypeBuilder, Value};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
