//! # Key/Value Server Contract
//!
//! The network client to the cache server stays outside the core; the
//! engine consumes the [`KVServer`] trait. Server selection is the client's
//! job: implementations map [`CacheKey::hash`] onto their consistent-hash
//! ring (see [`selector::ServerSelector`]).

pub mod memory;
pub mod redis;
pub mod selector;

pub use memory::InMemoryServer;
pub use redis::RedisServer;
pub use selector::ServerSelector;

use crate::error::Result;
use crate::index::CacheKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// A stored entry returned by [`KVServer::get`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVEntry {
    /// Raw payload bytes
    pub value: Vec<u8>,
    /// CAS token of the read; 0 when the server does not support CAS
    pub cas: u64,
}

/// Abstract memcached- or redis-compatible key/value server.
///
/// All operations are idempotent from the engine's point of view:
/// `delete` of a missing key succeeds, `get` of a missing key returns
/// `None`. `add` reports whether the key was created; an existing key is
/// not an error, it is the contended branch of the lock protocol.
#[async_trait]
pub trait KVServer: Send + Sync {
    /// Fetch one entry; `None` is a miss
    async fn get(&self, key: &CacheKey) -> Result<Option<KVEntry>>;

    /// Fetch many entries; missing keys are absent from the map, which is
    /// keyed by the cache-key string
    async fn get_multi(&self, keys: &[CacheKey]) -> Result<HashMap<String, KVEntry>>;

    /// Store only if the key does not exist. Returns `false` when the key
    /// is already present. A zero `expiration` stores without TTL.
    async fn add(&self, key: &CacheKey, value: &[u8], expiration: Duration) -> Result<bool>;

    /// Store unconditionally, or conditionally when `cas` is given; a CAS
    /// mismatch surfaces as [`crate::CacheError::CasConflict`]
    async fn set(
        &self,
        key: &CacheKey,
        value: &[u8],
        expiration: Duration,
        cas: Option<u64>,
    ) -> Result<()>;

    /// Remove one entry
    async fn delete(&self, key: &CacheKey) -> Result<()>;

    /// Remove every entry
    async fn flush(&self) -> Result<()>;
}
