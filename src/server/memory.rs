//! # In-Process Key/Value Server
//!
//! A complete [`KVServer`] implementation backed by a concurrent map, with
//! TTL expiry and CAS tokens. Used by the test suite and by embedders that
//! want cache semantics without a network hop. Fault injection lets tests
//! exercise the commit retry loop.

use crate::error::{CacheError, Result};
use crate::index::CacheKey;
use crate::server::{KVEntry, KVServer};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    cas: u64,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }
}

/// In-memory key/value server
#[derive(Debug, Default)]
pub struct InMemoryServer {
    entries: DashMap<String, StoredEntry>,
    cas_counter: AtomicU64,
    fail_sets: AtomicUsize,
}

impl InMemoryServer {
    /// Create an empty server
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `set` calls fail with a transient server error.
    /// Test hook for the commit retry loop.
    pub fn fail_next_sets(&self, n: usize) {
        self.fail_sets.store(n, Ordering::SeqCst);
    }

    /// Number of live entries (expired entries excluded)
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .count()
    }

    /// Whether the store holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn expiry(expiration: Duration) -> Option<Instant> {
        if expiration.is_zero() {
            None
        } else {
            Some(Instant::now() + expiration)
        }
    }
}

#[async_trait]
impl KVServer for InMemoryServer {
    async fn get(&self, key: &CacheKey) -> Result<Option<KVEntry>> {
        if let Some(entry) = self.entries.get(key.as_str()) {
            if !entry.is_expired() {
                return Ok(Some(KVEntry {
                    value: entry.value.clone(),
                    cas: entry.cas,
                }));
            }
        }
        // Expired or absent; drop any expired entry outside the read guard.
        self.entries.remove_if(key.as_str(), |_, entry| entry.is_expired());
        Ok(None)
    }

    async fn get_multi(&self, keys: &[CacheKey]) -> Result<HashMap<String, KVEntry>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.get(key).await? {
                out.insert(key.as_str().to_string(), entry);
            }
        }
        Ok(out)
    }

    async fn add(&self, key: &CacheKey, value: &[u8], expiration: Duration) -> Result<bool> {
        let mut created = false;
        let cas = self.next_cas();
        self.entries
            .entry(key.as_str().to_string())
            .and_modify(|existing| {
                if existing.is_expired() {
                    *existing = StoredEntry {
                        value: value.to_vec(),
                        cas,
                        expires_at: Self::expiry(expiration),
                    };
                    created = true;
                }
            })
            .or_insert_with(|| {
                created = true;
                StoredEntry {
                    value: value.to_vec(),
                    cas,
                    expires_at: Self::expiry(expiration),
                }
            });
        Ok(created)
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: &[u8],
        expiration: Duration,
        cas: Option<u64>,
    ) -> Result<()> {
        let remaining = self.fail_sets.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .fail_sets
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(CacheError::server_transient("injected set failure"));
        }

        if let Some(expected) = cas {
            let current = self
                .entries
                .get(key.as_str())
                .filter(|entry| !entry.is_expired())
                .map(|entry| entry.cas);
            match current {
                Some(actual) if actual == expected => {}
                // A vanished entry also invalidates the token.
                _ => return Err(CacheError::CasConflict(key.as_str().to_string())),
            }
        }

        self.entries.insert(
            key.as_str().to_string(),
            StoredEntry {
                value: value.to_vec(),
                cas: self.next_cas(),
                expires_at: Self::expiry(expiration),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.entries.remove(key.as_str());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}
