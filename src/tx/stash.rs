//! # Transaction Stash
//!
//! Per-transaction write buffer. Reads populate it on the way back from the
//! cache server or database; writes mutate it immediately and enqueue
//! pending cache operations that apply at commit. All maps are keyed by the
//! cache-key string.

use crate::index::{CacheKey, CacheTier};
use crate::value::Record;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// One cache operation's audit record: enough to find and purge the entry
/// later without any table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLog {
    /// Cache-key string
    pub key: String,
    /// Server-selection hash of the key
    pub hash: u32,
    /// Tier the key belongs to
    pub tier: String,
    /// Operation kind: `set`, `add` or `delete`
    pub command: String,
    /// Address the key routes to, when the embedder configured explicit
    /// servers; empty otherwise
    pub server: String,
}

impl QueryLog {
    pub(crate) fn new(key: &CacheKey, tier: CacheTier, command: &str, server: String) -> Self {
        Self {
            key: key.as_str().to_string(),
            hash: key.hash(),
            tier: match tier {
                CacheTier::Slc => "slc".to_string(),
                CacheTier::Llc => "llc".to_string(),
            },
            command: command.to_string(),
            server,
        }
    }
}

/// Cache mutation scheduled to apply at commit
#[derive(Debug, Clone)]
pub enum PendingCommand {
    /// Unconditional store; `with_cas` upgrades it to a conditional store
    /// using the token captured when the entry was read
    Set {
        /// Encoded payload
        value: Vec<u8>,
        /// Entry TTL; zero stores without expiry
        expiration: Duration,
        /// Apply with the stashed CAS token
        with_cas: bool,
    },
    /// Store only when absent (negative markers)
    Add {
        /// Encoded payload
        value: Vec<u8>,
        /// Entry TTL
        expiration: Duration,
    },
    /// Remove the entry
    Delete,
}

/// One pending operation: target key, command and audit log record
#[derive(Debug, Clone)]
pub struct PendingOp {
    /// Target key
    pub key: CacheKey,
    /// What to apply
    pub command: PendingCommand,
    /// Audit record surfaced through commit callbacks and recovery
    pub log: QueryLog,
}

/// Per-transaction buffer of values, index resolutions, CAS tokens and
/// pending operations.
#[derive(Default)]
pub struct Stash {
    pk_to_record: HashMap<String, Arc<Record>>,
    uq_to_pk: HashMap<String, String>,
    key_to_pks: HashMap<String, Vec<String>>,
    cas_tokens: HashMap<String, u64>,
    negative: HashSet<String>,
    old_keys: HashSet<String>,
    pending: Vec<PendingOp>,
    lock_keys: Vec<CacheKey>,
    llc_values: HashMap<String, Option<Vec<u8>>>,
    logs: Vec<QueryLog>,
}

impl Stash {
    /// Fresh empty stash
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under a primary cache key
    pub fn record(&self, pk_key: &str) -> Option<&Arc<Record>> {
        self.pk_to_record.get(pk_key)
    }

    /// Own a value under its primary cache key
    pub fn insert_record(&mut self, pk_key: String, record: Arc<Record>) {
        self.negative.remove(&pk_key);
        self.pk_to_record.insert(pk_key, record);
    }

    /// Drop a value (row deleted within the transaction)
    pub fn remove_record(&mut self, pk_key: &str) {
        self.pk_to_record.remove(pk_key);
    }

    /// Primary key a unique index entry resolves to
    pub fn unique(&self, uq_key: &str) -> Option<&str> {
        self.uq_to_pk.get(uq_key).map(|s| s.as_str())
    }

    /// Record a unique-index resolution
    pub fn set_unique(&mut self, uq_key: String, pk_key: String) {
        self.negative.remove(&uq_key);
        self.uq_to_pk.insert(uq_key, pk_key);
    }

    /// Drop a unique-index resolution
    pub fn remove_unique(&mut self, uq_key: &str) {
        self.uq_to_pk.remove(uq_key);
    }

    /// Primary keys a non-unique index entry resolves to
    pub fn pks(&self, idx_key: &str) -> Option<&Vec<String>> {
        self.key_to_pks.get(idx_key)
    }

    /// Whether a non-unique list is held (even when empty)
    pub fn holds_pks(&self, idx_key: &str) -> bool {
        self.key_to_pks.contains_key(idx_key)
    }

    /// Record a non-unique index resolution
    pub fn set_pks(&mut self, idx_key: String, pks: Vec<String>) {
        self.negative.remove(&idx_key);
        self.key_to_pks.insert(idx_key, pks);
    }

    /// Append a primary key to a held list; no-op when the list is absent
    pub fn push_pk(&mut self, idx_key: &str, pk_key: String) {
        if let Some(pks) = self.key_to_pks.get_mut(idx_key) {
            if !pks.contains(&pk_key) {
                pks.push(pk_key);
            }
        }
    }

    /// Remove a primary key from a held list
    pub fn pull_pk(&mut self, idx_key: &str, pk_key: &str) {
        if let Some(pks) = self.key_to_pks.get_mut(idx_key) {
            pks.retain(|pk| pk != pk_key);
        }
    }

    /// Drop a non-unique list
    pub fn remove_pks(&mut self, idx_key: &str) {
        self.key_to_pks.remove(idx_key);
    }

    /// CAS token captured for a key
    pub fn cas(&self, key: &str) -> Option<u64> {
        self.cas_tokens.get(key).copied()
    }

    /// Capture a CAS token
    pub fn set_cas(&mut self, key: String, token: u64) {
        self.cas_tokens.insert(key, token);
    }

    /// Whether the key resolved as known-absent within this transaction
    pub fn is_negative(&self, key: &str) -> bool {
        self.negative.contains(key)
    }

    /// Mark a key known-absent
    pub fn mark_negative(&mut self, key: String) {
        self.negative.insert(key);
    }

    /// Clear a known-absent mark (the key gained a value this transaction)
    pub fn clear_negative(&mut self, key: &str) {
        self.negative.remove(key);
    }

    /// Schedule a key for deletion bookkeeping
    pub fn add_old_key(&mut self, key: String) {
        self.old_keys.insert(key);
    }

    /// Keys scheduled for deletion
    pub fn old_keys(&self) -> &HashSet<String> {
        &self.old_keys
    }

    /// Enqueue a pending operation
    pub fn push_pending(&mut self, op: PendingOp) {
        self.pending.push(op);
    }

    /// Pending operations in enqueue order
    pub fn pending(&self) -> &[PendingOp] {
        &self.pending
    }

    /// Drain pending operations for commit
    pub fn take_pending(&mut self) -> Vec<PendingOp> {
        std::mem::take(&mut self.pending)
    }

    /// Track an acquired lock key
    pub fn push_lock(&mut self, key: CacheKey) {
        if !self.lock_keys.iter().any(|k| k.as_str() == key.as_str()) {
            self.lock_keys.push(key);
        }
    }

    /// Whether this transaction holds the lock
    pub fn holds_lock(&self, key: &CacheKey) -> bool {
        self.lock_keys.iter().any(|k| k.as_str() == key.as_str())
    }

    /// Drain held locks for release
    pub fn take_locks(&mut self) -> Vec<CacheKey> {
        std::mem::take(&mut self.lock_keys)
    }

    /// Last-level value buffered this transaction; `Some(None)` means
    /// deleted
    pub fn llc_value(&self, key: &str) -> Option<&Option<Vec<u8>>> {
        self.llc_values.get(key)
    }

    /// Buffer a last-level value
    pub fn set_llc_value(&mut self, key: String, value: Option<Vec<u8>>) {
        self.llc_values.insert(key, value);
    }

    /// Append an applied-operation log record
    pub fn push_log(&mut self, log: QueryLog) {
        self.logs.push(log);
    }

    /// Applied-operation log records, in apply order
    pub fn logs(&self) -> &[QueryLog] {
        &self.logs
    }

    /// Release everything owned by the transaction. Values may return to a
    /// pool; afterwards the stash must not be read again.
    pub fn clear(&mut self) {
        self.pk_to_record.clear();
        self.uq_to_pk.clear();
        self.key_to_pks.clear();
        self.cas_tokens.clear();
        self.negative.clear();
        self.old_keys.clear();
        self.pending.clear();
        self.lock_keys.clear();
        self.llc_values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::CacheTier;
    use crate::value::{RecordTypeBuilder, Value};

    fn sample_key(n: u64) -> CacheKey {
        let id = Value::from(n);
        CacheKey::build(CacheTier::Slc, "t", "", &[("id", &id)], None)
    }

    #[test]
    fn test_record_ownership_clears_negative() {
        let mut stash = Stash::new();
        let key = sample_key(1);
        stash.mark_negative(key.as_str().to_string());
        assert!(stash.is_negative(key.as_str()));

        let ty = RecordTypeBuilder::new("t").uint64("id").build();
        stash.insert_record(key.as_str().to_string(), Arc::new(Record::new(ty)));
        assert!(!stash.is_negative(key.as_str()));
        assert!(stash.record(key.as_str()).is_some());
    }

    #[test]
    fn test_pk_list_editing() {
        let mut stash = Stash::new();
        stash.set_pks("idx".to_string(), vec!["pk1".to_string()]);
        stash.push_pk("idx", "pk2".to_string());
        stash.push_pk("idx", "pk2".to_string());
        assert_eq!(stash.pks("idx").unwrap().len(), 2);
        stash.pull_pk("idx", "pk1");
        assert_eq!(stash.pks("idx").unwrap(), &vec!["pk2".to_string()]);
        // Lists are only edited while held.
        stash.push_pk("other", "pk9".to_string());
        assert!(!stash.holds_pks("other"));
    }

    #[test]
    fn test_lock_tracking_deduplicates() {
        let mut stash = Stash::new();
        stash.push_lock(sample_key(1).lock_key());
        stash.push_lock(sample_key(1).lock_key());
        stash.push_lock(sample_key(2).lock_key());
        assert_eq!(stash.take_locks().len(), 2);
        assert!(stash.take_locks().is_empty());
    }

    #[test]
    fn test_query_log_round_trips_through_json() {
        let log = QueryLog::new(&sample_key(1), CacheTier::Slc, "set", String::new());
        let raw = serde_json::to_string(&log).unwrap();
        let back: QueryLog = serde_json::from_str(&raw).unwrap();
        assert_eq!(log, back);
    }
}
