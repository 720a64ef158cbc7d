//! # Configuration
//!
//! Plain configuration structs with serde support, mirroring the layered
//! option model of the cache: global connection options, second-level cache
//! defaults with per-table overrides, and per-tag last-level cache options.
//!
//! Durations are expressed in milliseconds throughout so that configuration
//! files stay free of unit ambiguity.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Kind of key/value server the cache talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// Memcached-protocol server (CAS tokens supported)
    Memcached,
    /// Redis server (CAS emulated, see the redis adapter)
    Redis,
}

impl Default for ServerType {
    fn default() -> Self {
        ServerType::Memcached
    }
}

/// Log sink selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    /// Human-readable console output
    Console,
    /// Structured JSON lines
    Json,
    /// No log output
    Disabled,
}

impl Default for LogMode {
    fn default() -> Self {
        LogMode::Console
    }
}

/// Global cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Kind of key/value server
    pub server_type: ServerType,

    /// Server addresses handed to the key/value client
    pub server_addrs: Vec<String>,

    /// I/O timeout in milliseconds for server operations
    pub timeout_ms: u64,

    /// Maximum idle connections kept by the server client
    pub max_idle_connections: usize,

    /// Maximum number of commit attempts for retryable failures
    pub max_retry: usize,

    /// Back-off interval between commit retry passes, in milliseconds
    pub retry_interval_ms: u64,

    /// Log sink selection
    pub log_mode: LogMode,

    /// Second-level cache options
    pub slc: SlcConfig,

    /// Last-level cache options
    pub llc: LlcConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_type: ServerType::default(),
            server_addrs: Vec::new(),
            timeout_ms: 1_000,
            max_idle_connections: 1_000,
            max_retry: 3,
            retry_interval_ms: 30,
            log_mode: LogMode::default(),
            slc: SlcConfig::default(),
            llc: LlcConfig::default(),
        }
    }
}

impl Config {
    /// Back-off interval as a [`Duration`]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Server I/O timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Second-level cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlcConfig {
    /// Default entry expiration in milliseconds (0 means no expiration)
    pub expiration_ms: u64,

    /// Default lock-key expiration in milliseconds
    pub lock_expiration_ms: u64,

    /// Enable optimistic (CAS) concurrency control by default
    pub optimistic_lock: bool,

    /// Enable pessimistic (lock-key) concurrency control by default
    pub pessimistic_lock: bool,

    /// Per-table overrides
    pub tables: HashMap<String, TableOption>,
}

impl Default for SlcConfig {
    fn default() -> Self {
        Self {
            expiration_ms: 0,
            lock_expiration_ms: 10_000,
            optimistic_lock: false,
            pessimistic_lock: false,
            tables: HashMap::new(),
        }
    }
}

/// Per-table second-level cache overrides
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TableOption {
    /// Column whose value selects the cache-server partition for every index
    /// key of a row
    pub shard_key: Option<String>,

    /// Pin the table's keys to a specific server address
    pub server: Option<String>,

    /// Entry expiration override in milliseconds
    pub expiration_ms: Option<u64>,

    /// Lock-key expiration override in milliseconds
    pub lock_expiration_ms: Option<u64>,

    /// Expiration for negative-cache markers in milliseconds. Markers use
    /// the positive-entry expiration when unset.
    pub negative_expiration_ms: Option<u64>,

    /// Optimistic locking override
    pub optimistic_lock: Option<bool>,

    /// Pessimistic locking override
    pub pessimistic_lock: Option<bool>,
}

/// Resolved per-table options after defaults are applied
#[derive(Debug, Clone)]
pub struct ResolvedTableOption {
    /// Shard-key column, if any
    pub shard_key: Option<String>,
    /// Pinned server address, if any
    pub server: Option<String>,
    /// Entry expiration
    pub expiration: Duration,
    /// Lock-key expiration
    pub lock_expiration: Duration,
    /// Negative-marker expiration
    pub negative_expiration: Duration,
    /// Optimistic locking enabled
    pub optimistic_lock: bool,
    /// Pessimistic locking enabled
    pub pessimistic_lock: bool,
}

impl SlcConfig {
    /// Resolve the effective options for a table
    pub fn table(&self, name: &str) -> ResolvedTableOption {
        let opt = self.tables.get(name).cloned().unwrap_or_default();
        let expiration_ms = opt.expiration_ms.unwrap_or(self.expiration_ms);
        ResolvedTableOption {
            shard_key: opt.shard_key,
            server: opt.server,
            expiration: Duration::from_millis(expiration_ms),
            lock_expiration: Duration::from_millis(
                opt.lock_expiration_ms.unwrap_or(self.lock_expiration_ms),
            ),
            negative_expiration: Duration::from_millis(
                opt.negative_expiration_ms.unwrap_or(expiration_ms),
            ),
            optimistic_lock: opt.optimistic_lock.unwrap_or(self.optimistic_lock),
            pessimistic_lock: opt.pessimistic_lock.unwrap_or(self.pessimistic_lock),
        }
    }
}

/// Last-level cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlcConfig {
    /// Default entry expiration in milliseconds
    pub expiration_ms: u64,

    /// Default lock-key expiration in milliseconds
    pub lock_expiration_ms: u64,

    /// Enable optimistic locking by default
    pub optimistic_lock: bool,

    /// Enable pessimistic locking by default
    pub pessimistic_lock: bool,

    /// Per-tag overrides
    pub tags: HashMap<String, TagOption>,
}

/// Per-tag last-level cache overrides
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TagOption {
    /// Pin the tag's keys to a specific server address
    pub server: Option<String>,

    /// Entry expiration override in milliseconds
    pub expiration_ms: Option<u64>,

    /// Lock-key expiration override in milliseconds
    pub lock_expiration_ms: Option<u64>,

    /// Optimistic locking override
    pub optimistic_lock: Option<bool>,

    /// Pessimistic locking override
    pub pessimistic_lock: Option<bool>,
}

/// Resolved per-tag options after defaults are applied
#[derive(Debug, Clone)]
pub struct ResolvedTagOption {
    /// Pinned server address, if any
    pub server: Option<String>,
    /// Entry expiration
    pub expiration: Duration,
    /// Lock-key expiration
    pub lock_expiration: Duration,
    /// Optimistic locking enabled
    pub optimistic_lock: bool,
    /// Pessimistic locking enabled
    pub pessimistic_lock: bool,
}

impl LlcConfig {
    /// Resolve the effective options for a tag
    pub fn tag(&self, name: &str) -> ResolvedTagOption {
        let opt = self.tags.get(name).cloned().unwrap_or_default();
        ResolvedTagOption {
            server: opt.server,
            expiration: Duration::from_millis(opt.expiration_ms.unwrap_or(self.expiration_ms)),
            lock_expiration: Duration::from_millis(
                opt.lock_expiration_ms.unwrap_or(self.lock_expiration_ms),
            ),
            optimistic_lock: opt.optimistic_lock.unwrap_or(self.optimistic_lock),
            pessimistic_lock: opt.pessimistic_lock.unwrap_or(self.pessimistic_lock),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_retry, 3);
        assert_eq!(config.retry_interval(), Duration::from_millis(30));
        assert_eq!(config.server_type, ServerType::Memcached);
    }

    #[test]
    fn test_table_override_resolution() {
        let mut slc = SlcConfig {
            expiration_ms: 60_000,
            pessimistic_lock: false,
            ..Default::default()
        };
        slc.tables.insert(
            "user_logins".to_string(),
            TableOption {
                shard_key: Some("user_id".to_string()),
                pessimistic_lock: Some(true),
                ..Default::default()
            },
        );

        let resolved = slc.table("user_logins");
        assert_eq!(resolved.shard_key.as_deref(), Some("user_id"));
        assert!(resolved.pessimistic_lock);
        assert_eq!(resolved.expiration, Duration::from_millis(60_000));
        // Negative markers inherit the positive expiration when unset.
        assert_eq!(resolved.negative_expiration, Duration::from_millis(60_000));

        let other = slc.table("events");
        assert!(other.shard_key.is_none());
        assert!(!other.pessimistic_lock);
    }

    #[test]
    fn test_deserialize_from_json() {
        let raw = r#"{
            "server_type": "redis",
            "server_addrs": ["127.0.0.1:6379"],
            "max_retry": 5,
            "slc": {
                "expiration_ms": 10000,
                "tables": {
                    "events": { "shard_key": "event_id" }
                }
            }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.server_type, ServerType::Redis);
        assert_eq!(config.max_retry, 5);
        assert_eq!(
            config.slc.table("events").shard_key.as_deref(),
            Some("event_id")
        );
    }
}
