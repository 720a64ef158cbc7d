//! # Cache Facade
//!
//! [`TierCache`] owns the table registries of every tier, the key/value
//! server handle and the commit hooks. Tables join a tier through warm-up:
//! read-only tables load fully into the first level, read/write tables
//! register their introspected indexes with the second level. Transactions
//! begin here and borrow the registries for their lifetime.

use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::executor::{Dialect, SqlExecutor};
use crate::flc::FirstLevelCache;
use crate::llc::LastLevelCache;
use crate::server::{InMemoryServer, KVServer, RedisServer, ServerSelector};
use crate::slc::SecondLevelCache;
use crate::tx::{PendingOp, QueryLog, Transaction};
use crate::value::RecordType;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

type BeforeCommitHook = Box<dyn Fn(&[PendingOp]) + Send + Sync>;
type AfterSuccessHook = Box<dyn Fn() + Send + Sync>;
type AfterFailureHook = Box<dyn Fn(&[QueryLog]) + Send + Sync>;

/// Commit lifecycle callbacks
#[derive(Default)]
pub struct Hooks {
    before_commit: Option<BeforeCommitHook>,
    after_commit_success: Option<AfterSuccessHook>,
    after_commit_failure: Option<AfterFailureHook>,
}

impl Hooks {
    pub(crate) fn run_before_commit(&self, ops: &[PendingOp]) {
        if let Some(hook) = &self.before_commit {
            hook(ops);
        }
    }

    pub(crate) fn run_after_commit_success(&self) {
        if let Some(hook) = &self.after_commit_success {
            hook();
        }
    }

    pub(crate) fn run_after_commit_failure(&self, failed: &[QueryLog]) {
        if let Some(hook) = &self.after_commit_failure {
            hook(failed);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Query fragments answered by the stash or the cache server
    pub hits: u64,

    /// Query fragments that fell through to the database
    pub misses: u64,

    /// Fragments absorbed by a negative-cache marker
    pub negative_hits: u64,

    /// Committed transactions
    pub commits: u64,

    /// Rolled-back transactions
    pub rollbacks: u64,

    /// Hit rate across fragments
    pub hit_rate: f64,
}

impl CacheStats {
    pub(crate) fn update_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hit_rate = self.hits as f64 / total as f64;
        }
    }
}

impl std::fmt::Debug for TierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierCache")
            .field("config", &self.config)
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}

/// Multi-tier cache over a key/value server and a relational database
pub struct TierCache {
    config: Config,
    dialect: Dialect,
    server: Arc<dyn KVServer>,
    selector: Option<ServerSelector>,
    flc_tables: DashMap<String, Arc<FirstLevelCache>>,
    slc_tables: DashMap<String, Arc<SecondLevelCache>>,
    ignored: DashSet<String>,
    llc: LastLevelCache,
    hooks: Hooks,
    stats: Arc<RwLock<CacheStats>>,
}

impl TierCache {
    /// Build a cache over an injected key/value server
    pub fn new(config: Config, server: Arc<dyn KVServer>) -> Self {
        let selector = if config.server_addrs.is_empty() {
            None
        } else {
            Some(ServerSelector::new(config.server_addrs.clone()))
        };
        let llc = LastLevelCache::new(config.llc.clone(), Arc::clone(&server), selector.clone());
        Self {
            config,
            dialect: Dialect::MySql,
            server,
            selector,
            flc_tables: DashMap::new(),
            slc_tables: DashMap::new(),
            ignored: DashSet::new(),
            llc,
            hooks: Hooks::default(),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    /// Snapshot of the cache statistics
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().clone();
        stats.update_hit_rate();
        stats
    }

    /// Build a cache, connecting the server the configuration names.
    ///
    /// With no configured addresses the in-process server is used, which is
    /// what tests and single-process embedders want. A memcached deployment
    /// brings its own client through [`TierCache::new`].
    pub async fn connect(config: Config) -> Result<Self> {
        if config.server_addrs.is_empty() {
            let server: Arc<dyn KVServer> = Arc::new(InMemoryServer::new());
            return Ok(Self::new(config, server));
        }
        match config.server_type {
            crate::config::ServerType::Redis => {
                let mut pins: HashMap<String, String> = HashMap::new();
                for (table, opt) in &config.slc.tables {
                    if let Some(addr) = &opt.server {
                        pins.insert(table.clone(), addr.clone());
                    }
                }
                for (tag, opt) in &config.llc.tags {
                    if let Some(addr) = &opt.server {
                        pins.insert(tag.clone(), addr.clone());
                    }
                }
                let server: Arc<dyn KVServer> = Arc::new(
                    RedisServer::connect_with_pins(config.server_addrs.clone(), pins).await?,
                );
                Ok(Self::new(config, server))
            }
            crate::config::ServerType::Memcached => Err(CacheError::Config(
                "no bundled memcached client; inject a KVServer via TierCache::new".to_string(),
            )),
        }
    }

    /// Override the SQL dialect (MySQL by default)
    pub fn set_dialect(&mut self, dialect: Dialect) {
        self.dialect = dialect;
    }

    /// Install the before-commit callback
    pub fn set_before_commit(&mut self, hook: impl Fn(&[PendingOp]) + Send + Sync + 'static) {
        self.hooks.before_commit = Some(Box::new(hook));
    }

    /// Install the after-commit success callback
    pub fn set_after_commit_success(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.after_commit_success = Some(Box::new(hook));
    }

    /// Install the after-commit failure callback; receives the operations
    /// that could not be applied
    pub fn set_after_commit_failure(
        &mut self,
        hook: impl Fn(&[QueryLog]) + Send + Sync + 'static,
    ) {
        self.hooks.after_commit_failure = Some(Box::new(hook));
    }

    /// Register a read-only table: stream it fully into the first level
    pub async fn warm_up_read_only(
        &self,
        executor: &dyn SqlExecutor,
        ty: Arc<RecordType>,
    ) -> Result<()> {
        let table = ty.table().to_string();
        let flc = Arc::new(FirstLevelCache::new(ty, self.dialect));
        flc.warm_up(executor).await?;
        self.flc_tables.insert(table, flc);
        Ok(())
    }

    /// Register a read/write table: introspect its indexes into the second
    /// level. Call again after ALTER to re-register.
    pub async fn warm_up(&self, executor: &dyn SqlExecutor, ty: Arc<RecordType>) -> Result<()> {
        let table = ty.table().to_string();
        let existing = self
            .slc_tables
            .get(&table)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(slc) = existing {
            return slc.warm_up(executor).await;
        }
        let opt = self.config.slc.table(&table);
        let slc = Arc::new(SecondLevelCache::new(
            ty,
            self.dialect,
            Arc::clone(&self.server),
            opt,
            self.selector.clone(),
            Arc::clone(&self.stats),
        ));
        slc.warm_up(executor).await?;
        self.slc_tables.insert(table, slc);
        Ok(())
    }

    /// Bypass the cache for a table while keeping it registered, so
    /// cross-table transactional semantics still apply
    pub fn ignore_table(&self, table: &str) {
        self.ignored.insert(table.to_string());
    }

    pub(crate) fn is_ignored(&self, table: &str) -> bool {
        self.ignored.contains(table)
    }

    /// First-level cache of a table, when registered read-only
    pub fn first_level(&self, table: &str) -> Option<Arc<FirstLevelCache>> {
        self.flc_tables.get(table).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn second_level(&self, table: &str) -> Option<Arc<SecondLevelCache>> {
        self.slc_tables.get(table).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn table_type(&self, table: &str) -> Option<Arc<RecordType>> {
        if let Some(flc) = self.flc_tables.get(table) {
            return Some(Arc::clone(flc.ty()));
        }
        self.slc_tables
            .get(table)
            .map(|slc| Arc::clone(slc.ty()))
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub(crate) fn server(&self) -> &Arc<dyn KVServer> {
        &self.server
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub(crate) fn llc(&self) -> &LastLevelCache {
        &self.llc
    }

    pub(crate) fn stats_handle(&self) -> &Arc<RwLock<CacheStats>> {
        &self.stats
    }

    /// Open a transaction; the connection is required for any operation
    /// that may fall through to the database
    pub fn begin(&self, conn: Option<Arc<dyn SqlExecutor>>) -> Transaction<'_> {
        Transaction::new(self, conn)
    }

    /// Purge cache entries from captured commit logs
    pub async fn recover(&self, logs: &[QueryLog]) -> Result<()> {
        crate::recovery::recover(self.server.as_ref(), logs).await
    }

    /// Drop every entry on the cache server
    pub async fn flush(&self) -> Result<()> {
        self.server.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_without_addresses_uses_memory_server() {
        let cache = TierCache::connect(Config::default()).await.unwrap();
        cache.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_memcached_requires_injected_client() {
        let config = Config {
            server_addrs: vec!["127.0.0.1:11211".to_string()],
            ..Default::default()
        };
        let err = TierCache::connect(config).await.unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[tokio::test]
    async fn test_unregistered_table_is_unknown() {
        let cache = TierCache::connect(Config::default()).await.unwrap();
        let mut tx = cache.begin(None);
        let builder = crate::query::QueryBuilder::new("nobody");
        let err = tx.find_by_query_builder(&builder).await.unwrap_err();
        assert!(matches!(err, CacheError::UnknownTable(_)));
    }

    #[test]
    fn test_ignore_table_marks_registry() {
        let config = Config::default();
        let server: Arc<dyn KVServer> = Arc::new(crate::server::InMemoryServer::new());
        let cache = TierCache::new(config, server);
        cache.ignore_table("user_logins");
        assert!(cache.is_ignored("user_logins"));
        assert!(!cache.is_ignored("events"));
    }

    #[test]
    fn test_table_type_unknown_before_warm_up() {
        let server: Arc<dyn KVServer> = Arc::new(crate::server::InMemoryServer::new());
        let cache = TierCache::new(Config::default(), server);
        assert!(cache.table_type("events").is_none());
    }
}
