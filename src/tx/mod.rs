//! # Transactions
//!
//! A [`Transaction`] coordinates one unit of work across the database and
//! the cache tiers. Reads flow stash → cache server → database; writes run
//! against the database immediately and enqueue pending cache operations.
//! Commit applies the pending operations in sorted key order with bounded
//! retries after committing the database; rollback discards them and
//! releases every lock on the way out.

pub mod stash;

pub use stash::{PendingCommand, PendingOp, QueryLog, Stash};

use crate::cache::TierCache;
use crate::error::{CacheError, Result};
use crate::executor::SqlExecutor;
use crate::query::{insert_sql, QueryBuilder};
use crate::value::{Record, Value};
use std::sync::Arc;
use std::time::Duration;

/// One unit of work against the cache and an optional database transaction.
///
/// A transaction is owned by one task; operations within it are serialised.
pub struct Transaction<'a> {
    cache: &'a TierCache,
    conn: Option<Arc<dyn SqlExecutor>>,
    stash: Stash,
    committed: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(cache: &'a TierCache, conn: Option<Arc<dyn SqlExecutor>>) -> Self {
        Self {
            cache,
            conn,
            stash: Stash::new(),
            committed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.committed {
            return Err(CacheError::AlreadyCommitted);
        }
        Ok(())
    }

    fn conn(&self) -> Option<&dyn SqlExecutor> {
        self.conn.as_deref()
    }

    /// Whether commit already ran
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Audit records of every cache operation applied by this transaction,
    /// in apply order. Callers persist these to drive [`crate::recovery`].
    pub fn query_logs(&self) -> &[QueryLog] {
        self.stash.logs()
    }

    /// Read rows through whichever tier holds the table
    pub async fn find_by_query_builder(&mut self, builder: &QueryBuilder) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let table = builder.table().to_string();
        if self.cache.is_ignored(&table) {
            let ty = self
                .cache
                .table_type(&table)
                .ok_or_else(|| CacheError::UnknownTable(table.clone()))?;
            let executor = self.conn().ok_or(CacheError::NoConnection)?;
            let (sql, args) = builder.to_select_sql(&ty, self.cache.dialect())?;
            return executor.query(&sql, &args, &ty).await;
        }
        if let Some(flc) = self.cache.first_level(&table) {
            let rows = flc.find_by_query_builder(builder).await?;
            return Ok(rows.iter().map(|r| (**r).clone()).collect());
        }
        if let Some(slc) = self.cache.second_level(&table) {
            return slc
                .find_by_query_builder(&mut self.stash, self.conn.as_deref(), builder)
                .await;
        }
        Err(CacheError::UnknownTable(table))
    }

    /// Count rows matching a query
    pub async fn count_by_query_builder(&mut self, builder: &QueryBuilder) -> Result<usize> {
        self.ensure_open()?;
        let table = builder.table().to_string();
        if self.cache.is_ignored(&table) {
            let rows = self.find_by_query_builder(&builder.without_paging()).await?;
            return Ok(rows.len());
        }
        if let Some(flc) = self.cache.first_level(&table) {
            return flc.count_by_query_builder(builder).await;
        }
        if let Some(slc) = self.cache.second_level(&table) {
            return slc
                .count_by_query_builder(&mut self.stash, self.conn.as_deref(), builder)
                .await;
        }
        let rows = self.find_by_query_builder(&builder.without_paging()).await?;
        Ok(rows.len())
    }

    /// All rows of a table
    pub async fn find_all_by_table(&mut self, table: &str) -> Result<Vec<Record>> {
        self.ensure_open()?;
        if self.cache.is_ignored(table) {
            return self
                .find_by_query_builder(&QueryBuilder::new(table))
                .await;
        }
        if let Some(flc) = self.cache.first_level(table) {
            let rows = flc.find_all().await?;
            return Ok(rows.iter().map(|r| (**r).clone()).collect());
        }
        if let Some(slc) = self.cache.second_level(table) {
            return slc.find_all(&mut self.stash, self.conn.as_deref()).await;
        }
        Err(CacheError::UnknownTable(table.to_string()))
    }

    /// Insert a row; returns the generated primary key when the database
    /// assigned one
    pub async fn create_by_table(&mut self, record: Record) -> Result<u64> {
        self.ensure_open()?;
        let table = record.table().to_string();
        if self.cache.first_level(&table).is_some() {
            return Err(CacheError::ReadOnlyTableWrite(table));
        }
        if self.cache.is_ignored(&table) {
            let executor = self.conn().ok_or(CacheError::NoConnection)?;
            let columns: Vec<(String, Value)> = record
                .ty()
                .columns()
                .iter()
                .zip(record.values().iter())
                .filter(|(_, value)| !value.is_nil())
                .map(|(def, value)| (def.name.clone(), value.clone()))
                .collect();
            let (sql, args) = insert_sql(&table, &columns, self.cache.dialect())?;
            let result = executor.exec(&sql, &args).await?;
            return Ok(result.last_insert_id);
        }
        match self.cache.second_level(&table) {
            Some(slc) => slc.create(&mut self.stash, self.conn.as_deref(), record).await,
            None => Err(CacheError::UnknownTable(table)),
        }
    }

    /// Update matched rows and keep every affected cache key coherent
    pub async fn update_by_query_builder(
        &mut self,
        builder: &QueryBuilder,
        assignments: &[(&str, Value)],
    ) -> Result<u64> {
        self.ensure_open()?;
        let table = builder.table().to_string();
        if self.cache.first_level(&table).is_some() {
            return Err(CacheError::ReadOnlyTableWrite(table));
        }
        let owned: Vec<(String, Value)> = assignments
            .iter()
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect();
        if self.cache.is_ignored(&table) {
            let executor = self.conn().ok_or(CacheError::NoConnection)?;
            let (sql, args) = builder.to_update_sql(&owned, self.cache.dialect())?;
            let result = executor.exec(&sql, &args).await?;
            return Ok(result.rows_affected);
        }
        match self.cache.second_level(&table) {
            Some(slc) => {
                slc.update(&mut self.stash, self.conn.as_deref(), builder, &owned)
                    .await
            }
            None => Err(CacheError::UnknownTable(table)),
        }
    }

    /// Delete matched rows and schedule deletion of every key they touch
    pub async fn delete_by_query_builder(&mut self, builder: &QueryBuilder) -> Result<u64> {
        self.ensure_open()?;
        let table = builder.table().to_string();
        if self.cache.first_level(&table).is_some() {
            return Err(CacheError::ReadOnlyTableWrite(table));
        }
        if self.cache.is_ignored(&table) {
            let executor = self.conn().ok_or(CacheError::NoConnection)?;
            let (sql, args) = builder.to_delete_sql(self.cache.dialect())?;
            let result = executor.exec(&sql, &args).await?;
            return Ok(result.rows_affected);
        }
        match self.cache.second_level(&table) {
            Some(slc) => slc.delete(&mut self.stash, self.conn.as_deref(), builder).await,
            None => Err(CacheError::UnknownTable(table)),
        }
    }

    /// Last-level read under the default tag
    pub async fn find(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.find_with_tag("", key).await
    }

    /// Last-level read
    pub async fn find_with_tag(&mut self, tag: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        self.cache.llc().find(&mut self.stash, tag, key).await
    }

    /// Last-level create (store only if absent) under the default tag
    pub async fn create(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.create_with_tag("", key, value, None).await
    }

    /// Last-level create with tag and optional expiration override
    pub async fn create_with_tag(
        &mut self,
        tag: &str,
        key: &str,
        value: Vec<u8>,
        expiration: Option<Duration>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.cache
            .llc()
            .create(&mut self.stash, tag, key, value, expiration)
            .await
    }

    /// Last-level unconditional store under the default tag
    pub async fn update(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.update_with_tag("", key, value, None).await
    }

    /// Last-level unconditional store with tag and optional expiration
    pub async fn update_with_tag(
        &mut self,
        tag: &str,
        key: &str,
        value: Vec<u8>,
        expiration: Option<Duration>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.cache
            .llc()
            .update(&mut self.stash, tag, key, value, expiration)
            .await
    }

    /// Last-level delete under the default tag
    pub async fn delete(&mut self, key: &str) -> Result<()> {
        self.delete_with_tag("", key).await
    }

    /// Last-level delete
    pub async fn delete_with_tag(&mut self, tag: &str, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.cache.llc().delete(&mut self.stash, tag, key).await
    }

    /// Commit the database transaction, then apply pending cache
    /// operations.
    ///
    /// A database failure aborts the cache commit entirely (locks are still
    /// released). Cache operations apply in sorted key order, one operation
    /// per distinct key, with up to `max_retry` passes over retryable
    /// failures; whatever still fails is surfaced as
    /// [`CacheError::CommitFailed`] alongside the failure callback.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(conn) = &self.conn {
            if let Err(e) = conn.commit().await {
                self.release_locks().await;
                self.stash.clear();
                return Err(e);
            }
        }
        let result = self.apply_pending().await;
        self.release_locks().await;
        self.committed = true;
        self.stash.clear();
        self.cache.stats_handle().write().commits += 1;
        result
    }

    /// Commit only the database transaction, leaving pending cache
    /// operations in place for [`Transaction::commit_cache_only`]
    pub async fn commit_db_only(&mut self) -> Result<()> {
        self.ensure_open()?;
        match &self.conn {
            Some(conn) => conn.commit().await,
            None => Err(CacheError::NoConnection),
        }
    }

    /// Apply pending cache operations without touching the database
    pub async fn commit_cache_only(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.apply_pending().await;
        self.release_locks().await;
        self.committed = true;
        self.stash.clear();
        result
    }

    /// Discard pending operations, release locks and roll back the
    /// database transaction. Already-applied cache entries are not touched.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.release_locks().await;
        self.stash.clear();
        self.cache.stats_handle().write().rollbacks += 1;
        match &self.conn {
            Some(conn) => conn.rollback().await,
            None => Ok(()),
        }
    }

    /// Roll back only the database transaction
    pub async fn rollback_db_only(&mut self) -> Result<()> {
        self.ensure_open()?;
        match &self.conn {
            Some(conn) => conn.rollback().await,
            None => Err(CacheError::NoConnection),
        }
    }

    /// Discard pending cache operations and release locks only
    pub async fn rollback_cache_only(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.release_locks().await;
        self.stash.clear();
        Ok(())
    }

    /// Rollback that is a no-op after a successful commit; the safe default
    /// for deferred cleanup
    pub async fn rollback_unless_committed(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.rollback().await
    }

    async fn apply_pending(&mut self) -> Result<()> {
        let mut ops = self.stash.take_pending();
        if ops.is_empty() {
            return Ok(());
        }

        // Deterministic order avoids deadlocks between transactions
        // touching overlapping key sets; the last operation per key wins.
        ops.sort_by(|a, b| a.key.as_str().cmp(b.key.as_str()));
        let mut deduped: Vec<PendingOp> = Vec::with_capacity(ops.len());
        for op in ops {
            match deduped.last_mut() {
                Some(last) if last.key.as_str() == op.key.as_str() => *last = op,
                _ => deduped.push(op),
            }
        }

        self.cache.hooks().run_before_commit(&deduped);

        let max_retry = self.cache.config().max_retry.max(1);
        let interval = self.cache.config().retry_interval();
        let mut queue = deduped;
        let mut permanent: Vec<QueryLog> = Vec::new();
        let mut attempt = 0;
        let failed_logs = loop {
            let mut failed: Vec<PendingOp> = Vec::new();
            for op in queue {
                match self.apply_op(&op).await {
                    Ok(()) => self.stash.push_log(op.log.clone()),
                    Err(e) if e.is_retryable() => {
                        log::debug!("cache op on {} failed ({}); will retry", op.key, e);
                        failed.push(op);
                    }
                    Err(e) => {
                        log::warn!("cache op on {} failed permanently: {}", op.key, e);
                        permanent.push(op.log.clone());
                    }
                }
            }
            if failed.is_empty() || attempt + 1 >= max_retry {
                break failed.into_iter().map(|op| op.log).collect::<Vec<_>>();
            }
            attempt += 1;
            tokio::time::sleep(jittered(interval)).await;
            queue = failed;
        };

        let mut all_failed = permanent;
        all_failed.extend(failed_logs);
        if all_failed.is_empty() {
            self.cache.hooks().run_after_commit_success();
            Ok(())
        } else {
            self.cache.hooks().run_after_commit_failure(&all_failed);
            Err(CacheError::CommitFailed { failed: all_failed })
        }
    }

    async fn apply_op(&mut self, op: &PendingOp) -> Result<()> {
        let server = Arc::clone(self.cache.server());
        match &op.command {
            PendingCommand::Set {
                value,
                expiration,
                with_cas,
            } => {
                let cas = if *with_cas {
                    self.stash.cas(op.key.as_str())
                } else {
                    None
                };
                match server.set(&op.key, value, *expiration, cas).await {
                    Err(CacheError::CasConflict(key)) => {
                        // Refresh the token so the retry pass can win.
                        if let Ok(Some(entry)) = server.get(&op.key).await {
                            self.stash.set_cas(op.key.as_str().to_string(), entry.cas);
                        }
                        Err(CacheError::CasConflict(key))
                    }
                    other => other,
                }
            }
            PendingCommand::Add { value, expiration } => server
                .add(&op.key, value, *expiration)
                .await
                .map(|_| ()),
            PendingCommand::Delete => server.delete(&op.key).await,
        }
    }

    async fn release_locks(&mut self) {
        let server = Arc::clone(self.cache.server());
        for lock in self.stash.take_locks() {
            if let Err(e) = server.delete(&lock).await {
                log::warn!("failed to release lock {}: {}", lock, e);
            }
        }
    }
}

fn jittered(interval: Duration) -> Duration {
    use rand::Rng;
    let quarter = (interval.as_millis() as u64 / 4).max(1);
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..quarter))
}
