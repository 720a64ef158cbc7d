//! # Second-Level Cache
//!
//! Read-Through/Write-Through cache for one read/write table, backed by the
//! key/value server. Primary-key entries store the encoded row; unique and
//! non-unique index entries store primary-key references that a read
//! resolves in a second step. Reads consult the transaction stash first,
//! then the server, then merge the remaining misses into a single database
//! query whose rows repopulate both the stash and the server (as pending
//! operations applied at commit). Writes run against the database at once
//! and invalidate or refresh every index key the affected rows touch.

use crate::cache::CacheStats;
use crate::config::ResolvedTableOption;
use crate::error::{CacheError, Result};
use crate::executor::{index_columns_from_records, introspection_record_type, Dialect, SqlExecutor};
use crate::index::{indexes_from_introspection, CacheKey, CacheTier, Index, IndexKind, TableIndexes};
use crate::query::planner::align_value;
use crate::query::{insert_sql, plan, Plan, QueryBuilder, QueryFragment, QuerySet};
use crate::server::{KVServer, ServerSelector};
use crate::tx::stash::{PendingCommand, PendingOp, QueryLog, Stash};
use crate::value::coder::{
    decode_primary_key, decode_primary_key_list, decode_record, encode_primary_key,
    encode_primary_key_list, encode_record, is_negative_marker, negative_marker,
};
use crate::value::{Record, RecordType, Value};
use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of resolving one query fragment against stash and server
enum Resolution {
    /// Rows answering the fragment (possibly none, when a cached list or
    /// negative marker proves emptiness)
    Rows(Vec<Record>),
    /// Every cache level missed; the database must answer
    Miss,
}

/// Read-through/write-through cache of one table
pub struct SecondLevelCache {
    ty: Arc<RecordType>,
    dialect: Dialect,
    server: Arc<dyn KVServer>,
    opt: ResolvedTableOption,
    selector: Option<ServerSelector>,
    indexes: ArcSwapOption<TableIndexes>,
    stats: Arc<RwLock<CacheStats>>,
}

impl SecondLevelCache {
    /// Create an unregistered cache for a table
    pub fn new(
        ty: Arc<RecordType>,
        dialect: Dialect,
        server: Arc<dyn KVServer>,
        opt: ResolvedTableOption,
        selector: Option<ServerSelector>,
        stats: Arc<RwLock<CacheStats>>,
    ) -> Self {
        Self {
            ty,
            dialect,
            server,
            opt,
            selector,
            indexes: ArcSwapOption::const_empty(),
            stats,
        }
    }

    /// Table descriptor
    pub fn ty(&self) -> &Arc<RecordType> {
        &self.ty
    }

    /// Effective table options
    pub fn options(&self) -> &ResolvedTableOption {
        &self.opt
    }

    /// Introspect the table's indexes and (re)build the index map. Called
    /// at startup and again after ALTER; entries encoded under the previous
    /// schema version decode as misses and age out.
    pub async fn warm_up(&self, executor: &dyn SqlExecutor) -> Result<()> {
        let table = self.ty.table();
        let sql = self.dialect.index_introspection_sql(table);
        let rows = executor
            .query(&sql, &[], &introspection_record_type())
            .await?;
        let columns = index_columns_from_records(&rows)?;
        let indexes = indexes_from_introspection(table, columns, self.opt.shard_key.as_deref())?;
        log::info!(
            "registered table {} with {} index(es)",
            table,
            indexes.all().len()
        );
        self.indexes.store(Some(Arc::new(indexes)));
        Ok(())
    }

    fn registered(&self) -> Result<Arc<TableIndexes>> {
        self.indexes
            .load_full()
            .ok_or_else(|| CacheError::UnknownTable(self.ty.table().to_string()))
    }

    fn server_addr(&self, key: &CacheKey) -> String {
        if let Some(pinned) = &self.opt.server {
            return pinned.clone();
        }
        self.selector
            .as_ref()
            .and_then(|s| s.select(key.hash()))
            .map(str::to_string)
            .unwrap_or_default()
    }

    fn schedule(&self, stash: &mut Stash, key: CacheKey, command: PendingCommand) {
        let name = match command {
            PendingCommand::Set { .. } => "set",
            PendingCommand::Add { .. } => "add",
            PendingCommand::Delete => "delete",
        };
        let log = QueryLog::new(&key, CacheTier::Slc, name, self.server_addr(&key));
        stash.push_pending(PendingOp { key, command, log });
    }

    fn schedule_value_set(&self, stash: &mut Stash, key: CacheKey, value: Vec<u8>) {
        self.schedule(
            stash,
            key,
            PendingCommand::Set {
                value,
                expiration: self.opt.expiration,
                with_cas: self.opt.optimistic_lock,
            },
        );
    }

    fn schedule_negative(&self, stash: &mut Stash, key: CacheKey) {
        stash.mark_negative(key.as_str().to_string());
        self.schedule(
            stash,
            key,
            PendingCommand::Add {
                value: negative_marker(),
                expiration: self.opt.negative_expiration,
            },
        );
    }

    fn schedule_delete(&self, stash: &mut Stash, key: CacheKey) {
        stash.add_old_key(key.as_str().to_string());
        self.schedule(stash, key, PendingCommand::Delete);
    }

    /// Acquire the pessimistic lock sibling of a key. Losing the `add` race
    /// surfaces as [`CacheError::Locked`]; the caller never waits.
    async fn lock(&self, stash: &mut Stash, key: &CacheKey) -> Result<()> {
        let lock_key = key.lock_key();
        if stash.holds_lock(&lock_key) {
            return Ok(());
        }
        let created = self
            .server
            .add(&lock_key, b"1", self.opt.lock_expiration)
            .await?;
        if !created {
            return Err(CacheError::Locked(lock_key.as_str().to_string()));
        }
        stash.push_lock(lock_key);
        Ok(())
    }

    /// Read path. Consults the stash, then the server, then merges every
    /// missing fragment into one database query; the combined result set is
    /// filtered, re-sorted and paged as a whole.
    pub async fn find_by_query_builder(
        &self,
        stash: &mut Stash,
        executor: Option<&dyn SqlExecutor>,
        builder: &QueryBuilder,
    ) -> Result<Vec<Record>> {
        let indexes = self.registered()?;
        if builder.is_for_update() {
            return self.find_for_update(stash, executor, builder, &indexes).await;
        }
        match plan(builder, &indexes.all(), &self.ty)? {
            Plan::Point { fragments, filters } => {
                self.find_point(stash, executor, builder, &indexes, fragments, filters)
                    .await
            }
            _ => self.find_direct(stash, executor, builder).await,
        }
    }

    /// Count matching rows, ignoring LIMIT/OFFSET
    pub async fn count_by_query_builder(
        &self,
        stash: &mut Stash,
        executor: Option<&dyn SqlExecutor>,
        builder: &QueryBuilder,
    ) -> Result<usize> {
        let rows = self
            .find_by_query_builder(stash, executor, &builder.without_paging())
            .await?;
        Ok(rows.len())
    }

    /// Load the full table through the database, bypassing index planning
    pub async fn find_all(
        &self,
        stash: &mut Stash,
        executor: Option<&dyn SqlExecutor>,
    ) -> Result<Vec<Record>> {
        let builder = QueryBuilder::new(self.ty.table());
        self.find_direct(stash, executor, &builder).await
    }

    /// Queries the cache cannot answer (range predicates, raw SQL, no
    /// covering index) go straight to the database.
    async fn find_direct(
        &self,
        stash: &mut Stash,
        executor: Option<&dyn SqlExecutor>,
        builder: &QueryBuilder,
    ) -> Result<Vec<Record>> {
        let executor = executor.ok_or(CacheError::NoConnection)?;
        let indexes = self.registered()?;
        let (sql, args) = builder.to_select_sql(&self.ty, self.dialect)?;
        let rows = executor.query(&sql, &args, &self.ty).await?;
        // Rows seen this transaction are visible to later point reads.
        for row in &rows {
            let shared = Arc::new(row.clone());
            let pk_key = indexes.primary().cache_key(&shared)?;
            stash.insert_record(pk_key.as_str().to_string(), shared);
        }
        Ok(rows)
    }

    /// Locking read: bypasses the stash, locks the planned keys, issues a
    /// row-lock SELECT and refreshes the stash with what came back.
    async fn find_for_update(
        &self,
        stash: &mut Stash,
        executor: Option<&dyn SqlExecutor>,
        builder: &QueryBuilder,
        indexes: &TableIndexes,
    ) -> Result<Vec<Record>> {
        let executor = executor.ok_or(CacheError::NoConnection)?;

        if self.opt.pessimistic_lock {
            if let Plan::Point { fragments, .. } = plan(builder, &indexes.all(), &self.ty)? {
                for fragment in &fragments {
                    self.lock(stash, &fragment.cache_key).await?;
                }
            }
        }

        let (sql, args) = builder.to_select_sql(&self.ty, self.dialect)?;
        let rows = executor.query(&sql, &args, &self.ty).await?;
        for row in &rows {
            let shared = Arc::new(row.clone());
            let pk_key = indexes.primary().cache_key(&shared)?;
            if self.opt.pessimistic_lock {
                self.lock(stash, &pk_key).await?;
            }
            self.refresh_row(stash, indexes, &shared, &pk_key)?;
        }
        Ok(rows)
    }

    /// Refresh stash entries for a row read under lock, scheduling the
    /// corresponding cache writes
    fn refresh_row(
        &self,
        stash: &mut Stash,
        indexes: &TableIndexes,
        row: &Arc<Record>,
        pk_key: &CacheKey,
    ) -> Result<()> {
        let pk_str = pk_key.as_str().to_string();
        stash.insert_record(pk_str.clone(), Arc::clone(row));
        self.schedule_value_set(stash, pk_key.clone(), encode_record(row)?);
        for index in indexes.unique().values() {
            let uq_key = index.cache_key(row)?;
            stash.set_unique(uq_key.as_str().to_string(), pk_str.clone());
            self.schedule_value_set(
                stash,
                uq_key,
                encode_primary_key(self.ty.version(), &pk_str),
            );
        }
        Ok(())
    }

    async fn find_point(
        &self,
        stash: &mut Stash,
        executor: Option<&dyn SqlExecutor>,
        builder: &QueryBuilder,
        indexes: &TableIndexes,
        fragments: Vec<QueryFragment>,
        filters: Vec<crate::query::Condition>,
    ) -> Result<Vec<Record>> {
        let mut set = QuerySet::new(fragments);
        let mut found: Vec<Record> = Vec::new();

        for i in 0..set.fragments().len() {
            let fragment = set.fragments()[i].clone();
            let negative_before = stash.is_negative(fragment.cache_key.as_str());
            match self.resolve_fragment(stash, &fragment).await? {
                // A cached list can lag a row whose indexed columns changed
                // this transaction; keep only rows still carrying the
                // fragment's binding values.
                Resolution::Rows(rows) => {
                    let mut stats = self.stats.write();
                    stats.hits += 1;
                    if negative_before || stash.is_negative(fragment.cache_key.as_str()) {
                        stats.negative_hits += 1;
                    }
                    drop(stats);
                    found.extend(rows.into_iter().filter(|row| fragment.matches(row)))
                }
                Resolution::Miss => {
                    self.stats.write().misses += 1;
                    set.mark_miss(i);
                }
            }
        }

        if set.has_misses() {
            let executor = executor.ok_or(CacheError::NoConnection)?;
            let (sql, args) = set.cache_miss_queries_to_sql(&self.ty, self.dialect)?;
            let rows = executor.query(&sql, &args, &self.ty).await?;

            let mut per_miss: HashMap<usize, Vec<Record>> = HashMap::new();
            for row in rows {
                match set.miss_for_record(&row) {
                    Some(i) => per_miss.entry(i).or_default().push(row),
                    None => log::debug!(
                        "row from {} does not match any missed fragment",
                        self.ty.table()
                    ),
                }
            }

            for i in set.miss_indexes().to_vec() {
                let fragment = set.fragments()[i].clone();
                let rows = per_miss.remove(&i).unwrap_or_default();
                if rows.is_empty() {
                    // Absorb repeat misses for this key.
                    self.schedule_negative(stash, fragment.cache_key.clone());
                    continue;
                }
                let mut pk_strs = Vec::with_capacity(rows.len());
                for row in rows {
                    let shared = Arc::new(row);
                    let pk_key = self.populate_from_db(stash, indexes, &shared)?;
                    pk_strs.push(pk_key.as_str().to_string());
                    found.push((*shared).clone());
                }
                if fragment.index.kind() == IndexKind::Key {
                    stash.set_pks(fragment.cache_key.as_str().to_string(), pk_strs.clone());
                    self.schedule_value_set(
                        stash,
                        fragment.cache_key.clone(),
                        encode_primary_key_list(self.ty.version(), &pk_strs),
                    );
                }
            }
        }

        found.retain(|row| filters.iter().all(|f| f.matches(row)));
        builder.sort_and_page_records(&mut found);
        Ok(found)
    }

    /// Stash a database row under its primary key and every unique key, and
    /// schedule the corresponding cache writes. Non-unique lists are only
    /// written for the fragment that was actually queried; a partial list
    /// would shadow rows the query never saw.
    fn populate_from_db(
        &self,
        stash: &mut Stash,
        indexes: &TableIndexes,
        row: &Arc<Record>,
    ) -> Result<CacheKey> {
        let pk_key = indexes.primary().cache_key(row)?;
        let pk_str = pk_key.as_str().to_string();
        stash.insert_record(pk_str.clone(), Arc::clone(row));
        self.schedule_value_set(stash, pk_key.clone(), encode_record(row)?);
        for index in indexes.unique().values() {
            let uq_key = index.cache_key(row)?;
            stash.set_unique(uq_key.as_str().to_string(), pk_str.clone());
            self.schedule_value_set(
                stash,
                uq_key,
                encode_primary_key(self.ty.version(), &pk_str),
            );
        }
        Ok(pk_key)
    }

    async fn resolve_fragment(
        &self,
        stash: &mut Stash,
        fragment: &QueryFragment,
    ) -> Result<Resolution> {
        let key = &fragment.cache_key;
        let key_str = key.as_str();
        if stash.is_negative(key_str) {
            return Ok(Resolution::Rows(Vec::new()));
        }
        match fragment.index.kind() {
            IndexKind::Primary => {
                if let Some(record) = stash.record(key_str) {
                    return Ok(Resolution::Rows(vec![(**record).clone()]));
                }
                match self.server.get(key).await? {
                    None => Ok(Resolution::Miss),
                    Some(entry) => {
                        if is_negative_marker(&entry.value) {
                            stash.mark_negative(key_str.to_string());
                            return Ok(Resolution::Rows(Vec::new()));
                        }
                        match decode_record(&self.ty, &entry.value) {
                            Ok(record) => {
                                let shared = Arc::new(record);
                                stash.insert_record(key_str.to_string(), Arc::clone(&shared));
                                if self.opt.optimistic_lock {
                                    stash.set_cas(key_str.to_string(), entry.cas);
                                }
                                Ok(Resolution::Rows(vec![(*shared).clone()]))
                            }
                            Err(CacheError::SchemaMismatch { encoded, expected }) => {
                                log::debug!(
                                    "stale schema {} (expected {}) under {}; treating as miss",
                                    encoded,
                                    expected,
                                    key_str
                                );
                                Ok(Resolution::Miss)
                            }
                            Err(e) => Err(e),
                        }
                    }
                }
            }
            IndexKind::Unique => {
                let pk_str = match stash.unique(key_str) {
                    Some(pk) => Some(pk.to_string()),
                    None => match self.server.get(key).await? {
                        None => None,
                        Some(entry) => {
                            if is_negative_marker(&entry.value) {
                                stash.mark_negative(key_str.to_string());
                                return Ok(Resolution::Rows(Vec::new()));
                            }
                            match decode_primary_key(self.ty.version(), &entry.value) {
                                Ok(pk) => {
                                    stash.set_unique(key_str.to_string(), pk.clone());
                                    if self.opt.optimistic_lock {
                                        stash.set_cas(key_str.to_string(), entry.cas);
                                    }
                                    Some(pk)
                                }
                                Err(CacheError::SchemaMismatch { .. }) => None,
                                Err(e) => return Err(e),
                            }
                        }
                    },
                };
                match pk_str {
                    None => Ok(Resolution::Miss),
                    Some(pk) => match self.resolve_pk_set(stash, &[pk]).await? {
                        Some(rows) => Ok(Resolution::Rows(rows)),
                        None => Ok(Resolution::Miss),
                    },
                }
            }
            IndexKind::Key => {
                let pks = match stash.pks(key_str) {
                    Some(pks) => Some(pks.clone()),
                    None => match self.server.get(key).await? {
                        None => None,
                        Some(entry) => {
                            if is_negative_marker(&entry.value) {
                                stash.mark_negative(key_str.to_string());
                                return Ok(Resolution::Rows(Vec::new()));
                            }
                            match decode_primary_key_list(self.ty.version(), &entry.value) {
                                Ok(pks) => {
                                    stash.set_pks(key_str.to_string(), pks.clone());
                                    if self.opt.optimistic_lock {
                                        stash.set_cas(key_str.to_string(), entry.cas);
                                    }
                                    Some(pks)
                                }
                                Err(CacheError::SchemaMismatch { .. }) => None,
                                Err(e) => return Err(e),
                            }
                        }
                    },
                };
                match pks {
                    None => Ok(Resolution::Miss),
                    Some(pks) => match self.resolve_pk_set(stash, &pks).await? {
                        Some(rows) => Ok(Resolution::Rows(rows)),
                        None => Ok(Resolution::Miss),
                    },
                }
            }
        }
    }

    /// Resolve a set of primary cache keys to rows: stash first, then one
    /// batched server fetch. `None` when any key resolves nowhere, which
    /// sends the whole fragment to the database. Keys deleted within this
    /// transaction are skipped, not treated as misses.
    async fn resolve_pk_set(
        &self,
        stash: &mut Stash,
        pk_strs: &[String],
    ) -> Result<Option<Vec<Record>>> {
        let mut rows = Vec::with_capacity(pk_strs.len());
        let mut missing: Vec<CacheKey> = Vec::new();
        for pk in pk_strs {
            if stash.is_negative(pk) {
                continue;
            }
            if let Some(record) = stash.record(pk) {
                rows.push((**record).clone());
            } else {
                missing.push(CacheKey::from_raw(pk, self.opt.shard_key.as_deref())?);
            }
        }
        if missing.is_empty() {
            return Ok(Some(rows));
        }
        let fetched = self.server.get_multi(&missing).await?;
        for key in &missing {
            let entry = match fetched.get(key.as_str()) {
                Some(entry) => entry,
                None => return Ok(None),
            };
            if is_negative_marker(&entry.value) {
                stash.mark_negative(key.as_str().to_string());
                continue;
            }
            match decode_record(&self.ty, &entry.value) {
                Ok(record) => {
                    let shared = Arc::new(record);
                    stash.insert_record(key.as_str().to_string(), Arc::clone(&shared));
                    if self.opt.optimistic_lock {
                        stash.set_cas(key.as_str().to_string(), entry.cas);
                    }
                    rows.push((*shared).clone());
                }
                Err(CacheError::SchemaMismatch { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Ok(Some(rows))
    }

    /// Write path: INSERT. Captures the generated primary key, owns the new
    /// row in the stash and schedules cache writes; secondary lists not
    /// held in the stash are invalidated instead of partially updated.
    pub async fn create(
        &self,
        stash: &mut Stash,
        executor: Option<&dyn SqlExecutor>,
        mut record: Record,
    ) -> Result<u64> {
        let executor = executor.ok_or(CacheError::NoConnection)?;
        let indexes = self.registered()?;
        let primary = indexes.primary();

        let auto_pk_column = self.auto_increment_column(primary, &record);
        let insert_columns: Vec<(String, Value)> = self
            .ty
            .columns()
            .iter()
            .filter(|c| auto_pk_column.as_deref() != Some(c.name.as_str()))
            .map(|c| {
                let value = record.get(&c.name).cloned().unwrap_or_else(|| c.ty.nil_value());
                (c.name.clone(), value)
            })
            .collect();
        let (sql, args) = insert_sql(self.ty.table(), &insert_columns, self.dialect)?;
        let result = executor.exec(&sql, &args).await?;

        if let Some(column) = auto_pk_column {
            let aligned = align_value(&Value::from(result.last_insert_id), &column, &self.ty)?;
            record.set(&column, aligned)?;
        }

        let shared = Arc::new(record);
        let pk_key = primary.cache_key(&shared)?;
        if self.opt.pessimistic_lock {
            self.lock(stash, &pk_key).await?;
        }

        let pk_str = pk_key.as_str().to_string();
        stash.insert_record(pk_str.clone(), Arc::clone(&shared));
        self.schedule_value_set(stash, pk_key, encode_record(&shared)?);

        for index in indexes.unique().values() {
            let uq_key = index.cache_key(&shared)?;
            if self.opt.pessimistic_lock {
                self.lock(stash, &uq_key).await?;
            }
            stash.set_unique(uq_key.as_str().to_string(), pk_str.clone());
            self.schedule_value_set(
                stash,
                uq_key,
                encode_primary_key(self.ty.version(), &pk_str),
            );
        }

        for index in indexes.keys().values() {
            let idx_key = index.cache_key(&shared)?;
            if self.opt.pessimistic_lock {
                self.lock(stash, &idx_key).await?;
            }
            let idx_str = idx_key.as_str().to_string();
            if stash.holds_pks(&idx_str) {
                stash.push_pk(&idx_str, pk_str.clone());
                let pks = stash.pks(&idx_str).cloned().unwrap_or_default();
                self.schedule_value_set(
                    stash,
                    idx_key,
                    encode_primary_key_list(self.ty.version(), &pks),
                );
            } else {
                self.schedule_delete(stash, idx_key);
            }
        }

        Ok(result.last_insert_id)
    }

    /// Write path: UPDATE. Affected rows are resolved through the read
    /// path; any change to an indexed column invalidates the old index keys
    /// and refreshes the new ones, and the primary-key value is always
    /// rewritten.
    pub async fn update(
        &self,
        stash: &mut Stash,
        executor: Option<&dyn SqlExecutor>,
        builder: &QueryBuilder,
        assignments: &[(String, Value)],
    ) -> Result<u64> {
        let executor = executor.ok_or(CacheError::NoConnection)?;
        let indexes = self.registered()?;

        let aligned: Vec<(String, Value)> = assignments
            .iter()
            .map(|(column, value)| Ok((column.clone(), align_value(value, column, &self.ty)?)))
            .collect::<Result<_>>()?;

        let rows = self
            .find_by_query_builder(stash, Some(executor), builder)
            .await?;

        let (sql, args) = builder.to_update_sql(&aligned, self.dialect)?;
        let result = executor.exec(&sql, &args).await?;

        for row in rows {
            let old = Arc::new(row);
            let mut updated = (*old).clone();
            for (column, value) in &aligned {
                updated.set(column, value.clone())?;
            }
            let new = Arc::new(updated);
            self.apply_row_update(stash, &indexes, &old, &new).await?;
        }
        Ok(result.rows_affected)
    }

    async fn apply_row_update(
        &self,
        stash: &mut Stash,
        indexes: &TableIndexes,
        old: &Arc<Record>,
        new: &Arc<Record>,
    ) -> Result<()> {
        let old_pk = indexes.primary().cache_key(old)?;
        let new_pk = indexes.primary().cache_key(new)?;
        if self.opt.pessimistic_lock {
            self.lock(stash, &new_pk).await?;
        }

        let new_pk_str = new_pk.as_str().to_string();
        stash.insert_record(new_pk_str.clone(), Arc::clone(new));
        self.schedule_value_set(stash, new_pk.clone(), encode_record(new)?);
        if old_pk.as_str() != new_pk.as_str() {
            stash.remove_record(old_pk.as_str());
            stash.mark_negative(old_pk.as_str().to_string());
            self.schedule_delete(stash, old_pk);
        }

        for index in indexes.unique().values() {
            let old_key = index.cache_key(old)?;
            let new_key = index.cache_key(new)?;
            if old_key.as_str() == new_key.as_str() {
                continue;
            }
            if self.opt.pessimistic_lock {
                self.lock(stash, &old_key).await?;
                self.lock(stash, &new_key).await?;
            }
            stash.remove_unique(old_key.as_str());
            stash.mark_negative(old_key.as_str().to_string());
            self.schedule_delete(stash, old_key);
            stash.set_unique(new_key.as_str().to_string(), new_pk_str.clone());
            self.schedule_value_set(
                stash,
                new_key,
                encode_primary_key(self.ty.version(), &new_pk_str),
            );
        }

        for index in indexes.keys().values() {
            let old_key = index.cache_key(old)?;
            let new_key = index.cache_key(new)?;
            if old_key.as_str() == new_key.as_str() {
                continue;
            }
            if self.opt.pessimistic_lock {
                self.lock(stash, &old_key).await?;
                self.lock(stash, &new_key).await?;
            }
            stash.pull_pk(old_key.as_str(), &new_pk_str);
            self.schedule_delete(stash, old_key);
            let new_str = new_key.as_str().to_string();
            stash.clear_negative(&new_str);
            if stash.holds_pks(&new_str) {
                stash.push_pk(&new_str, new_pk_str.clone());
                let pks = stash.pks(&new_str).cloned().unwrap_or_default();
                self.schedule_value_set(
                    stash,
                    new_key,
                    encode_primary_key_list(self.ty.version(), &pks),
                );
            } else {
                self.schedule_delete(stash, new_key);
            }
        }
        Ok(())
    }

    /// Write path: DELETE. Affected rows are resolved through the read
    /// path; the primary key and every index key they participate in are
    /// scheduled for deletion.
    pub async fn delete(
        &self,
        stash: &mut Stash,
        executor: Option<&dyn SqlExecutor>,
        builder: &QueryBuilder,
    ) -> Result<u64> {
        let executor = executor.ok_or(CacheError::NoConnection)?;
        let indexes = self.registered()?;

        let rows = self
            .find_by_query_builder(stash, Some(executor), builder)
            .await?;

        let (sql, args) = builder.to_delete_sql(self.dialect)?;
        let result = executor.exec(&sql, &args).await?;

        for row in rows {
            let row = Arc::new(row);
            let pk_key = indexes.primary().cache_key(&row)?;
            if self.opt.pessimistic_lock {
                self.lock(stash, &pk_key).await?;
            }
            let pk_str = pk_key.as_str().to_string();
            stash.remove_record(&pk_str);
            stash.mark_negative(pk_str.clone());
            self.schedule_delete(stash, pk_key);

            for index in indexes.unique().values() {
                let uq_key = index.cache_key(&row)?;
                if self.opt.pessimistic_lock {
                    self.lock(stash, &uq_key).await?;
                }
                stash.remove_unique(uq_key.as_str());
                stash.mark_negative(uq_key.as_str().to_string());
                self.schedule_delete(stash, uq_key);
            }
            for index in indexes.keys().values() {
                let idx_key = index.cache_key(&row)?;
                if self.opt.pessimistic_lock {
                    self.lock(stash, &idx_key).await?;
                }
                stash.pull_pk(idx_key.as_str(), &pk_str);
                self.schedule_delete(stash, idx_key);
            }
        }
        Ok(result.rows_affected)
    }

    /// Single-column auto-increment primary key left nil by the caller
    fn auto_increment_column(&self, primary: &Arc<Index>, record: &Record) -> Option<String> {
        let columns: Vec<&String> = primary
            .columns()
            .iter()
            .filter(|c| self.opt.shard_key.as_deref() != Some(c.as_str()))
            .collect();
        if columns.len() != 1 {
            return None;
        }
        let column = columns[0];
        match record.get(column) {
            Some(value) if value.is_nil() => Some(column.clone()),
            _ => None,
        }
    }
}
