//! # First-Level Cache
//!
//! Process-local cache of a fully pre-loaded read-only table. Warm-up
//! streams the whole table once, builds one B+Tree per registered index
//! (leaves share a single decoded copy of each row) and publishes the
//! result behind an atomic pointer. Reads are lock-free from then on; a
//! re-warm-up after a schema change builds a fresh snapshot and swaps the
//! pointer.

use crate::btree::BPlusTree;
use crate::error::{CacheError, Result};
use crate::executor::{index_columns_from_records, introspection_record_type, Dialect, SqlExecutor};
use crate::index::{indexes_from_introspection, TableIndexes};
use crate::query::{plan, Plan, QueryBuilder};
use crate::value::{Record, RecordType, Value};
use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;

struct Snapshot {
    indexes: TableIndexes,
    trees: HashMap<String, BPlusTree>,
    row_count: usize,
}

/// Read-only in-process cache of one table
pub struct FirstLevelCache {
    ty: Arc<RecordType>,
    dialect: Dialect,
    snapshot: ArcSwapOption<Snapshot>,
}

impl FirstLevelCache {
    /// Create an unloaded cache for a table
    pub fn new(ty: Arc<RecordType>, dialect: Dialect) -> Self {
        Self {
            ty,
            dialect,
            snapshot: ArcSwapOption::const_empty(),
        }
    }

    /// Table descriptor
    pub fn ty(&self) -> &Arc<RecordType> {
        &self.ty
    }

    /// Stream the full table and rebuild every index tree. Safe to call
    /// again after an ALTER; readers keep the previous snapshot until the
    /// swap.
    pub async fn warm_up(&self, executor: &dyn SqlExecutor) -> Result<()> {
        let table = self.ty.table();

        let introspection_sql = self.dialect.index_introspection_sql(table);
        let introspection_rows = executor
            .query(&introspection_sql, &[], &introspection_record_type())
            .await?;
        let index_columns = index_columns_from_records(&introspection_rows)?;
        let indexes = indexes_from_introspection(table, index_columns, None)?;

        let (select_sql, select_args) =
            QueryBuilder::new(table).to_select_sql(&self.ty, self.dialect)?;
        let rows = executor.query(&select_sql, &select_args, &self.ty).await?;
        let shared: Vec<Arc<Record>> = rows.into_iter().map(Arc::new).collect();

        let mut trees = HashMap::new();
        for index in indexes.all() {
            let mut pairs = Vec::with_capacity(shared.len());
            for row in &shared {
                let mut key = Vec::with_capacity(index.columns().len());
                for column in index.columns() {
                    let value = row.get(column).ok_or_else(|| CacheError::MissingColumn {
                        column: column.clone(),
                        index: index.name().to_string(),
                    })?;
                    key.push(value.clone());
                }
                pairs.push((key, Arc::clone(row)));
            }
            trees.insert(index.name().to_string(), BPlusTree::build(pairs));
        }

        log::info!(
            "warmed up read-only table {} with {} row(s) across {} index(es)",
            table,
            shared.len(),
            trees.len()
        );
        self.snapshot.store(Some(Arc::new(Snapshot {
            indexes,
            trees,
            row_count: shared.len(),
        })));
        Ok(())
    }

    /// Number of rows in the current snapshot
    pub fn row_count(&self) -> usize {
        self.snapshot
            .load()
            .as_ref()
            .map(|s| s.row_count)
            .unwrap_or(0)
    }

    fn loaded(&self) -> Result<Arc<Snapshot>> {
        self.snapshot
            .load_full()
            .ok_or_else(|| CacheError::UnknownTable(self.ty.table().to_string()))
    }

    /// Point lookup by a single-column primary key
    pub async fn find_by_primary_key(&self, value: impl Into<Value>) -> Result<Option<Arc<Record>>> {
        let snapshot = self.loaded()?;
        let primary = snapshot.indexes.primary();
        if primary.columns().len() != 1 {
            return Err(CacheError::InvalidQuery(format!(
                "primary key of {} spans {} columns; use a query builder",
                self.ty.table(),
                primary.columns().len()
            )));
        }
        let builder = QueryBuilder::new(self.ty.table()).eq(&primary.columns()[0], value);
        let mut rows = self.execute(&snapshot, &builder)?;
        builder.sort_and_page_records(&mut rows);
        Ok(rows.into_iter().next())
    }

    /// Run a query against the snapshot: index lookup or range scan, then
    /// in-memory filters, ORDER BY, LIMIT/OFFSET
    pub async fn find_by_query_builder(&self, builder: &QueryBuilder) -> Result<Vec<Arc<Record>>> {
        let snapshot = self.loaded()?;
        let mut rows = self.execute(&snapshot, builder)?;
        builder.sort_and_page_records(&mut rows);
        Ok(rows)
    }

    /// All rows in primary-key order
    pub async fn find_all(&self) -> Result<Vec<Arc<Record>>> {
        let snapshot = self.loaded()?;
        let primary = snapshot.indexes.primary().name().to_string();
        Ok(snapshot.trees[&primary].iter_all())
    }

    /// Count rows matching a query, ignoring LIMIT/OFFSET
    pub async fn count_by_query_builder(&self, builder: &QueryBuilder) -> Result<usize> {
        let snapshot = self.loaded()?;
        Ok(self.execute(&snapshot, builder)?.len())
    }

    fn execute(&self, snapshot: &Snapshot, builder: &QueryBuilder) -> Result<Vec<Arc<Record>>> {
        if builder.table() != self.ty.table() {
            return Err(CacheError::UnknownTable(builder.table().to_string()));
        }
        let indexes = snapshot.indexes.all();
        match plan(builder, &indexes, &self.ty)? {
            Plan::Point { fragments, filters } => {
                let mut rows = Vec::new();
                for fragment in fragments {
                    let tree = &snapshot.trees[fragment.index.name()];
                    let key: Vec<Value> =
                        fragment.bindings.iter().map(|(_, v)| v.clone()).collect();
                    rows.extend(tree.get(&key).iter().cloned());
                }
                rows.retain(|row| filters.iter().all(|f| f.matches(row)));
                Ok(rows)
            }
            Plan::Range {
                index,
                prefix,
                lower,
                upper,
                filters,
            } => {
                let tree = &snapshot.trees[index.name()];
                let mut lower_key: Vec<Value> = prefix.iter().map(|(_, v)| v.clone()).collect();
                let mut upper_key = lower_key.clone();
                let lower_bound = match &lower {
                    Some(bound) => {
                        lower_key.push(bound.value.clone());
                        if bound.inclusive {
                            Bound::Included(lower_key.as_slice())
                        } else {
                            Bound::Excluded(lower_key.as_slice())
                        }
                    }
                    None if !lower_key.is_empty() => Bound::Included(lower_key.as_slice()),
                    None => Bound::Unbounded,
                };
                let upper_bound = match &upper {
                    Some(bound) => {
                        upper_key.push(bound.value.clone());
                        if bound.inclusive {
                            Bound::Included(upper_key.as_slice())
                        } else {
                            Bound::Excluded(upper_key.as_slice())
                        }
                    }
                    None if !upper_key.is_empty() => Bound::Included(upper_key.as_slice()),
                    None => Bound::Unbounded,
                };
                let mut rows = tree.range(lower_bound, upper_bound);
                rows.retain(|row| filters.iter().all(|f| f.matches(row)));
                Ok(rows)
            }
            Plan::FullScan { filters } => {
                let primary = snapshot.indexes.primary().name().to_string();
                let mut rows = snapshot.trees[&primary].iter_all();
                rows.retain(|row| filters.iter().all(|f| f.matches(row)));
                Ok(rows)
            }
            Plan::Direct => Err(CacheError::InvalidQuery(format!(
                "raw conditions cannot run against read-only table {}",
                self.ty.table()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecResult;
    use crate::index::IndexKind;
    use crate::value::RecordTypeBuilder;
    use async_trait::async_trait;

    fn event_type() -> Arc<RecordType> {
        RecordTypeBuilder::new("events")
            .uint64("id")
            .uint64("event_id")
            .uint64("start_week")
            .uint64("end_week")
            .string("term")
            .build()
    }

    /// Scripted executor: serves introspection rows and the full table.
    struct FixtureExecutor {
        indexes: Vec<(String, IndexKind, Vec<String>)>,
        rows: Vec<Record>,
    }

    #[async_trait]
    impl SqlExecutor for FixtureExecutor {
        async fn query(
            &self,
            sql: &str,
            _args: &[Value],
            ty: &Arc<RecordType>,
        ) -> Result<Vec<Record>> {
            if sql.contains("information_schema") || sql.contains("pg_index") {
                let mut out = Vec::new();
                for (name, kind, columns) in &self.indexes {
                    for (seq, column) in columns.iter().enumerate() {
                        let mut row = Record::new(Arc::clone(ty));
                        row.set("index_name", name.as_str())?;
                        row.set(
                            "kind",
                            match kind {
                                IndexKind::Primary => "primary",
                                IndexKind::Unique => "unique",
                                IndexKind::Key => "key",
                            },
                        )?;
                        row.set("column_name", column.as_str())?;
                        row.set("seq", seq as u64)?;
                        out.push(row);
                    }
                }
                return Ok(out);
            }
            Ok(self.rows.clone())
        }

        async fn exec(&self, _sql: &str, _args: &[Value]) -> Result<ExecResult> {
            unreachable!("read-only fixture")
        }

        async fn commit(&self) -> Result<()> {
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            Ok(())
        }
    }

    /// 4000 rows: event_id cycles 1..=1000 four times, each cycle under its
    /// own (start_week, end_week) window; only the second window is
    /// "daytime".
    async fn seeded_cache() -> FirstLevelCache {
        let ty = event_type();
        let mut rows = Vec::with_capacity(4000);
        for id in 1..=4000u64 {
            let cycle = (id - 1) / 1000;
            let mut row = Record::new(Arc::clone(&ty));
            row.set("id", id).unwrap();
            row.set("event_id", (id - 1) % 1000 + 1).unwrap();
            row.set("start_week", cycle * 12 + 1).unwrap();
            row.set("end_week", cycle * 12 + 12).unwrap();
            row.set("term", if cycle == 1 { "daytime" } else { "evening" })
                .unwrap();
            rows.push(row);
        }
        let executor = FixtureExecutor {
            indexes: vec![
                (
                    "PRIMARY".to_string(),
                    IndexKind::Primary,
                    vec!["id".to_string()],
                ),
                (
                    "idx_event".to_string(),
                    IndexKind::Key,
                    vec!["event_id".to_string()],
                ),
            ],
            rows,
        };
        let cache = FirstLevelCache::new(ty, Dialect::MySql);
        cache.warm_up(&executor).await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_unloaded_cache_reports_unknown_table() {
        let cache = FirstLevelCache::new(event_type(), Dialect::MySql);
        let err = cache.find_all().await.unwrap_err();
        assert!(matches!(err, CacheError::UnknownTable(_)));
    }

    #[tokio::test]
    async fn test_range_query_with_filters() {
        let cache = seeded_cache().await;
        // event_id=1 appears in four windows; the window and term
        // predicates pin exactly one of them.
        let builder = QueryBuilder::new("events")
            .eq("event_id", 1u64)
            .gte("start_week", 12u64)
            .lte("end_week", 24u64)
            .eq("term", "daytime");
        let rows = cache.find_by_query_builder(&builder).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uint64("id"), Some(1001));
        assert_eq!(rows[0].uint64("start_week"), Some(13));
    }

    #[tokio::test]
    async fn test_in_query_returns_one_row_per_value() {
        let cache = seeded_cache().await;
        let builder = QueryBuilder::new("events").is_in("id", vec![1u64, 2, 3, 4, 5]);
        let rows = cache.find_by_query_builder(&builder).await.unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn test_find_by_primary_key() {
        let cache = seeded_cache().await;
        let row = cache.find_by_primary_key(42u64).await.unwrap().unwrap();
        assert_eq!(row.uint64("id"), Some(42));
        assert!(cache.find_by_primary_key(9999u64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_all_and_count() {
        let cache = seeded_cache().await;
        assert_eq!(cache.find_all().await.unwrap().len(), 4000);
        let builder = QueryBuilder::new("events").eq("event_id", 5u64);
        assert_eq!(cache.count_by_query_builder(&builder).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_order_and_paging() {
        let cache = seeded_cache().await;
        let builder = QueryBuilder::new("events")
            .eq("event_id", 5u64)
            .order_desc("id")
            .limit(2)
            .offset(1);
        let rows = cache.find_by_query_builder(&builder).await.unwrap();
        let ids: Vec<u64> = rows.iter().map(|r| r.uint64("id").unwrap()).collect();
        assert_eq!(ids, vec![2005, 1005]);
    }

    #[tokio::test]
    async fn test_rewarm_swaps_snapshot() {
        let cache = seeded_cache().await;
        assert_eq!(cache.row_count(), 4000);
        let executor = FixtureExecutor {
            indexes: vec![(
                "PRIMARY".to_string(),
                IndexKind::Primary,
                vec!["id".to_string()],
            )],
            rows: vec![{
                let mut row = Record::new(event_type());
                row.set("id", 1u64).unwrap();
                row
            }],
        };
        cache.warm_up(&executor).await.unwrap();
        assert_eq!(cache.row_count(), 1);
    }
}
