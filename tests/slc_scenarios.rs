//! Second-level cache scenarios: read-through/write-through behavior,
//! index invalidation on write, negative caching and recovery.

mod common;

use common::MockExecutor;
use std::sync::Arc;
use tiercache::{
    CacheError, Config, IndexKind, InMemoryServer, KVServer, QueryBuilder, Record, RecordType,
    RecordTypeBuilder, SqlExecutor, TierCache, Value,
};

fn login_type() -> Arc<RecordType> {
    RecordTypeBuilder::new("user_logins")
        .uint64("id")
        .uint64("user_id")
        .uint64("user_session_id")
        .uint64("login_param_id")
        .build()
}

fn login_type_v2() -> Arc<RecordType> {
    RecordTypeBuilder::new("user_logins")
        .uint64("id")
        .uint64("user_id")
        .uint64("user_session_id")
        .uint64("login_param_id")
        .version(2)
        .build()
}

fn login_indexes() -> Vec<common::IndexSpec> {
    vec![
        (
            "PRIMARY".to_string(),
            IndexKind::Primary,
            vec!["id".to_string()],
        ),
        (
            "uq_session".to_string(),
            IndexKind::Unique,
            vec!["user_id".to_string(), "user_session_id".to_string()],
        ),
        (
            "idx_param".to_string(),
            IndexKind::Key,
            vec!["user_id".to_string(), "login_param_id".to_string()],
        ),
    ]
}

fn seeded_executor(ty: &Arc<RecordType>) -> Arc<MockExecutor> {
    let executor = Arc::new(MockExecutor::new());
    executor.add_table(Arc::clone(ty), login_indexes(), Some("id"));
    let mut row = Record::new(Arc::clone(ty));
    row.set("id", 1u64).unwrap();
    row.set("user_id", 1u64).unwrap();
    row.set("user_session_id", 1u64).unwrap();
    row.set("login_param_id", 1u64).unwrap();
    executor.seed_row(row);
    executor
}

async fn setup() -> (TierCache, Arc<MockExecutor>) {
    common::init_logging();
    let ty = login_type();
    let executor = seeded_executor(&ty);
    let cache = TierCache::connect(Config::default()).await.unwrap();
    cache.warm_up(executor.as_ref(), ty).await.unwrap();
    (cache, executor)
}

fn conn(executor: &Arc<MockExecutor>) -> Arc<dyn SqlExecutor> {
    Arc::clone(executor) as Arc<dyn SqlExecutor>
}

#[tokio::test]
async fn test_read_through_then_cache_then_stash() {
    let (cache, executor) = setup().await;
    let builder = QueryBuilder::new("user_logins")
        .eq("user_id", 1u64)
        .eq("user_session_id", 1u64);

    // Cold cache: the database answers.
    let mut tx1 = cache.begin(Some(conn(&executor)));
    let rows = tx1.find_by_query_builder(&builder).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(executor.select_count("user_logins"), 1);
    tx1.commit().await.unwrap();

    // New transaction: served entirely by the cache server.
    let mut tx2 = cache.begin(Some(conn(&executor)));
    let rows = tx2.find_by_query_builder(&builder).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(executor.select_count("user_logins"), 1);

    // Same transaction again: served by the stash.
    let rows = tx2.find_by_query_builder(&builder).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].uint64("login_param_id"), Some(1));
    assert_eq!(executor.select_count("user_logins"), 1);
    tx2.rollback_unless_committed().await.unwrap();

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.rollbacks, 1);
    assert!(stats.hit_rate > 0.5);
}

#[tokio::test]
async fn test_index_invalidation_on_update() {
    let (cache, executor) = setup().await;
    let by_old_param = QueryBuilder::new("user_logins")
        .eq("user_id", 1u64)
        .eq("login_param_id", 1u64);
    let by_new_param = QueryBuilder::new("user_logins")
        .eq("user_id", 1u64)
        .eq("login_param_id", 10u64);

    // Prime the secondary-index entry.
    let mut tx0 = cache.begin(Some(conn(&executor)));
    assert_eq!(
        tx0.find_by_query_builder(&by_old_param).await.unwrap().len(),
        1
    );
    tx0.commit().await.unwrap();

    // Change the indexed column.
    let mut tx1 = cache.begin(Some(conn(&executor)));
    let affected = tx1
        .update_by_query_builder(
            &QueryBuilder::new("user_logins").eq("id", 1u64),
            &[("login_param_id", Value::from(10u64))],
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);
    tx1.commit().await.unwrap();

    // Old index value: zero rows. New index value: the row.
    let mut tx2 = cache.begin(Some(conn(&executor)));
    assert_eq!(
        tx2.find_by_query_builder(&by_old_param).await.unwrap().len(),
        0
    );
    let rows = tx2.find_by_query_builder(&by_new_param).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].uint64("login_param_id"), Some(10));
    tx2.rollback_unless_committed().await.unwrap();
}

#[tokio::test]
async fn test_read_after_write_in_same_transaction() {
    let (cache, executor) = setup().await;
    let mut tx = cache.begin(Some(conn(&executor)));
    tx.update_by_query_builder(
        &QueryBuilder::new("user_logins").eq("id", 1u64),
        &[("login_param_id", Value::from(42u64))],
    )
    .await
    .unwrap();

    let rows = tx
        .find_by_query_builder(&QueryBuilder::new("user_logins").eq("id", 1u64))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].uint64("login_param_id"), Some(42));
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_negative_cache_absorbs_repeat_misses() {
    let (cache, executor) = setup().await;
    let builder = QueryBuilder::new("user_logins").eq("id", 999u64);

    let mut tx1 = cache.begin(Some(conn(&executor)));
    assert!(tx1.find_by_query_builder(&builder).await.unwrap().is_empty());
    assert_eq!(executor.select_count("user_logins"), 1);
    // Second miss in the same transaction is absorbed by the stash.
    assert!(tx1.find_by_query_builder(&builder).await.unwrap().is_empty());
    assert_eq!(executor.select_count("user_logins"), 1);
    tx1.commit().await.unwrap();

    // After commit the marker lives on the server.
    let mut tx2 = cache.begin(Some(conn(&executor)));
    assert!(tx2.find_by_query_builder(&builder).await.unwrap().is_empty());
    assert_eq!(executor.select_count("user_logins"), 1);
    tx2.rollback_unless_committed().await.unwrap();
}

#[tokio::test]
async fn test_create_assigns_generated_key_and_caches() {
    let (cache, executor) = setup().await;
    let mut tx = cache.begin(Some(conn(&executor)));
    let mut row = Record::new(login_type());
    row.set("user_id", 2u64).unwrap();
    row.set("user_session_id", 7u64).unwrap();
    row.set("login_param_id", 3u64).unwrap();
    let id = tx.create_by_table(row).await.unwrap();
    assert_eq!(id, 2);

    // Visible in the same transaction through the unique index.
    let rows = tx
        .find_by_query_builder(
            &QueryBuilder::new("user_logins")
                .eq("user_id", 2u64)
                .eq("user_session_id", 7u64),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].uint64("id"), Some(2));
    tx.commit().await.unwrap();

    // And from the cache afterwards.
    let selects = executor.select_count("user_logins");
    let mut tx2 = cache.begin(Some(conn(&executor)));
    let rows = tx2
        .find_by_query_builder(&QueryBuilder::new("user_logins").eq("id", 2u64))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(executor.select_count("user_logins"), selects);
    tx2.rollback_unless_committed().await.unwrap();
}

#[tokio::test]
async fn test_delete_purges_every_index_key() {
    let (cache, executor) = setup().await;

    // Prime all paths.
    let mut tx0 = cache.begin(Some(conn(&executor)));
    tx0.find_by_query_builder(
        &QueryBuilder::new("user_logins")
            .eq("user_id", 1u64)
            .eq("user_session_id", 1u64),
    )
    .await
    .unwrap();
    tx0.commit().await.unwrap();

    let mut tx1 = cache.begin(Some(conn(&executor)));
    let affected = tx1
        .delete_by_query_builder(&QueryBuilder::new("user_logins").eq("id", 1u64))
        .await
        .unwrap();
    assert_eq!(affected, 1);
    // Deleted row is gone within the same transaction.
    assert!(tx1
        .find_by_query_builder(&QueryBuilder::new("user_logins").eq("id", 1u64))
        .await
        .unwrap()
        .is_empty());
    tx1.commit().await.unwrap();

    // And gone for later transactions via every index.
    let mut tx2 = cache.begin(Some(conn(&executor)));
    assert!(tx2
        .find_by_query_builder(
            &QueryBuilder::new("user_logins")
                .eq("user_id", 1u64)
                .eq("user_session_id", 1u64)
        )
        .await
        .unwrap()
        .is_empty());
    assert!(executor.rows("user_logins").is_empty());
    tx2.rollback_unless_committed().await.unwrap();
}

#[tokio::test]
async fn test_schema_version_gates_cached_entries() {
    let server: Arc<InMemoryServer> = Arc::new(InMemoryServer::new());
    let ty_v1 = login_type();
    let executor = seeded_executor(&ty_v1);

    let cache_v1 = TierCache::new(Config::default(), server.clone() as Arc<dyn KVServer>);
    cache_v1.warm_up(executor.as_ref(), ty_v1).await.unwrap();
    let mut tx = cache_v1.begin(Some(conn(&executor)));
    tx.find_by_query_builder(&QueryBuilder::new("user_logins").eq("id", 1u64))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(executor.select_count("user_logins"), 1);

    // A process running the next schema version treats the entry as a miss.
    let cache_v2 = TierCache::new(Config::default(), server as Arc<dyn KVServer>);
    cache_v2
        .warm_up(executor.as_ref(), login_type_v2())
        .await
        .unwrap();
    let mut tx = cache_v2.begin(Some(conn(&executor)));
    let rows = tx
        .find_by_query_builder(&QueryBuilder::new("user_logins").eq("id", 1u64))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(executor.select_count("user_logins"), 2);
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_recover_purges_logged_keys() {
    let (cache, executor) = setup().await;
    let builder = QueryBuilder::new("user_logins").eq("id", 1u64);

    let mut tx1 = cache.begin(Some(conn(&executor)));
    tx1.find_by_query_builder(&builder).await.unwrap();
    tx1.commit().await.unwrap();
    let logs = tx1.query_logs().to_vec();
    assert!(!logs.is_empty());

    // Cached: no extra database traffic.
    let mut tx2 = cache.begin(Some(conn(&executor)));
    tx2.find_by_query_builder(&builder).await.unwrap();
    assert_eq!(executor.select_count("user_logins"), 1);
    tx2.rollback_unless_committed().await.unwrap();

    cache.recover(&logs).await.unwrap();

    // Purged: the database answers again.
    let mut tx3 = cache.begin(Some(conn(&executor)));
    tx3.find_by_query_builder(&builder).await.unwrap();
    assert_eq!(executor.select_count("user_logins"), 2);
    tx3.rollback_unless_committed().await.unwrap();
}

#[tokio::test]
async fn test_ignored_table_bypasses_cache() {
    let (cache, executor) = setup().await;
    cache.ignore_table("user_logins");

    let builder = QueryBuilder::new("user_logins").eq("id", 1u64);
    let mut tx = cache.begin(Some(conn(&executor)));
    assert_eq!(tx.find_by_query_builder(&builder).await.unwrap().len(), 1);
    assert_eq!(tx.find_by_query_builder(&builder).await.unwrap().len(), 1);
    // Every read hits the database, nothing is scheduled for the cache.
    assert_eq!(executor.select_count("user_logins"), 2);
    tx.commit().await.unwrap();
    assert!(tx.query_logs().is_empty());
}

#[tokio::test]
async fn test_write_without_connection_is_rejected() {
    let (cache, _executor) = setup().await;
    let mut tx = cache.begin(None);
    let mut row = Record::new(login_type());
    row.set("user_id", 5u64).unwrap();
    let err = tx.create_by_table(row).await.unwrap_err();
    assert!(matches!(err, CacheError::NoConnection));
}

#[tokio::test]
async fn test_operations_after_commit_are_rejected() {
    let (cache, executor) = setup().await;
    let mut tx = cache.begin(Some(conn(&executor)));
    tx.commit().await.unwrap();
    assert!(tx.is_committed());
    let err = tx
        .find_by_query_builder(&QueryBuilder::new("user_logins").eq("id", 1u64))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::AlreadyCommitted));
    // A deferred rollback after commit is a no-op.
    tx.rollback_unless_committed().await.unwrap();
}
