//! Integration tests for the concrete failover/sync/fencing scenarios.
//!
//! Tests that only touch the fallback SQLite side run unconditionally.
//! Anything that needs a live primary or a live Redis is `#[ignore]`d and
//! reads its connection string from `TEST_DATABASE_URL` / `TEST_REDIS_URL`;
//! run with `cargo test -- --ignored` against real infrastructure.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, SqlitePool};
use tokio::sync::RwLock;

use standby_proxy::changelog::ChangeLogStore;
use standby_proxy::conflict::ConflictStrategy;
use standby_proxy::dualwrite::DualWriteManager;
use standby_proxy::fencing::{FencingManager, FencingMode};
use standby_proxy::pending::PendingWriteStore;
use standby_proxy::schema::{ColumnDef, ColumnKind, SchemaRegistry, TableSchema};
use standby_proxy::state::DatabaseState;
use standby_proxy::sync_manager::SyncManager;
use standby_proxy::types::{ChangeOperation, Operator, Row, Where, WriteOperation};
use standby_proxy::ProxyConfig;

fn users_schema() -> TableSchema {
    TableSchema {
        table_name: "users".into(),
        columns: vec![
            ColumnDef { name: "id".into(), kind: ColumnKind::String, nullable: false, has_default: false, default_source: None, is_updated_at: false },
            ColumnDef { name: "name".into(), kind: ColumnKind::String, nullable: true, has_default: false, default_source: None, is_updated_at: false },
        ],
        primary_key: vec!["id".into()],
        unique_keys: vec![],
    }
}

fn posts_schema() -> TableSchema {
    TableSchema {
        table_name: "posts".into(),
        columns: vec![
            ColumnDef { name: "id".into(), kind: ColumnKind::String, nullable: false, has_default: false, default_source: None, is_updated_at: false },
            ColumnDef { name: "title".into(), kind: ColumnKind::String, nullable: true, has_default: false, default_source: None, is_updated_at: false },
            ColumnDef { name: "updatedAt".into(), kind: ColumnKind::String, nullable: true, has_default: false, default_source: None, is_updated_at: false },
        ],
        primary_key: vec!["id".into()],
        unique_keys: vec![],
    }
}

fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
    let mut r = Row::new();
    for (k, v) in pairs {
        r.insert((*k).to_string(), v.clone());
    }
    r
}

fn test_config() -> Arc<ProxyConfig> {
    Arc::new(ProxyConfig {
        primary_url: String::new(),
        fallback_path: String::new(),
        redis_url: None,
        fencing_key: "test:lock".into(),
        fencing_lease_ms: 1_000,
        fencing_strict: true,
        health_check_interval: Duration::from_millis(50),
        health_check_timeout: Duration::from_millis(500),
        failure_threshold: 3,
        recovery_threshold: 5,
        min_recovery_interval: Duration::from_millis(0),
        sliding_window_size: 10,
        syncing_queue_capacity: 1_000,
        pending_write_retry_interval: Duration::from_millis(50),
        critical_tables: Default::default(),
        max_pg_connections: 5,
        full_sync_page_size: 500,
        conflict_strategy: ConflictStrategy::RemoteWins,
    })
}

async fn unreachable_primary() -> PgPool {
    PgPoolOptions::new().connect_lazy("postgres://localhost:1/nonexistent").unwrap()
}

/// S1. Simple failover: a DEGRADED-mode write must land in the fallback
/// only, with exactly one unsynced change-log entry recording it.
#[tokio::test]
async fn s1_degraded_write_lands_in_fallback_with_one_unsynced_changelog_entry() {
    let fallback = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::query("CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT)").execute(&fallback).await.unwrap();

    let changelog = Arc::new(ChangeLogStore::new(fallback.clone()));
    changelog.init_schema().await.unwrap();
    let pending_store = Arc::new(PendingWriteStore::new(fallback.clone()));
    pending_store.init_schema().await.unwrap();
    let registry = Arc::new(RwLock::new(SchemaRegistry::from_tables(vec![users_schema()])));
    let fencing = Arc::new(FencingManager::new("s1".into(), Duration::from_secs(1), FencingMode::Strict, None).await);
    let config = test_config();

    let manager =
        Arc::new(DualWriteManager::new(unreachable_primary().await, fallback.clone(), registry, changelog.clone(), pending_store, fencing, config));

    let op = WriteOperation::Insert {
        table: "users".into(),
        data: row(&[("id", json!("u1")), ("name", json!("Alice"))]),
        operation_id: "op-s1".into(),
        timestamp_ms: None,
        critical: false,
    };
    let result = manager.write(DatabaseState::Degraded, op).await.unwrap();
    assert_eq!(result.written_to, "fallback");

    let stored: (String,) = sqlx::query_as("SELECT name FROM users WHERE id = ?").bind("u1").fetch_one(&fallback).await.unwrap();
    assert_eq!(stored.0, "Alice");

    assert_eq!(changelog.count_unapplied().await.unwrap(), 1);
    let entries = changelog.unapplied(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, ChangeOperation::Insert);
    assert!(!entries[0].applied);
}

/// S2. Sync after recovery: replaying the change log into a real primary
/// must leave the primary holding the degraded-mode write and mark the
/// change-log entry synced. Requires `TEST_DATABASE_URL`.
#[tokio::test]
#[ignore]
async fn s2_sync_after_recovery_applies_changelog_and_marks_synced() {
    let db_url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for this test");
    let primary = PgPoolOptions::new().connect(&db_url).await.unwrap();
    sqlx::query("DROP TABLE IF EXISTS s2_users").execute(&primary).await.unwrap();
    sqlx::query("CREATE TABLE s2_users (id TEXT PRIMARY KEY, name TEXT)").execute(&primary).await.unwrap();

    let fallback = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let changelog = Arc::new(ChangeLogStore::new(fallback.clone()));
    changelog.init_schema().await.unwrap();

    let mut schema = users_schema();
    schema.table_name = "s2_users".into();
    let registry = Arc::new(RwLock::new(SchemaRegistry::from_tables(vec![schema.clone()])));

    let data = row(&[("id", json!("u1")), ("name", json!("Alice"))]);
    let row_id = json!({"id": "u1"}).to_string();
    changelog.append("s2_users", Some(&row_id), ChangeOperation::Insert, Some(&data), "op-s2").await.unwrap();

    let sync_manager = SyncManager::new(primary.clone(), fallback, registry, changelog.clone(), ConflictStrategy::RemoteWins, 500);
    let result = sync_manager.sync().await;
    assert!(result.success, "sync errors: {:?}", result.errors);
    assert_eq!(result.applied, 1);

    let stored: (String,) = sqlx::query_as("SELECT name FROM s2_users WHERE id = $1").bind("u1").fetch_one(&primary).await.unwrap();
    assert_eq!(stored.0, "Alice");
    assert_eq!(changelog.count_unapplied().await.unwrap(), 0);

    sqlx::query("DROP TABLE s2_users").execute(&primary).await.unwrap();
}

/// Shared S3/S4 fixture: a primary row independently updated to `title =
/// "C"`, and a change-log entry capturing an earlier fallback write of
/// `title = "B"`, reproducing "During DEGRADED, fallback updates post 42
/// ... primary separately holds a different value".
async fn seed_conflict(primary: &PgPool, fallback: &SqlitePool, changelog: &ChangeLogStore) -> i64 {
    sqlx::query("DROP TABLE IF EXISTS s34_posts").execute(primary).await.unwrap();
    sqlx::query("CREATE TABLE s34_posts (id TEXT PRIMARY KEY, title TEXT, \"updatedAt\" TEXT)").execute(primary).await.unwrap();
    sqlx::query("INSERT INTO s34_posts (id, title, \"updatedAt\") VALUES ('post-42', 'C', '2024-01-02')").execute(primary).await.unwrap();

    let local = row(&[("id", json!("post-42")), ("title", json!("B")), ("updatedAt", json!("2024-01-01"))]);
    let row_id = json!({"id": "post-42"}).to_string();
    changelog.append("s34_posts", Some(&row_id), ChangeOperation::Update, Some(&local), "op-conflict").await.unwrap()
}

/// S3. Conflict, local-wins: after sync, the primary must hold the
/// fallback's value, the change-log entry must be marked synced, and an
/// audit row recording `resolution=local-wins` must exist in
/// `_sync_conflicts`. Requires `TEST_DATABASE_URL`.
#[tokio::test]
#[ignore]
async fn s3_conflict_local_wins_applies_fallback_value_and_marks_synced() {
    let db_url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for this test");
    let primary = PgPoolOptions::new().connect(&db_url).await.unwrap();
    let fallback = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let changelog = Arc::new(ChangeLogStore::new(fallback.clone()));
    changelog.init_schema().await.unwrap();
    seed_conflict(&primary, &fallback, &changelog).await;

    let mut schema = posts_schema();
    schema.table_name = "s34_posts".into();
    let registry = Arc::new(RwLock::new(SchemaRegistry::from_tables(vec![schema])));

    let sync_manager = SyncManager::new(primary.clone(), fallback.clone(), registry, changelog.clone(), ConflictStrategy::LocalWins, 500);
    let result = sync_manager.sync().await;
    assert!(result.success, "sync errors: {:?}", result.errors);

    let stored: (String,) = sqlx::query_as("SELECT title FROM s34_posts WHERE id = $1").bind("post-42").fetch_one(&primary).await.unwrap();
    assert_eq!(stored.0, "B");
    assert_eq!(changelog.count_unapplied().await.unwrap(), 0);

    let conflict_row: (String, Option<i64>) =
        sqlx::query_as("SELECT resolution, resolved_at FROM _sync_conflicts WHERE table_name = 's34_posts'").fetch_one(&fallback).await.unwrap();
    assert_eq!(conflict_row.0, "local-wins");
    assert!(conflict_row.1.is_some());

    sqlx::query("DROP TABLE s34_posts").execute(&primary).await.unwrap();
}

/// S4. Conflict, manual: sync must leave the primary untouched, the
/// change-log entry unsynced, and a pending row in `_sync_conflicts`.
/// Requires `TEST_DATABASE_URL`.
#[tokio::test]
#[ignore]
async fn s4_conflict_manual_strategy_holds_entry_unsynced_with_pending_conflict() {
    let db_url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for this test");
    let primary = PgPoolOptions::new().connect(&db_url).await.unwrap();
    let fallback = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let changelog = Arc::new(ChangeLogStore::new(fallback.clone()));
    changelog.init_schema().await.unwrap();
    seed_conflict(&primary, &fallback, &changelog).await;

    let mut schema = posts_schema();
    schema.table_name = "s34_posts".into();
    let registry = Arc::new(RwLock::new(SchemaRegistry::from_tables(vec![schema])));

    let sync_manager = SyncManager::new(primary.clone(), fallback, registry, changelog.clone(), ConflictStrategy::Manual, 500);
    let result = sync_manager.sync().await;
    assert!(!result.success);

    let stored: (String,) = sqlx::query_as("SELECT title FROM s34_posts WHERE id = $1").bind("post-42").fetch_one(&primary).await.unwrap();
    assert_eq!(stored.0, "C");
    assert_eq!(changelog.count_unapplied().await.unwrap(), 1);

    let conflicts = changelog.unresolved_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].resolved_at.is_none());
    assert_eq!(conflicts[0].table_name, "s34_posts");

    sqlx::query("DROP TABLE s34_posts").execute(&primary).await.unwrap();
}

/// S5. Fencing split-brain prevention: once instance A's lease lapses
/// without renewal and instance B acquires the lock, A's own renewal must
/// fail and A must stop being allowed to write, while B's token is
/// strictly greater than A's and B is allowed to write. Requires
/// `TEST_REDIS_URL`.
#[tokio::test]
#[ignore]
async fn s5_fencing_split_brain_prevention_deposes_the_stale_holder() {
    let redis_url = std::env::var("TEST_REDIS_URL").expect("TEST_REDIS_URL must be set for this test");
    let lease = Duration::from_millis(200);
    let key = format!("s5-lock-{}", uuid::Uuid::new_v4());

    let instance_a = FencingManager::new(key.clone(), lease, FencingMode::Strict, Some(redis_url.clone())).await;
    let instance_b = FencingManager::new(key.clone(), lease, FencingMode::Strict, Some(redis_url)).await;

    assert!(instance_a.acquire_lock().await.unwrap());
    let token_a = instance_a.fencing_token();
    assert!(instance_a.allows_write());

    // A goes silent (simulated network partition): no renewal call. Once
    // the lease lapses, B can acquire the now-expired key.
    tokio::time::sleep(lease + Duration::from_millis(100)).await;
    assert!(instance_b.acquire_lock().await.unwrap());
    let token_b = instance_b.fencing_token();
    assert!(token_b > token_a);

    // A's renewal must now fail: the key belongs to B's owner token.
    let a_renewed = instance_a.renew_lock().await.unwrap();
    assert!(!a_renewed);
    assert!(!instance_a.allows_write());
    assert!(instance_b.allows_write());

    instance_b.release_lock().await.unwrap();
}

/// S6. SYNCING queue: a write that arrives mid-SYNCING must not touch the
/// primary until the state returns to NORMAL, at which point it is
/// executed as a NORMAL-mode write (mirrored to both stores, no
/// change-log entry). Requires `TEST_DATABASE_URL`.
#[tokio::test]
#[ignore]
async fn s6_syncing_queue_defers_write_until_normal_with_no_changelog_entry() {
    let db_url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for this test");
    let primary = PgPoolOptions::new().connect(&db_url).await.unwrap();
    sqlx::query("DROP TABLE IF EXISTS s6_users").execute(&primary).await.unwrap();
    sqlx::query("CREATE TABLE s6_users (id TEXT PRIMARY KEY, name TEXT)").execute(&primary).await.unwrap();

    let fallback = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::query("CREATE TABLE s6_users (id TEXT PRIMARY KEY, name TEXT)").execute(&fallback).await.unwrap();

    let changelog = Arc::new(ChangeLogStore::new(fallback.clone()));
    changelog.init_schema().await.unwrap();
    let pending_store = Arc::new(PendingWriteStore::new(fallback.clone()));
    pending_store.init_schema().await.unwrap();

    let mut schema = users_schema();
    schema.table_name = "s6_users".into();
    let registry = Arc::new(RwLock::new(SchemaRegistry::from_tables(vec![schema.clone()])));
    let fencing = Arc::new(FencingManager::new("s6".into(), Duration::from_secs(1), FencingMode::Strict, None).await);
    let config = test_config();

    let manager = Arc::new(DualWriteManager::new(primary.clone(), fallback.clone(), registry, changelog.clone(), pending_store, fencing, config));

    manager.on_state_changed(DatabaseState::Syncing).await;

    let manager2 = Arc::clone(&manager);
    let op = WriteOperation::Insert {
        table: "s6_users".into(),
        data: row(&[("id", json!("x")), ("name", json!("queued"))]),
        operation_id: "op-s6".into(),
        timestamp_ms: None,
        critical: false,
    };
    let handle = tokio::spawn(async move { manager2.write(DatabaseState::Syncing, op).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let count_before: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM s6_users WHERE id = 'x'").fetch_one(&primary).await.unwrap();
    assert_eq!(count_before.0, 0, "queued write must not touch the primary before the state returns to NORMAL");

    manager.on_state_changed(DatabaseState::Normal).await;
    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.written_to, "both");

    let primary_row: (String,) = sqlx::query_as("SELECT name FROM s6_users WHERE id = $1").bind("x").fetch_one(&primary).await.unwrap();
    assert_eq!(primary_row.0, "queued");
    let fallback_row: (String,) = sqlx::query_as("SELECT name FROM s6_users WHERE id = ?").bind("x").fetch_one(&fallback).await.unwrap();
    assert_eq!(fallback_row.0, "queued");
    assert_eq!(changelog.count_unapplied().await.unwrap(), 0);

    sqlx::query("DROP TABLE s6_users").execute(&primary).await.unwrap();
}

/// Round-trip law: replaying an already-synced log is a no-op, since the
/// entry has already been marked applied and `unapplied()` won't surface
/// it again for a second `sync()` call.
#[tokio::test]
async fn resync_on_an_already_synced_log_is_a_no_op() {
    let fallback = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let changelog = Arc::new(ChangeLogStore::new(fallback.clone()));
    changelog.init_schema().await.unwrap();
    let registry = Arc::new(RwLock::new(SchemaRegistry::from_tables(vec![users_schema()])));
    let primary = unreachable_primary().await;

    let data = row(&[("id", json!("u1")), ("name", json!("Alice"))]);
    let row_id = json!({"id": "u1"}).to_string();
    let id = changelog.append("users", Some(&row_id), ChangeOperation::Insert, Some(&data), "op-once").await.unwrap();
    changelog.mark_applied(&[id]).await.unwrap();

    let sync_manager = SyncManager::new(primary, fallback, registry, changelog.clone(), ConflictStrategy::RemoteWins, 500);
    let result = sync_manager.sync().await;
    assert!(result.success);
    assert_eq!(result.applied, 0);
    assert_eq!(changelog.count_unapplied().await.unwrap(), 0);
}

/// Round-trip law: a row-identity `where` built from a primary-key
/// projection is stable across a JSON round-trip, matching how the change
/// log reconstructs `row_where` from a stored `row_id` string.
#[tokio::test]
async fn row_where_reconstructed_from_stored_row_id_matches_original_projection() {
    let mut pk = Row::new();
    pk.insert("id".into(), json!("u1"));
    let where_ = Where::from_equals(&pk);

    let stored = serde_json::to_string(&json!({"id": "u1"})).unwrap();
    let reconstructed: serde_json::Value = serde_json::from_str(&stored).unwrap();
    let reconstructed_where = Where {
        fields: reconstructed
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Operator::Equals(v.clone())))
            .collect(),
        ..Default::default()
    };
    assert_eq!(where_, reconstructed_where);
}
