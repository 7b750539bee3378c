// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or data corruption: broken rows freeze only their table,
//! provider corruption halts only its queue, and copy and takeover failures
//! leave everything retryable.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use cascade_replication::queue::{BoxFuture, ReassignOutcome};
use cascade_replication::{
    row_of, Batch, ConsumerInfo, CopySource, Event, Handoff, LocalQueue, LocalStore, NodeInfo, QueueRole,
    QueueService, ReplicationEngine, ReplicationError, StoreSource, TableOptions, TableSnapshot,
    TableSyncState, TakeoverOutcome,
};
use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ORDERS_DDL: &str = "CREATE TABLE orders (id INTEGER PRIMARY KEY, tenant INTEGER, amount INTEGER)";

fn order(id: i64, tenant: Option<i64>, amount: i64) -> Event {
    let mut row = row_of([("id", json!(id)), ("amount", json!(amount))]);
    if let Some(tenant) = tenant {
        row.insert("tenant".to_string(), json!(tenant));
    }
    Event::insert("orders", row)
}

/// Snapshot source that is "not ready" for its first `not_ready` calls.
struct WarmingSource {
    inner: Arc<dyn CopySource>,
    not_ready: usize,
    calls: AtomicUsize,
}

impl CopySource for WarmingSource {
    fn export<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Option<TableSnapshot>> {
        Box::pin(async move {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.not_ready {
                return Ok(None);
            }
            self.inner.export(table).await
        })
    }
}

/// Queue service whose first `failures` fetches fail like a dropped link.
struct FlakyQueue {
    inner: LocalQueue,
    failures: usize,
    fetches: AtomicUsize,
}

impl QueueService for FlakyQueue {
    fn name(&self) -> &str {
        "flaky"
    }

    fn next_batch<'a>(&'a self, queue: &'a str, after_tick: i64) -> BoxFuture<'a, Option<Batch>> {
        if self.fetches.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Box::pin(async move {
                Err(ReplicationError::Queue {
                    queue: queue.to_string(),
                    message: "connection reset by peer".to_string(),
                })
            });
        }
        self.inner.next_batch(queue, after_tick)
    }

    fn ack<'a>(&'a self, queue: &'a str, consumer: &'a str, tick_id: i64) -> BoxFuture<'a, ()> {
        self.inner.ack(queue, consumer, tick_id)
    }

    fn register_consumer<'a>(
        &'a self,
        queue: &'a str,
        consumer: &'a str,
        group: &'a str,
        start_tick: Option<i64>,
    ) -> BoxFuture<'a, ConsumerInfo> {
        self.inner.register_consumer(queue, consumer, group, start_tick)
    }

    fn unregister_consumer<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, bool> {
        self.inner.unregister_consumer(queue, consumer)
    }

    fn consumer_info<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, Option<ConsumerInfo>> {
        self.inner.consumer_info(queue, consumer)
    }

    fn consumers<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Vec<ConsumerInfo>> {
        self.inner.consumers(queue)
    }

    fn head_tick<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Option<i64>> {
        self.inner.head_tick(queue)
    }

    fn request_pause<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, ()> {
        self.inner.request_pause(queue, consumer)
    }

    fn resume<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, ()> {
        self.inner.resume(queue, consumer)
    }

    fn confirm_pause<'a>(&'a self, queue: &'a str, consumer: &'a str, handoff: &'a Handoff) -> BoxFuture<'a, ()> {
        self.inner.confirm_pause(queue, consumer, handoff)
    }

    fn reassign_consumer<'a>(&'a self, queue: &'a str, from: &'a str, to: &'a str) -> BoxFuture<'a, ReassignOutcome> {
        self.inner.reassign_consumer(queue, from, to)
    }

    fn reassign_dead_consumer<'a>(
        &'a self,
        queue: &'a str,
        from: &'a str,
        to: &'a str,
        silent_before: i64,
    ) -> BoxFuture<'a, ReassignOutcome> {
        self.inner.reassign_dead_consumer(queue, from, to, silent_before)
    }
}

// =============================================================================
// Table-scoped failures
// =============================================================================

/// Test: A row the handler rejects freezes its table; others keep replicating
#[tokio::test]
async fn broken_row_freezes_only_its_table() {
    init_tracing();
    let root = store_with(&[USERS_DDL, ORDERS_DDL]).await;
    capture_tick(&root, QUEUE, &[user(1, "a"), order(1, Some(2), 10)]).await;

    let store = store_with(&[USERS_DDL, ORDERS_DDL]).await;
    let mut engine = leaf("leaf-1", Arc::clone(&store), &root);
    engine
        .add_table(QUEUE, "users", "passthrough", TableOptions::default())
        .await
        .unwrap();
    engine
        .add_table(QUEUE, "orders", "shard(key=tenant, nr=0, count=2, hash=int)", TableOptions::default())
        .await
        .unwrap();
    engine.start().await.unwrap();
    engine.wait_sync(SYNC_TIMEOUT).await.unwrap();
    assert_eq!(store.row_count("orders").await.unwrap(), 1);

    // No shard key on the row.
    capture_tick(&root, QUEUE, &[order(2, None, 20), user(2, "b")]).await;
    capture_tick(&root, QUEUE, &[user(3, "c")]).await;

    let err = engine.wait_sync(SYNC_TIMEOUT).await.unwrap_err();
    match err {
        ReplicationError::TableFailed { table, message } => {
            assert_eq!(table, "orders");
            assert!(message.contains("tenant"), "message: {}", message);
        }
        other => panic!("expected TableFailed, got {:?}", other),
    }

    let caught_up = eventually(SYNC_TIMEOUT, || async { users(&store).await.len() == 3 }).await;
    assert!(caught_up, "users stopped replicating");
    let status = engine.status().await.unwrap();
    assert!(status.queue(QUEUE).unwrap().halted_error.is_none());
    assert_eq!(status.failed_tables().len(), 1);
    let orders = status.table(QUEUE, "orders").unwrap();
    assert!(orders.failed);
    assert!(orders.last_error.is_some());

    // Operator fixes the row upstream, then resyncs the table.
    capture_tick(&root, QUEUE, &[Event::update("orders", row_of([("id", json!(2)), ("tenant", json!(4)), ("amount", json!(20))]))]).await;
    let state = engine.resync_table(QUEUE, "orders").await.unwrap();
    assert!(!state.failed);

    let status = engine.wait_sync(SYNC_TIMEOUT).await.expect("recovered");
    assert!(status.failed_tables().is_empty());
    let ids: Vec<i64> = store
        .fetch_rows("orders")
        .await
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    engine.shutdown().await;
}

/// Test: A failing EXECUTE halts the queue without advancing it
#[tokio::test]
async fn failing_execute_halts_queue() {
    init_tracing();
    let root = store_with(&[USERS_DDL]).await;
    let store = store_with(&[USERS_DDL]).await;
    let mut engine = leaf("leaf-1", Arc::clone(&store), &root);
    engine
        .add_table(QUEUE, "users", "passthrough", TableOptions::default())
        .await
        .unwrap();
    engine.start().await.unwrap();
    engine.wait_sync(SYNC_TIMEOUT).await.unwrap();
    let position = store.position(QUEUE).await.unwrap();

    // Valid on the root, but the leaf lacks the column being indexed.
    root.execute_sql("ALTER TABLE users ADD COLUMN region TEXT").await.unwrap();
    capture_tick(
        &root,
        QUEUE,
        &[Event::execute("0004_region_idx.sql", "CREATE INDEX users_region ON users (region)"), user(1, "a")],
    )
    .await;

    let err = engine.wait_sync(SYNC_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ReplicationError::InvalidState { .. }), "got {:?}", err);

    let status = engine.status().await.unwrap();
    let queue = status.queue(QUEUE).unwrap();
    assert_eq!(queue.role, QueueRole::Halted);
    assert!(queue.halted_error.as_deref().unwrap().contains("0004_region_idx.sql"));
    // The whole batch rolled back.
    assert_eq!(store.position(QUEUE).await.unwrap(), position);
    assert!(users(&store).await.is_empty());
    engine.shutdown().await;
}

// =============================================================================
// Queue-scoped failures
// =============================================================================

/// Test: A provider that lost the tick we stand on halts playback
#[tokio::test]
async fn lost_provider_tick_halts_queue() {
    init_tracing();
    let root = store_with(&[USERS_DDL]).await;
    capture_tick(&root, QUEUE, &[user(1, "a")]).await;

    let store = store_with(&[USERS_DDL]).await;
    let mut engine = leaf("leaf-1", Arc::clone(&store), &root);
    engine
        .add_table(QUEUE, "users", "passthrough", TableOptions::default())
        .await
        .unwrap();
    engine.start().await.unwrap();
    capture_tick(&root, QUEUE, &[user(2, "b")]).await;
    engine.wait_sync(SYNC_TIMEOUT).await.unwrap();
    engine.shutdown().await;

    let position = store.position(QUEUE).await.unwrap().unwrap();
    capture_tick(&root, QUEUE, &[user(3, "c")]).await;
    root.execute_sql(&format!(
        "DELETE FROM queue_tick WHERE queue_name = '{}' AND tick_id = {}",
        QUEUE, position
    ))
    .await
    .unwrap();

    let mut engine = leaf("leaf-1", Arc::clone(&store), &root);
    engine.start().await.unwrap();
    let halted = eventually(SYNC_TIMEOUT, || async {
        engine.status().await.unwrap().queue(QUEUE).unwrap().role == QueueRole::Halted
    })
    .await;
    assert!(halted);

    let status = engine.status().await.unwrap();
    let error = status.queue(QUEUE).unwrap().halted_error.clone().unwrap();
    assert!(error.contains("Position mismatch"), "error: {}", error);
    assert_eq!(store.position(QUEUE).await.unwrap(), Some(position));
    assert_eq!(users(&store).await.len(), 2);

    // Halting is sticky; the operator has to intervene.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        engine.status().await.unwrap().queue(QUEUE).unwrap().role,
        QueueRole::Halted
    );
    engine.shutdown().await;
}

/// Test: Transient fetch failures are retried and replication resumes
#[tokio::test]
async fn transient_fetch_failures_are_retried() {
    init_tracing();
    let root = store_with(&[USERS_DDL]).await;
    capture_tick(&root, QUEUE, &[user(1, "a")]).await;

    let store = store_with(&[USERS_DDL]).await;
    let service = Arc::new(FlakyQueue {
        inner: LocalQueue::new(Arc::clone(&root)),
        failures: 2,
        fetches: AtomicUsize::new(0),
    });
    let mut engine = ReplicationEngine::new(config(NodeInfo::leaf("leaf-1", QUEUE, "root")), Arc::clone(&store))
        .with_provider(QUEUE, Arc::clone(&service) as Arc<dyn QueueService>, Arc::new(StoreSource::root(Arc::clone(&root), QUEUE)));
    engine
        .add_table(QUEUE, "users", "passthrough", TableOptions::default())
        .await
        .unwrap();
    engine.start().await.unwrap();
    capture_tick(&root, QUEUE, &[user(2, "b")]).await;

    let status = engine.wait_sync(SYNC_TIMEOUT).await.expect("recovered from fetch errors");
    assert!(service.fetches.load(Ordering::SeqCst) > 2);
    assert_eq!(status.queue(QUEUE).unwrap().backend, "flaky");
    assert_eq!(users(&store).await.len(), 2);
    engine.shutdown().await;
}

// =============================================================================
// Copy failures
// =============================================================================

/// Test: A copy that keeps failing freezes the table after max attempts
#[tokio::test]
async fn copy_failures_freeze_after_max_attempts() {
    init_tracing();
    let root = store_with(&[USERS_DDL]).await;
    capture_tick(&root, QUEUE, &[user(1, "a")]).await;

    let source = Arc::new(FlakySource::new(
        Arc::new(StoreSource::root(Arc::clone(&root), QUEUE)),
        usize::MAX,
    ));
    let mut cfg = config(NodeInfo::leaf("leaf-1", QUEUE, "root"));
    cfg.copy.max_copy_attempts = 3;

    let store = store_with(&[USERS_DDL]).await;
    let mut engine = ReplicationEngine::new(cfg, Arc::clone(&store)).with_provider(
        QUEUE,
        Arc::new(LocalQueue::new(Arc::clone(&root))),
        Arc::clone(&source) as Arc<dyn CopySource>,
    );
    engine
        .add_table(QUEUE, "users", "passthrough", TableOptions::default())
        .await
        .unwrap();
    engine.start().await.unwrap();

    let err = engine.wait_sync(SYNC_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ReplicationError::TableFailed { .. }), "got {:?}", err);

    let state = store.table_state(QUEUE, "users").await.unwrap().unwrap();
    assert!(state.failed);
    assert_eq!(state.copy_attempts, 3);
    assert_eq!(state.state, TableSyncState::New);
    assert!(state.last_error.unwrap().contains("refused"));

    // Frozen tables are not retried.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(source.calls(), 3);
    engine.shutdown().await;
}

/// Test: A copy that fails a few times recovers within its attempts
#[tokio::test]
async fn copy_recovers_after_transient_failures() {
    init_tracing();
    let root = store_with(&[USERS_DDL]).await;
    capture_tick(&root, QUEUE, &[user(1, "a"), user(2, "b")]).await;

    let source = Arc::new(FlakySource::new(
        Arc::new(StoreSource::root(Arc::clone(&root), QUEUE)),
        2,
    ));
    let store = store_with(&[USERS_DDL]).await;
    let mut engine = ReplicationEngine::new(
        config(NodeInfo::leaf("leaf-1", QUEUE, "root")),
        Arc::clone(&store),
    )
    .with_provider(
        QUEUE,
        Arc::new(LocalQueue::new(Arc::clone(&root))),
        Arc::clone(&source) as Arc<dyn CopySource>,
    );
    engine
        .add_table(QUEUE, "users", "passthrough", TableOptions::default())
        .await
        .unwrap();
    engine.start().await.unwrap();

    engine.wait_sync(SYNC_TIMEOUT).await.expect("copy recovered");
    assert_eq!(source.calls(), 3);
    let state = store.table_state(QUEUE, "users").await.unwrap().unwrap();
    assert_eq!(state.state, TableSyncState::Ok);
    assert_eq!(state.copy_attempts, 0);
    assert_eq!(users(&store).await.len(), 2);
    engine.shutdown().await;
}

/// Test: A source that is not ready yet does not use up copy attempts
#[tokio::test]
async fn not_ready_source_keeps_attempts() {
    init_tracing();
    let root = store_with(&[USERS_DDL]).await;
    capture_tick(&root, QUEUE, &[user(1, "a")]).await;

    let source = Arc::new(WarmingSource {
        inner: Arc::new(StoreSource::root(Arc::clone(&root), QUEUE)),
        not_ready: 3,
        calls: AtomicUsize::new(0),
    });
    let mut cfg = config(NodeInfo::leaf("leaf-1", QUEUE, "root"));
    cfg.copy.max_copy_attempts = 1;

    let store = store_with(&[USERS_DDL]).await;
    let mut engine = ReplicationEngine::new(cfg, Arc::clone(&store)).with_provider(
        QUEUE,
        Arc::new(LocalQueue::new(Arc::clone(&root))),
        Arc::clone(&source) as Arc<dyn CopySource>,
    );
    engine
        .add_table(QUEUE, "users", "passthrough", TableOptions::default())
        .await
        .unwrap();
    engine.start().await.unwrap();

    engine.wait_sync(SYNC_TIMEOUT).await.expect("copied once source was ready");
    assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    assert_eq!(users(&store).await, vec![(1, "a".into())]);
    engine.shutdown().await;
}

/// Test: A replica provider serves no snapshot until its own copy is done
#[tokio::test]
async fn replica_source_waits_for_provider_sync() {
    init_tracing();
    let branch = store_with(&[USERS_DDL]).await;
    branch
        .register_table(QUEUE, "users", "passthrough", &TableOptions::default())
        .await
        .unwrap();
    let source = StoreSource::replica(Arc::clone(&branch), QUEUE);
    assert!(source.export("users").await.unwrap().is_none());

    let mut state = branch.table_state(QUEUE, "users").await.unwrap().unwrap();
    state.state = TableSyncState::Ok;
    branch.save_table_state(&state).await.unwrap();
    branch.set_position(QUEUE, 7).await.unwrap();

    let snapshot = source.export("users").await.unwrap().unwrap();
    assert_eq!(snapshot.tick_id, 7);
    assert!(snapshot.is_empty());

    let err = source.export("missing").await.unwrap_err();
    assert!(matches!(err, ReplicationError::UnknownTable { .. }));
}

// =============================================================================
// Takeover failures
// =============================================================================

/// Test: Takeover from an owner that never confirms times out and resumes it
#[tokio::test]
async fn takeover_from_dead_owner_times_out() {
    init_tracing();
    let root = store_with(&[USERS_DDL]).await;
    capture_tick(&root, QUEUE, &[user(1, "a")]).await;

    let store_a = store_with(&[USERS_DDL]).await;
    let mut a = grouped_leaf("leaf-a", "leaf", Arc::clone(&store_a), &root);
    a.start().await.unwrap();
    // Registered and active, but no longer running.
    a.shutdown().await;

    let mut cfg = grouped_config("leaf-b", "leaf");
    cfg.takeover.pause_timeout = "200ms".to_string();
    let store_b: Arc<LocalStore> = store_with(&[USERS_DDL]).await;
    let mut b = from_root(cfg, Arc::clone(&store_b), &root, QUEUE);
    b.start().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = b.takeover(QUEUE, "leaf-a").await.unwrap_err();
    assert!(matches!(err, ReplicationError::Timeout(_)), "got {:?}", err);
    assert!(started.elapsed() >= Duration::from_millis(200));

    let owner = root.consumer_info(QUEUE, "leaf-a").await.unwrap().unwrap();
    assert!(owner.active);
    assert!(!owner.pause_requested);
    assert!(!root.consumer_info(QUEUE, "leaf-b").await.unwrap().unwrap().active);
    assert_eq!(
        b.status().await.unwrap().queue(QUEUE).unwrap().role,
        QueueRole::Standby
    );
    b.shutdown().await;
}

/// Test: An owner that stopped acking is replaced once it has been silent long enough
#[tokio::test]
async fn dead_owner_is_replaced_after_silence() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = store_with(&[USERS_DDL]).await;
    capture_tick(&root, QUEUE, &[user(1, "a")]).await;

    // Two engines over one target database, as in a standby pair.
    let store_a = file_store_with(&dir, "leaf.db", &[USERS_DDL]).await;
    let store_b = Arc::new(LocalStore::open_path(dir.path().join("leaf.db")).await.unwrap());

    let mut a = grouped_leaf("leaf-a", "leaf", Arc::clone(&store_a), &root);
    a.add_table(QUEUE, "users", "passthrough", TableOptions::default())
        .await
        .unwrap();
    a.start().await.unwrap();
    a.wait_sync(SYNC_TIMEOUT).await.unwrap();

    let mut cfg = grouped_config("leaf-b", "leaf");
    cfg.takeover.dead_after = "500ms".to_string();
    let mut b = from_root(cfg, Arc::clone(&store_b), &root, QUEUE);
    b.start().await.unwrap();

    // An idle owner still acks its position, so it is not dead.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let err = b.takeover_dead(QUEUE, "leaf-a").await.unwrap_err();
    assert!(matches!(err, ReplicationError::InvalidState { .. }), "got {:?}", err);
    assert!(root.consumer_info(QUEUE, "leaf-a").await.unwrap().unwrap().active);

    // Crash: still registered and active, but never acks again.
    a.shutdown().await;
    let head = root.head_tick(QUEUE).await.unwrap().unwrap();
    let err = b.takeover_dead(QUEUE, "leaf-a").await.unwrap_err();
    assert!(matches!(err, ReplicationError::InvalidState { .. }), "got {:?}", err);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let outcome = b.takeover_dead(QUEUE, "leaf-a").await.expect("dead takeover");
    assert_eq!(outcome, TakeoverOutcome::Reassigned { last_tick: head });
    let owner = root.consumer_info(QUEUE, "leaf-a").await.unwrap().unwrap();
    assert!(!owner.active);
    assert!(root.consumer_info(QUEUE, "leaf-b").await.unwrap().unwrap().active);

    // No handoff was published: B keeps the table states it already has.
    capture_tick(&root, QUEUE, &[user(2, "b")]).await;
    b.wait_sync(SYNC_TIMEOUT).await.unwrap();
    assert_eq!(users(&store_b).await, vec![(1, "a".into()), (2, "b".into())]);
    assert_eq!(
        store_b.table_state(QUEUE, "users").await.unwrap().unwrap().state,
        TableSyncState::Ok
    );

    assert_eq!(
        b.takeover_dead(QUEUE, "leaf-a").await.unwrap(),
        TakeoverOutcome::AlreadyOwner
    );
    b.shutdown().await;
}

/// Test: Operations on a stopped engine are refused, not half-applied
#[tokio::test]
async fn operations_after_shutdown_are_refused() {
    init_tracing();
    let root = store_with(&[USERS_DDL]).await;
    let store = store_with(&[USERS_DDL]).await;
    let mut engine = leaf("leaf-1", Arc::clone(&store), &root);
    engine.start().await.unwrap();
    engine.shutdown().await;

    assert!(matches!(
        engine.wait_sync(Duration::from_millis(50)).await,
        Err(ReplicationError::InvalidState { .. })
    ));
    assert!(matches!(
        engine.takeover(QUEUE, "leaf-2").await,
        Err(ReplicationError::InvalidState { .. })
    ));
    assert!(matches!(
        engine.start().await,
        Err(ReplicationError::InvalidState { .. })
    ));
}
