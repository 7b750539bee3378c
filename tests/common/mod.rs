//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Root and target store fixtures
//! - Engine builders for each node role
//! - Row and event helpers

#![allow(dead_code)]

pub mod containers;

pub use containers::*;

use cascade_replication::queue::BoxFuture;
use cascade_replication::{
    row_of, CopySource, EngineConfig, Event, LocalQueue, LocalStore, NodeInfo, ReplicationEngine,
    StoreSource, TableSnapshot,
};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const QUEUE: &str = "orders";
pub const USERS_DDL: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)";
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(20);

/// Install a test subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory store with the given tables created.
pub async fn store_with(ddl: &[&str]) -> Arc<LocalStore> {
    let store = LocalStore::in_memory().await.expect("open store");
    for sql in ddl {
        store.execute_sql(sql).await.expect("create table");
    }
    Arc::new(store)
}

/// File-backed store under `dir` with the given tables created.
pub async fn file_store_with(dir: &tempfile::TempDir, name: &str, ddl: &[&str]) -> Arc<LocalStore> {
    let store = LocalStore::open_path(dir.path().join(name))
        .await
        .expect("open store");
    for sql in ddl {
        store.execute_sql(sql).await.expect("create table");
    }
    Arc::new(store)
}

pub fn user(id: i64, name: &str) -> Event {
    Event::insert(
        "users",
        row_of([
            ("id", json!(id)),
            ("name", json!(name)),
            ("email", json!(format!("{}@example.com", name))),
        ]),
    )
}

pub fn rename(id: i64, name: &str) -> Event {
    Event::update(
        "users",
        row_of([
            ("id", json!(id)),
            ("name", json!(name)),
            ("email", json!(format!("{}@example.com", name))),
        ]),
    )
}

pub fn delete_user(id: i64) -> Event {
    Event::delete("users", row_of([("id", json!(id))]))
}

/// Capture `events` on a root and close them into a tick.
pub async fn capture_tick(root: &LocalStore, queue: &str, events: &[Event]) -> i64 {
    root.capture(queue, events).await.expect("capture");
    root.tick(queue).await.expect("tick")
}

/// `(id, name)` pairs of `users`, ordered by id.
pub async fn users(store: &LocalStore) -> Vec<(i64, String)> {
    let mut rows: Vec<(i64, String)> = store
        .fetch_rows("users")
        .await
        .expect("fetch rows")
        .into_iter()
        .map(|row| {
            (
                row["id"].as_i64().unwrap_or_default(),
                row["name"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    rows.sort();
    rows
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn config(node: NodeInfo) -> EngineConfig {
    let mut config = EngineConfig::for_testing(&node.node_name);
    config.node = node;
    config
}

/// Engine consuming `queue` from a root store.
pub fn from_root(config: EngineConfig, store: Arc<LocalStore>, root: &Arc<LocalStore>, queue: &str) -> ReplicationEngine {
    ReplicationEngine::new(config, store).with_provider(
        queue,
        Arc::new(LocalQueue::new(Arc::clone(root))),
        Arc::new(StoreSource::root(Arc::clone(root), queue)),
    )
}

/// Engine consuming `queue` from a branch store.
pub fn from_branch(
    config: EngineConfig,
    store: Arc<LocalStore>,
    branch: &Arc<LocalStore>,
    queue: &str,
) -> ReplicationEngine {
    ReplicationEngine::new(config, store).with_provider(
        queue,
        Arc::new(LocalQueue::new(Arc::clone(branch))),
        Arc::new(StoreSource::replica(Arc::clone(branch), queue)),
    )
}

/// Leaf engine on `store` consuming [`QUEUE`] from `root`.
pub fn leaf(name: &str, store: Arc<LocalStore>, root: &Arc<LocalStore>) -> ReplicationEngine {
    from_root(config(NodeInfo::leaf(name, QUEUE, "root")), store, root, QUEUE)
}

/// Leaf engine in consumer group `group`; group members are takeover candidates.
pub fn grouped_leaf(name: &str, group: &str, store: Arc<LocalStore>, root: &Arc<LocalStore>) -> ReplicationEngine {
    from_root(grouped_config(name, group), store, root, QUEUE)
}

pub fn grouped_config(name: &str, group: &str) -> EngineConfig {
    let mut node = NodeInfo::leaf(name, QUEUE, "root");
    node.worker_name = Some(group.to_string());
    config(node)
}

/// Copy source that fails its first `failures` exports, then defers to `inner`.
pub struct FlakySource {
    inner: Arc<dyn CopySource>,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakySource {
    pub fn new(inner: Arc<dyn CopySource>, failures: usize) -> Self {
        Self {
            inner,
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CopySource for FlakySource {
    fn export<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Option<TableSnapshot>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(cascade_replication::ReplicationError::Internal(format!(
                    "export {} refused (call {})",
                    table,
                    call + 1
                )));
            }
            self.inner.export(table).await
        })
    }
}

/// Copy source serving an empty snapshot at a fixed tick.
pub struct EmptySource {
    pub tick_id: i64,
}

impl CopySource for EmptySource {
    fn export<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Option<TableSnapshot>> {
        Box::pin(async move {
            Ok(Some(TableSnapshot {
                table: table.to_string(),
                columns: Vec::new(),
                pkey: Vec::new(),
                rows: Vec::new(),
                tick_id: self.tick_id,
            }))
        })
    }
}
