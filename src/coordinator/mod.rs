// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The main orchestrator that ties together:
//! - One playback loop per consumed queue ([`playback`])
//! - The bulk copy dispatcher and its two lanes ([`copy`])
//! - The takeover driver ([`takeover`])
//! - Table comparison against the provider ([`compare`])
//! - A ticker closing captured events into ticks on root nodes
//!
//! # Architecture
//!
//! All per-node state lives in one [`EngineContext`] shared by the tasks;
//! there are no globals. Tasks talk through the local store and explicit
//! signals: a `watch` shutdown channel, the queue service's pause flags,
//! and an `mpsc` channel of copy requests.
//!
//! ```text
//!                    ┌──────────────────── EngineContext ────────────────────┐
//!                    │ config · store · queue links · runtime · cycle locks  │
//!                    └──────┬───────────────────┬───────────────────┬────────┘
//!                           │                   │                   │
//!                  playback(queue) ×N     copy dispatcher        ticker (root)
//!                           │   claims NEW ───► │
//!                           │                   └─► workers ─► CopySource
//!                           └─► QueueService (fetch, ack, pause handshake)
//! ```

mod compare;
mod copy;
mod playback;
mod takeover;
mod types;

pub use compare::{TableChecksum, TableComparison};
pub use takeover::TakeoverOutcome;
pub use types::{EngineState, NodeStatus, QueueRole, QueueStatus, TableStatus};

use self::copy::{CopyLanes, CopyRequest};
use self::playback::ApplyPolicy;
use self::types::QueueRuntime;
use crate::circuit_breaker::QueueCircuit;
use crate::config::EngineConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::queue::QueueService;
use crate::resilience::EventThrottle;
use crate::source::CopySource;
use crate::store::LocalStore;
use crate::sync_state::{TableOptions, TableState, TableSyncState};
use crate::topology::{NodeInfo, NodeType};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Queue service and snapshot source serving one consumed queue.
#[derive(Clone)]
pub(crate) struct QueueLink {
    pub service: Arc<dyn QueueService>,
    pub source: Arc<dyn CopySource>,
}

/// Everything the engine's tasks share.
pub(crate) struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<LocalStore>,
    pub circuit: QueueCircuit,
    pub throttle: Option<EventThrottle>,
    links: DashMap<String, QueueLink>,
    runtime: DashMap<String, QueueRuntime>,
    /// Held by a playback cycle, and by takeover and table changes.
    locks: DashMap<String, Arc<Mutex<()>>>,
    copy_tx: mpsc::UnboundedSender<CopyRequest>,
    /// Earliest time a table may be claimed again after a failed copy.
    copy_backoff: DashMap<(String, String), Instant>,
}

impl EngineContext {
    pub fn link(&self, queue: &str) -> Option<QueueLink> {
        self.links.get(queue).map(|l| l.value().clone())
    }

    pub fn cycle_lock(&self, queue: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    pub fn runtime(&self, queue: &str) -> QueueRuntime {
        self.runtime
            .get(queue)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn update_runtime<F>(&self, queue: &str, f: F)
    where
        F: FnOnce(&mut QueueRuntime),
    {
        let mut entry = self.runtime.entry(queue.to_string()).or_default();
        f(entry.value_mut());
    }

    /// Halted is terminal for the lifetime of the engine.
    pub fn set_role(&self, queue: &str, role: QueueRole) {
        self.update_runtime(queue, |rt| {
            if rt.role != QueueRole::Halted {
                rt.role = role;
            }
        });
    }

    pub fn halt(&self, queue: &str, err: &ReplicationError) {
        self.update_runtime(queue, |rt| {
            rt.role = QueueRole::Halted;
            rt.halted_error = Some(err.to_string());
        });
    }

    pub fn apply_policy(&self) -> ApplyPolicy {
        let node = &self.config.node;
        ApplyPolicy {
            allows_execute: node.allows_execute(self.config.playback.execute_on_merge),
            reemit: node.reemits(),
        }
    }

    /// Hand a claimed table to the copy dispatcher.
    pub fn request_copy(&self, queue: &str, table: &str) {
        let request = CopyRequest {
            queue: queue.to_string(),
            table: table.to_string(),
        };
        if self.copy_tx.send(request).is_err() {
            // Left IN_COPY; re-dispatched on the next start.
            debug!(queue, table, "Copy dispatcher gone, request dropped");
        }
    }

    pub fn copy_due(&self, queue: &str, table: &str) -> bool {
        match self.copy_backoff.get(&(queue.to_string(), table.to_string())) {
            Some(until) => Instant::now() >= *until.value(),
            None => true,
        }
    }

    pub fn defer_copy(&self, queue: &str, table: &str, delay: Duration) {
        self.copy_backoff
            .insert((queue.to_string(), table.to_string()), Instant::now() + delay);
    }

    pub fn clear_copy_backoff(&self, queue: &str, table: &str) {
        self.copy_backoff.remove(&(queue.to_string(), table.to_string()));
    }
}

/// The replication engine of one node.
///
/// Consumes the queues named by the node's topology, applies their
/// batches to the local store, bulk-copies newly registered tables, and
/// answers the operational API (`status`, table management, `wait_sync`,
/// `takeover`).
///
/// The store is owned by the caller. Queue providers are attached with
/// [`with_provider`](Self::with_provider) before [`start`](Self::start).
pub struct ReplicationEngine {
    ctx: Arc<EngineContext>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Taken by the copy dispatcher on start.
    copy_rx: Option<mpsc::UnboundedReceiver<CopyRequest>>,

    /// Playback, copy and ticker task handles
    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl ReplicationEngine {
    /// Create an engine over an opened store.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to register consumers and begin replication.
    pub fn new(config: EngineConfig, store: Arc<LocalStore>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (copy_tx, copy_rx) = mpsc::unbounded_channel();

        let throttle = config.playback.rate_limit_enabled.then(|| {
            info!(
                rate_per_sec = config.playback.rate_limit_per_sec,
                burst = config.playback.rate_limit_burst,
                "Playback throttled"
            );
            EventThrottle::new(config.playback.rate_limit_per_sec, config.playback.rate_limit_burst)
        });

        let ctx = EngineContext {
            config,
            store,
            circuit: QueueCircuit::new(),
            throttle,
            links: DashMap::new(),
            runtime: DashMap::new(),
            locks: DashMap::new(),
            copy_tx,
            copy_backoff: DashMap::new(),
        };

        Self {
            ctx: Arc::new(ctx),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            copy_rx: Some(copy_rx),
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Open the store named by `config.store` and create an engine over it.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(LocalStore::open(&config.store).await?);
        Ok(Self::new(config, store))
    }

    /// Attach the queue service and snapshot source for `queue`.
    pub fn with_provider(
        self,
        queue: impl Into<String>,
        service: Arc<dyn QueueService>,
        source: Arc<dyn CopySource>,
    ) -> Self {
        self.ctx.links.insert(queue.into(), QueueLink { service, source });
        self
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.ctx.store
    }

    pub fn node(&self) -> &NodeInfo {
        &self.ctx.config.node
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start the replication engine.
    ///
    /// 1. Validates the topology and that every consumed queue has a provider
    /// 2. Registers this node's consumer on each queue
    /// 3. Re-dispatches tables left IN_COPY by a crash, on queues it owns
    /// 4. Spawns the playback loops, the copy dispatcher and (on a root) the ticker
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let node = self.ctx.config.node.clone();
        info!(
            node = %node.node_name,
            node_type = %node.node_type,
            queue = %node.queue_name,
            "Starting replication engine"
        );
        self.set_state(EngineState::Starting);

        let lanes = match self.prepare(&node).await {
            Ok(lanes) => lanes,
            Err(e) => {
                error!(error = %e, "Replication engine failed to start");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        let mut handles = self.handles.write().await;

        if let Some(copy_rx) = self.copy_rx.take() {
            let ctx = Arc::clone(&self.ctx);
            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                copy::run_dispatcher(ctx, lanes, copy_rx, shutdown_rx).await;
            }));
        }

        for queue in node.consumed_queues() {
            let ctx = Arc::clone(&self.ctx);
            let shutdown_rx = self.shutdown_rx.clone();
            info!(queue = %queue, "Spawned playback loop");
            handles.push(tokio::spawn(async move {
                playback::run_playback(ctx, queue, shutdown_rx).await;
            }));
        }

        if node.node_type == NodeType::Root {
            let store = Arc::clone(&self.ctx.store);
            let queue = node.queue_name.clone();
            let interval = self.ctx.config.playback.tick_interval_duration();
            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                run_ticker(store, queue, interval, shutdown_rx).await;
            }));
        }
        drop(handles);

        self.set_state(EngineState::Running);
        info!(queues = node.consumed_queues().len(), "Replication engine running");
        Ok(())
    }

    async fn prepare(&self, node: &NodeInfo) -> Result<CopyLanes> {
        node.validate()?;
        let lanes = CopyLanes::new(&self.ctx.config.copy)?;
        let consumer = node.consumer_name();
        let group = node.group_name();

        for queue in node.consumed_queues() {
            let link = self.ctx.link(&queue).ok_or_else(|| {
                ReplicationError::Topology(format!("no provider attached for queue {}", queue))
            })?;

            let position = self.ctx.store.position(&queue).await?;
            let info = link
                .service
                .register_consumer(&queue, consumer, group, position)
                .await?;
            if position.is_none() {
                self.ctx.store.set_position(&queue, info.last_tick).await?;
            }
            self.ctx.set_role(
                &queue,
                if info.active { QueueRole::Active } else { QueueRole::Standby },
            );
            debug!(
                queue = %queue,
                backend = link.service.name(),
                last_tick = info.last_tick,
                active = info.active,
                "Consumer registered"
            );

            if !info.active {
                continue;
            }
            for table in self.ctx.store.table_states(&queue).await? {
                if table.state == TableSyncState::InCopy && !table.failed {
                    info!(queue = %queue, table = %table.name, "Resuming interrupted copy");
                    self.ctx.request_copy(&queue, &table.name);
                }
            }
        }
        Ok(lanes)
    }

    /// Shutdown the replication engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal all tasks to stop (playback stops between batches)
    /// 2. Wait for tasks to complete (with timeout)
    /// 3. Checkpoint the store; closing it is left to its owner
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);

        // Signal shutdown to all tasks
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        let drain_timeout = Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        if let Err(e) = self.ctx.store.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint store on shutdown");
        }

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Operational API
    // ═══════════════════════════════════════════════════════════════════════════

    /// Snapshot of every consumed queue and its tables.
    pub async fn status(&self) -> Result<NodeStatus> {
        let node = &self.ctx.config.node;
        let mut queues = Vec::new();

        for queue in node.consumed_queues() {
            let runtime = self.ctx.runtime(&queue);
            let backend = self
                .ctx
                .link(&queue)
                .map(|l| l.service.name().to_string())
                .unwrap_or_else(|| "none".to_string());

            let mut tables = Vec::new();
            for state in self.ctx.store.table_states(&queue).await? {
                let pending = if state.state == TableSyncState::Ok {
                    0
                } else {
                    self.ctx.store.pending_count(&queue, &state.name).await?
                };
                tables.push(TableStatus::from_state(&state, pending));
            }

            queues.push(QueueStatus {
                position: self.ctx.store.position(&queue).await?,
                queue,
                backend,
                role: runtime.role,
                head: runtime.head,
                halted_error: runtime.halted_error,
                tables,
            });
        }

        Ok(NodeStatus {
            node_name: node.node_name.clone(),
            node_type: node.node_type,
            state: self.state(),
            queues,
        })
    }

    fn require_consumed(&self, queue: &str) -> Result<()> {
        if self.ctx.config.node.consumed_queues().iter().any(|q| q == queue) {
            Ok(())
        } else {
            Err(ReplicationError::Topology(format!(
                "{} does not consume queue {}",
                self.ctx.config.node.node_name, queue
            )))
        }
    }

    /// Register `table` on `queue` with a handler specification.
    ///
    /// The table starts NEW and is copied by the next playback cycle.
    /// Registering it again with a different handler or options restarts
    /// it from NEW; an identical registration changes nothing.
    pub async fn add_table(
        &self,
        queue: &str,
        table: &str,
        handler: &str,
        options: TableOptions,
    ) -> Result<TableState> {
        self.require_consumed(queue)?;
        let dest = options.dest_table.as_deref().unwrap_or(table);
        if self.ctx.store.table_info(dest).await?.is_none() {
            return Err(ReplicationError::Config(format!(
                "target table {} does not exist",
                dest
            )));
        }

        let lock = self.ctx.cycle_lock(queue);
        let _cycle = lock.lock().await;
        let state = self
            .ctx
            .store
            .register_table(queue, table, handler, &options)
            .await?;
        self.ctx.clear_copy_backoff(queue, table);
        info!(queue, table, handler = %state.handler, state = %state.state, "Table registered");
        Ok(state)
    }

    /// Stop replicating `table`. Local data is left in place.
    pub async fn remove_table(&self, queue: &str, table: &str) -> Result<()> {
        self.require_consumed(queue)?;
        let lock = self.ctx.cycle_lock(queue);
        let _cycle = lock.lock().await;
        if !self.ctx.store.remove_table(queue, table).await? {
            return Err(ReplicationError::UnknownTable {
                queue: queue.to_string(),
                table: table.to_string(),
            });
        }
        self.ctx.clear_copy_backoff(queue, table);
        info!(queue, table, "Table removed");
        Ok(())
    }

    /// Reset `table` to NEW so it is copied again; clears a failed flag.
    pub async fn resync_table(&self, queue: &str, table: &str) -> Result<TableState> {
        self.require_consumed(queue)?;
        let lock = self.ctx.cycle_lock(queue);
        let _cycle = lock.lock().await;
        let state = self.ctx.store.reset_table(queue, table).await?;
        self.ctx.clear_copy_backoff(queue, table);
        info!(queue, table, "Table reset for resync");
        Ok(state)
    }

    /// Compare `table` with its provider at one tick: row counts and
    /// checksums on both sides.
    ///
    /// Waits up to `timeout` for playback to line up with the provider's
    /// snapshot, so it needs a running engine unless the queue is idle.
    pub async fn compare_table(&self, queue: &str, table: &str, timeout: Duration) -> Result<TableComparison> {
        self.require_consumed(queue)?;
        compare::compare_table(&self.ctx, queue, table, timeout).await
    }

    /// Wait until every owned queue has applied up to the provider head
    /// seen at call time and all its tables are OK.
    ///
    /// Queues this node is standby for are not waited on. Fails fast when
    /// a table is frozen or a queue halted.
    pub async fn wait_sync(&self, timeout: Duration) -> Result<NodeStatus> {
        if !self.is_running() {
            return Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }

        let deadline = Instant::now() + timeout;
        let mut targets = Vec::new();
        for queue in self.ctx.config.node.consumed_queues() {
            let head = match self.ctx.link(&queue) {
                Some(link) => link.service.head_tick(&queue).await?.unwrap_or(0),
                None => 0,
            };
            targets.push((queue, head));
        }
        let poll = self.ctx.config.playback.poll_min_duration();

        loop {
            let status = self.status().await?;
            let mut synced = true;

            for (queue, head) in &targets {
                let Some(q) = status.queue(queue) else {
                    continue;
                };
                if let Some(err) = &q.halted_error {
                    return Err(ReplicationError::InvalidState {
                        expected: format!("{} replicating", queue),
                        actual: format!("halted: {}", err),
                    });
                }
                if let Some(t) = q.tables.iter().find(|t| t.failed) {
                    return Err(ReplicationError::TableFailed {
                        table: t.name.clone(),
                        message: t.last_error.clone().unwrap_or_default(),
                    });
                }
                match q.role {
                    QueueRole::Standby | QueueRole::Paused => {}
                    QueueRole::Pending => synced = false,
                    QueueRole::Active | QueueRole::Halted => {
                        if !q.is_synced() || q.position.unwrap_or(0) < *head {
                            synced = false;
                        }
                    }
                }
            }

            if synced {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(ReplicationError::Timeout(format!(
                    "sync of {} after {:?}",
                    self.ctx.config.node.node_name, timeout
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Take over consumption of `queue` from consumer `from`.
    pub async fn takeover(&self, queue: &str, from: &str) -> Result<TakeoverOutcome> {
        if !self.is_running() {
            return Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }
        self.require_consumed(queue)?;
        takeover::run_takeover(&self.ctx, queue, from).await
    }

    /// Take over `queue` from a consumer that has stopped acking.
    ///
    /// Refused unless `from` has been silent for `takeover.dead_after`.
    /// Only for owners known to be gone: a live one would keep applying
    /// until its next ack is rejected.
    pub async fn takeover_dead(&self, queue: &str, from: &str) -> Result<TakeoverOutcome> {
        if !self.is_running() {
            return Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }
        self.require_consumed(queue)?;
        takeover::run_dead_takeover(&self.ctx, queue, from).await
    }
}

/// Close captured events into ticks on a root.
async fn run_ticker(
    store: Arc<LocalStore>,
    queue: String,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(queue = %queue, interval_ms = interval.as_millis() as u64, "Starting ticker");

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match store.tick_if_pending(&queue).await {
                    Ok(Some(tick_id)) => {
                        metrics::record_tick(&queue);
                        debug!(queue = %queue, tick_id, "Ticked");
                    }
                    Ok(None) => {}
                    Err(e) => warn!(queue = %queue, error = %e, "Tick failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Ticker stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::LocalQueue;
    use crate::source::StoreSource;

    async fn leaf_engine() -> (ReplicationEngine, Arc<LocalStore>) {
        let root = Arc::new(LocalStore::in_memory().await.unwrap());
        let store = Arc::new(LocalStore::in_memory().await.unwrap());
        let engine = ReplicationEngine::new(EngineConfig::for_testing("leaf-1"), Arc::clone(&store))
            .with_provider(
                "testq",
                Arc::new(LocalQueue::new(Arc::clone(&root))),
                Arc::new(StoreSource::root(Arc::clone(&root), "testq")),
            );
        (engine, store)
    }

    #[tokio::test]
    async fn test_engine_initial_state() {
        let (engine, _) = leaf_engine().await;
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert_eq!(engine.node().node_name, "leaf-1");
    }

    #[tokio::test]
    async fn test_engine_state_receiver() {
        let (engine, _) = leaf_engine().await;
        let state_rx = engine.state_receiver();
        assert_eq!(*state_rx.borrow(), EngineState::Created);
    }

    #[tokio::test]
    async fn test_engine_start_invalid_state() {
        let (mut engine, _) = leaf_engine().await;

        // Force state to Running (simulating already started)
        let _ = engine.state_tx.send(EngineState::Running);

        let result = engine.start().await;
        if let Err(ReplicationError::InvalidState { expected, actual }) = result {
            assert_eq!(expected, "Created");
            assert_eq!(actual, "Running");
        } else {
            panic!("Expected InvalidState error");
        }
    }

    #[tokio::test]
    async fn test_engine_shutdown_from_created() {
        let (mut engine, _) = leaf_engine().await;
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_engine_state_is_running() {
        let (engine, _) = leaf_engine().await;
        assert!(!engine.is_running());

        let _ = engine.state_tx.send(EngineState::Running);
        assert!(engine.is_running());

        let _ = engine.state_tx.send(EngineState::Stopped);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_start_without_provider_fails() {
        let store = Arc::new(LocalStore::in_memory().await.unwrap());
        let mut engine = ReplicationEngine::new(EngineConfig::for_testing("leaf-1"), store);

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Topology(_)));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (mut engine, store) = leaf_engine().await;
        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert_eq!(store.position("testq").await.unwrap(), Some(0));

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_add_table_checks_queue_and_target() {
        let (engine, store) = leaf_engine().await;

        let err = engine
            .add_table("otherq", "users", "passthrough", TableOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Topology(_)));

        let err = engine
            .add_table("testq", "users", "passthrough", TableOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));

        store
            .execute_sql("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
            .await
            .unwrap();
        let state = engine
            .add_table("testq", "users", "passthrough", TableOptions::default())
            .await
            .unwrap();
        assert_eq!(state.state, TableSyncState::New);

        let status = engine.status().await.unwrap();
        assert_eq!(status.table("testq", "users").unwrap().state, TableSyncState::New);
    }

    #[tokio::test]
    async fn test_remove_and_resync_unknown_table() {
        let (engine, _) = leaf_engine().await;
        assert!(matches!(
            engine.remove_table("testq", "ghost").await,
            Err(ReplicationError::UnknownTable { .. })
        ));
        assert!(matches!(
            engine.resync_table("testq", "ghost").await,
            Err(ReplicationError::UnknownTable { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_sync_and_takeover_need_running_engine() {
        let (engine, _) = leaf_engine().await;
        assert!(matches!(
            engine.wait_sync(Duration::from_millis(10)).await,
            Err(ReplicationError::InvalidState { .. })
        ));
        assert!(matches!(
            engine.takeover("testq", "leaf-2").await,
            Err(ReplicationError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_copy_backoff() {
        let (engine, _) = leaf_engine().await;
        let ctx = &engine.ctx;
        assert!(ctx.copy_due("testq", "users"));
        ctx.defer_copy("testq", "users", Duration::from_secs(60));
        assert!(!ctx.copy_due("testq", "users"));
        ctx.clear_copy_backoff("testq", "users");
        assert!(ctx.copy_due("testq", "users"));
    }

    #[tokio::test]
    async fn test_halted_role_is_sticky() {
        let (engine, _) = leaf_engine().await;
        let ctx = &engine.ctx;
        ctx.halt("testq", &ReplicationError::Topology("boom".to_string()));
        ctx.set_role("testq", QueueRole::Active);
        let rt = ctx.runtime("testq");
        assert_eq!(rt.role, QueueRole::Halted);
        assert!(rt.halted_error.unwrap().contains("boom"));
    }
}
