//! Playback: the per-queue batch loop.
//!
//! Each consumed queue has one task that, per cycle:
//! 1. Checks the consumer registration (standby, pause handshake)
//! 2. Fetches the batch after the local position through the fetch circuit
//! 3. Applies it in one transaction and advances the position
//! 4. Acks, then claims NEW tables for bulk copy
//!
//! An idle owner re-acks its position every empty poll; the ack refreshes
//! its registration, which forced takeover reads as a liveness signal.
//!
//! # Batch Transaction
//!
//! ```text
//! BEGIN (write lock)
//!   position >= tick?             → already applied, ack again
//!   prev_tick != position?        → PositionMismatch (queue halts)
//!   drain buffers of CATCHING_UP tables (ticks > sync_tick only)
//!   per event: route → skip | buffer | handler + apply (savepoint)
//!   branch: re-emit batch into the local queue
//!   promote CATCHING_UP tables with sync_tick <= tick
//!   position := tick
//! COMMIT
//! ```
//!
//! A statement failing for one table rolls back to its savepoint and
//! freezes that table; the batch goes on. Busy/locked errors roll back the
//! whole batch, which is retried unchanged after a backoff.

use super::copy;
use super::types::QueueRole;
use super::{EngineContext, QueueLink};
use crate::error::{ReplicationError, Result};
use crate::event::{Batch, Event, Op};
use crate::exec_attrs::{ExecAttrs, ExecContext};
use crate::handler::Handler;
use crate::metrics::{self, ApplyStats};
use crate::queue::Handoff;
use crate::store::{
    apply_op, buffer_event, emit_batch, execute_seen, execute_with_retry, load_table_info,
    load_table_states, read_position, record_execute, schema_objects, store_table_state, take_pending,
    write_position, LocalStore, TableInfo,
};
use crate::sync_state::{Route, TableState, TableSyncState};
use sqlx::{Connection, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Result of one loop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    /// A batch was applied (or found already applied); fetch again at once.
    Applied,
    /// Nothing after our position.
    Empty,
    /// Not the active consumer right now.
    Idle,
}

/// Node policy applied to every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ApplyPolicy {
    /// Run EXECUTE events.
    pub allows_execute: bool,
    /// Re-emit applied batches into the local queue (branch nodes).
    pub reemit: bool,
}

/// Result of applying one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchOutcome {
    Applied(ApplyStats),
    /// Committed by an earlier attempt whose ack was lost.
    AlreadyApplied,
}

/// Run the playback loop for `queue` until shutdown or a queue-fatal error.
pub(crate) async fn run_playback(
    ctx: Arc<EngineContext>,
    queue: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("playback", queue = %queue);

    async move {
        let Some(link) = ctx.link(&queue) else {
            let err = ReplicationError::Topology(format!("no queue service configured for {}", queue));
            error!(error = %err, "Playback cannot start");
            ctx.halt(&queue, &err);
            return;
        };
        info!(backend = link.service.name(), "Starting playback loop");

        let playback = &ctx.config.playback;
        let mut poll_delay = Duration::ZERO;
        let mut error_backoff = playback.poll_min_duration();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let result = {
                let lock = ctx.cycle_lock(&queue);
                let _cycle = lock.lock().await;
                if *shutdown_rx.borrow() {
                    break;
                }
                run_cycle(&ctx, &link, &queue, &mut shutdown_rx).await
            };

            let delay = match result {
                Ok(Cycle::Applied) => {
                    poll_delay = Duration::ZERO;
                    error_backoff = playback.poll_min_duration();
                    continue;
                }
                Ok(Cycle::Empty) => {
                    error_backoff = playback.poll_min_duration();
                    poll_delay = playback.next_poll_delay(poll_delay);
                    poll_delay
                }
                Ok(Cycle::Idle) => {
                    poll_delay = Duration::ZERO;
                    playback.idle_poll_duration()
                }
                Err(ReplicationError::Shutdown) => break,
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, backoff_ms = error_backoff.as_millis() as u64, "Playback cycle failed, retrying");
                    metrics::record_playback_error(&queue, "transient");
                    let delay = error_backoff;
                    error_backoff = error_backoff
                        .saturating_mul(2)
                        .min(playback.error_backoff_max_duration());
                    delay
                }
                Err(e) => {
                    error!(error = %e, scope = %e.scope(), "Playback halted");
                    metrics::record_playback_error(&queue, &e.scope().to_string());
                    ctx.halt(&queue, &e);
                    break;
                }
            };

            if sleep_or_shutdown(&mut shutdown_rx, delay).await {
                break;
            }
        }

        info!("Playback loop stopped");
    }
    .instrument(span)
    .await
}

/// Sleep for `delay`. Returns true if shutdown was signalled meanwhile.
async fn sleep_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn run_cycle(
    ctx: &EngineContext,
    link: &QueueLink,
    queue: &str,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<Cycle> {
    let consumer = ctx.config.node.consumer_name();
    let service = &link.service;

    let info = service
        .consumer_info(queue, consumer)
        .await?
        .ok_or_else(|| ReplicationError::UnknownConsumer {
            queue: queue.to_string(),
            consumer: consumer.to_string(),
        })?;

    if !info.active {
        ctx.set_role(queue, QueueRole::Standby);
        return Ok(Cycle::Idle);
    }
    if info.paused {
        ctx.set_role(queue, QueueRole::Paused);
        return Ok(Cycle::Idle);
    }
    if info.pause_requested {
        confirm_pause(ctx, link, queue).await?;
        return Ok(Cycle::Idle);
    }
    ctx.set_role(queue, QueueRole::Active);

    let position = match ctx.store.position(queue).await? {
        Some(position) => position,
        None => {
            ctx.store.set_position(queue, info.last_tick).await?;
            info.last_tick
        }
    };

    let fetch_start = Instant::now();
    let batch = ctx
        .circuit
        .fetch(queue, || service.next_batch(queue, position))
        .await?;
    let fetch_elapsed = fetch_start.elapsed();
    metrics::record_batch_fetch(queue, batch.as_ref().map_or(0, Batch::len), fetch_elapsed);
    if ctx.config.slo.is_fetch_violation(fetch_elapsed) {
        warn!(latency_ms = fetch_elapsed.as_millis() as u64, "Batch fetch exceeded SLO");
        metrics::record_slo_violation(queue, "fetch", fetch_elapsed.as_millis() as u64);
    }

    let Some(batch) = batch else {
        let stats = housekeeping(&ctx.store, queue).await?;
        if stats.replayed > 0 || stats.tables_failed > 0 {
            debug!(replayed = stats.replayed, "Drained copy buffers while idle");
        }
        copy::schedule_copies(ctx, queue).await?;
        refresh_lag(ctx, link, queue, position).await;
        // Re-acking the position tells the queue service we are alive.
        if let Err(e) = ctx
            .circuit
            .ack(queue, || service.ack(queue, consumer, position))
            .await
        {
            debug!(error = %e, "Heartbeat ack failed");
        }
        return Ok(Cycle::Empty);
    };

    if batch.prev_tick_id != position {
        return Err(ReplicationError::PositionMismatch {
            queue: queue.to_string(),
            expected: position,
            actual: batch.prev_tick_id,
        });
    }

    if let Some(throttle) = &ctx.throttle {
        throttle.admit(batch.len()).await;
    }

    let apply_start = Instant::now();
    let outcome = apply_with_retry(ctx, queue, &batch, shutdown_rx).await?;
    let apply_elapsed = apply_start.elapsed();

    match outcome {
        BatchOutcome::Applied(stats) => {
            metrics::record_batch_applied(queue, &stats, apply_elapsed);
            debug!(
                tick_id = batch.tick_id,
                events = batch.len(),
                applied = stats.applied,
                buffered = stats.buffered,
                skipped = stats.skipped,
                "Applied batch"
            );
            if ctx.config.slo.is_apply_violation(apply_elapsed) {
                warn!(
                    tick_id = batch.tick_id,
                    latency_ms = apply_elapsed.as_millis() as u64,
                    "Batch apply exceeded SLO"
                );
                metrics::record_slo_violation(queue, "apply", apply_elapsed.as_millis() as u64);
            }
        }
        BatchOutcome::AlreadyApplied => {
            debug!(tick_id = batch.tick_id, "Batch already applied, re-acking");
        }
    }

    if let Err(e) = ctx
        .circuit
        .ack(queue, || service.ack(queue, consumer, batch.tick_id))
        .await
    {
        // The position is committed; the next ack covers this tick.
        warn!(tick_id = batch.tick_id, error = %e, "Ack failed");
        metrics::record_playback_error(queue, "ack");
    }

    copy::schedule_copies(ctx, queue).await?;
    Ok(Cycle::Applied)
}

/// Owner side of the pause handshake: stop applying and publish a handoff.
async fn confirm_pause(ctx: &EngineContext, link: &QueueLink, queue: &str) -> Result<()> {
    ctx.set_role(queue, QueueRole::Paused);
    let handoff = Handoff {
        last_tick: ctx.store.position(queue).await?.unwrap_or(0),
        tables: ctx.store.table_states(queue).await?,
    };
    link.service
        .confirm_pause(queue, ctx.config.node.consumer_name(), &handoff)
        .await?;
    metrics::record_pause_confirmed(queue);
    info!(last_tick = handoff.last_tick, tables = handoff.tables.len(), "Confirmed pause");
    Ok(())
}

async fn refresh_lag(ctx: &EngineContext, link: &QueueLink, queue: &str, position: i64) {
    let head = match link.service.head_tick(queue).await {
        Ok(head) => head,
        Err(e) => {
            debug!(error = %e, "Could not read queue head");
            return;
        }
    };
    ctx.update_runtime(queue, |rt| rt.head = head);
    let Some(head) = head else {
        return;
    };
    metrics::record_position(queue, position, head);
    let lag = head.saturating_sub(position).max(0) as u64;
    if ctx.config.slo.is_lag_violation(lag) {
        warn!(lag_ticks = lag, "Consumer lag exceeded SLO");
        metrics::record_slo_violation(queue, "lag", lag);
    }

    match ctx.store.table_states(queue).await {
        Ok(states) => {
            for state in [
                TableSyncState::New,
                TableSyncState::InCopy,
                TableSyncState::CatchingUp,
                TableSyncState::Ok,
            ] {
                let count = states.iter().filter(|t| t.state == state).count();
                metrics::set_table_state_count(queue, state.as_str(), count);
            }
        }
        Err(e) => debug!(error = %e, "Could not count table states"),
    }
}

/// Apply a batch, retrying transient failures without refetching.
async fn apply_with_retry(
    ctx: &EngineContext,
    queue: &str,
    batch: &Batch,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<BatchOutcome> {
    let playback = &ctx.config.playback;
    let mut backoff = playback.poll_min_duration();
    let mut attempt = 1u32;

    loop {
        match apply_batch(&ctx.store, queue, batch, ctx.apply_policy()).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() => {
                warn!(
                    tick_id = batch.tick_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Batch rolled back, retrying"
                );
                metrics::record_batch_retry(queue);
                if sleep_or_shutdown(shutdown_rx, backoff).await {
                    return Err(ReplicationError::Shutdown);
                }
                backoff = backoff
                    .saturating_mul(2)
                    .min(playback.error_backoff_max_duration());
                attempt = attempt.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Apply one batch in a single transaction.
pub(crate) async fn apply_batch(
    store: &LocalStore,
    queue: &str,
    batch: &Batch,
    policy: ApplyPolicy,
) -> Result<BatchOutcome> {
    let mut tx = store.begin_write().await?;

    let position = read_position(&mut tx, queue).await?.unwrap_or(0);
    if position >= batch.tick_id {
        tx.rollback().await?;
        return Ok(BatchOutcome::AlreadyApplied);
    }
    if batch.prev_tick_id != position {
        return Err(ReplicationError::PositionMismatch {
            queue: queue.to_string(),
            expected: position,
            actual: batch.prev_tick_id,
        });
    }

    let mut applier = Applier::load(&mut tx, queue, policy.allows_execute).await?;
    applier.drain_pending(&mut tx).await?;
    for event in &batch.events {
        applier.apply_live(&mut tx, event).await?;
    }
    if policy.reemit {
        emit_batch(&mut tx, queue, batch).await?;
    }
    applier.promote(batch.tick_id);
    applier.persist(&mut tx).await?;
    write_position(&mut tx, queue, batch.tick_id).await?;
    tx.commit().await?;

    Ok(BatchOutcome::Applied(applier.stats))
}

/// Drain copy buffers and promote caught-up tables outside of a batch.
pub(crate) async fn housekeeping(store: &LocalStore, queue: &str) -> Result<ApplyStats> {
    let states = store.table_states(queue).await?;
    if !states
        .iter()
        .any(|t| t.state == TableSyncState::CatchingUp && !t.failed)
    {
        return Ok(ApplyStats::default());
    }

    execute_with_retry("housekeeping", || async {
        let mut tx = store.begin_write().await?;
        let position = read_position(&mut tx, queue).await?.unwrap_or(0);
        // EXECUTE never sits in a copy buffer.
        let mut applier = Applier::load(&mut tx, queue, false).await?;
        applier.drain_pending(&mut tx).await?;
        applier.promote(position);
        applier.persist(&mut tx).await?;
        tx.commit().await?;
        Ok(applier.stats)
    })
    .await
}

/// Per-transaction apply state: table states, parsed handlers and
/// column metadata for one queue.
struct Applier {
    queue: String,
    allows_execute: bool,
    states: BTreeMap<String, TableState>,
    handlers: HashMap<String, Handler>,
    infos: HashMap<String, TableInfo>,
    dirty: BTreeSet<String>,
    stats: ApplyStats,
}

impl Applier {
    async fn load(conn: &mut SqliteConnection, queue: &str, allows_execute: bool) -> Result<Self> {
        let mut applier = Self {
            queue: queue.to_string(),
            allows_execute,
            states: BTreeMap::new(),
            handlers: HashMap::new(),
            infos: HashMap::new(),
            dirty: BTreeSet::new(),
            stats: ApplyStats::default(),
        };
        for state in load_table_states(conn, queue).await? {
            let name = state.name.clone();
            match state.handler() {
                Ok(handler) => {
                    applier.handlers.insert(name.clone(), handler);
                    applier.states.insert(name, state);
                }
                Err(e) => {
                    applier.states.insert(name.clone(), state);
                    applier.fail_table(&name, &e);
                }
            }
        }
        Ok(applier)
    }

    /// Replay buffered events of tables whose copy has finished.
    async fn drain_pending(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        let catching_up: Vec<String> = self
            .states
            .values()
            .filter(|t| t.state == TableSyncState::CatchingUp && !t.failed)
            .map(|t| t.name.clone())
            .collect();

        for table in catching_up {
            let events = take_pending(conn, &self.queue, &table).await?;
            if events.is_empty() {
                continue;
            }
            debug!(table = %table, events = events.len(), "Replaying copy buffer");
            for event in &events {
                self.route_row_event(conn, event, true).await?;
            }
        }
        Ok(())
    }

    async fn apply_live(&mut self, conn: &mut SqliteConnection, event: &Event) -> Result<()> {
        if event.op == Op::Execute {
            return self.execute(conn, event).await;
        }
        self.route_row_event(conn, event, false).await
    }

    async fn route_row_event(&mut self, conn: &mut SqliteConnection, event: &Event, replay: bool) -> Result<()> {
        let Some(state) = self.states.get(&event.table) else {
            self.stats.skipped += 1;
            return Ok(());
        };

        match state.route(event.tick_id) {
            Route::Skip => self.stats.skipped += 1,
            Route::Buffer => {
                buffer_event(conn, &self.queue, event).await?;
                self.stats.buffered += 1;
            }
            Route::Apply => {
                if event.op == Op::Truncate && state.options.ignore_truncate {
                    self.stats.skipped += 1;
                    return Ok(());
                }
                match self.apply_row_event(conn, event).await {
                    Ok(true) if replay => self.stats.replayed += 1,
                    Ok(true) => self.stats.applied += 1,
                    Ok(false) => self.stats.skipped += 1,
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => self.fail_table(&event.table, &e),
                }
            }
        }
        Ok(())
    }

    /// Transform and apply one event inside a savepoint.
    /// Returns whether anything reached the table.
    async fn apply_row_event(&mut self, conn: &mut SqliteConnection, event: &Event) -> Result<bool> {
        let (dest, handler) = match (self.states.get(&event.table), self.handlers.get(&event.table)) {
            (Some(state), Some(handler)) => (state.dest_table().to_string(), handler.clone()),
            _ => return Ok(false),
        };

        if !self.infos.contains_key(&dest) {
            let info = load_table_info(conn, &dest)
                .await?
                .ok_or_else(|| ReplicationError::handler(&event.table, format!("target table {} does not exist", dest)))?;
            self.infos.insert(dest.clone(), info);
        }
        let Some(info) = self.infos.get(&dest) else {
            return Ok(false);
        };

        let Some(op) = handler.transform(event, info)? else {
            return Ok(false);
        };

        let mut savepoint = conn.begin().await?;
        match apply_op(&mut savepoint, info, &op).await {
            Ok(_) => {
                savepoint.commit().await?;
                Ok(true)
            }
            Err(e) => {
                savepoint.rollback().await?;
                Err(e)
            }
        }
    }

    async fn execute(&mut self, conn: &mut SqliteConnection, event: &Event) -> Result<()> {
        let name = event.table.as_str();

        if !self.allows_execute {
            debug!(script = name, "EXECUTE suppressed on this node");
            metrics::record_execute(&self.queue, "suppressed");
            self.stats.skipped += 1;
            return Ok(());
        }
        if execute_seen(conn, name).await? {
            debug!(script = name, "EXECUTE already ran");
            metrics::record_execute(&self.queue, "duplicate");
            self.stats.skipped += 1;
            return Ok(());
        }

        let sql = event.sql.as_deref().unwrap_or_default();
        let attrs = ExecAttrs::parse(name, sql)?;
        let sql = if attrs.is_empty() {
            sql.to_string()
        } else {
            let local: HashMap<String, String> = self
                .states
                .values()
                .map(|s| (s.name.clone(), s.dest_table().to_string()))
                .collect();
            let schema = schema_objects(conn).await?;
            let ctx = ExecContext {
                local: &local,
                schema: &schema,
            };
            if !attrs.need_execute(name, &ctx)? {
                // Recorded so a later delivery is a duplicate, not a rerun.
                record_execute(conn, &self.queue, name).await?;
                debug!(script = name, "EXECUTE not needed on this node");
                metrics::record_execute(&self.queue, "not_needed");
                self.stats.skipped += 1;
                return Ok(());
            }
            attrs.rewrite(sql, &ctx)
        };

        let mut savepoint = conn.begin().await?;
        if let Err(e) = sqlx::Executor::execute(&mut *savepoint, sql.as_str()).await {
            savepoint.rollback().await?;
            let err = ReplicationError::from(e);
            if err.is_retryable() {
                return Err(err);
            }
            return Err(ReplicationError::Execute {
                name: name.to_string(),
                message: err.to_string(),
            });
        }
        savepoint.commit().await?;
        record_execute(conn, &self.queue, name).await?;

        // DDL may have changed any table's columns.
        self.infos.clear();
        info!(script = name, tick_id = event.tick_id, "Executed statement");
        metrics::record_execute(&self.queue, "executed");
        self.stats.applied += 1;
        Ok(())
    }

    fn fail_table(&mut self, table: &str, err: &ReplicationError) {
        let Some(state) = self.states.get_mut(table) else {
            return;
        };
        state.fail(&err.to_string());
        self.dirty.insert(table.to_string());
        self.stats.tables_failed += 1;
        warn!(table, error = %err, "Table failed; frozen until resync");
        metrics::record_playback_error(&self.queue, "table");
    }

    /// CATCHING_UP → OK for tables whose snapshot the position has reached.
    fn promote(&mut self, position: i64) {
        for state in self.states.values_mut() {
            if state.mark_caught_up(position) {
                info!(table = %state.name, position, "Table caught up");
                self.dirty.insert(state.name.clone());
            }
        }
    }

    async fn persist(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        for name in std::mem::take(&mut self.dirty) {
            if let Some(state) = self.states.get(&name) {
                store_table_state(conn, state).await?;
            }
        }
        Ok(())
    }
}
