//! Bulk copy: bootstraps tables before they take live events.
//!
//! The playback loop claims NEW tables (NEW → IN_COPY) between batches
//! and sends them to the dispatcher. The dispatcher runs each copy in a
//! worker task gated by one of two lanes:
//!
//! ```text
//!                      ┌──────────────────────────────┐
//!   CopyRequest ──────►│ table matches parallel glob? │
//!                      └──────┬───────────────┬───────┘
//!                         yes │               │ no
//!                   ┌─────────▼─────┐   ┌─────▼───────────┐
//!                   │ worker pool   │   │ sequential lane │
//!                   │ (N permits)   │   │ (1 permit)      │
//!                   └─────────┬─────┘   └─────┬───────────┘
//!                             └───────┬───────┘
//!                           export snapshot at tick S
//!                           one transaction: truncate, load, CATCHING_UP(S)
//! ```
//!
//! A source that is not ready (a branch still syncing the table) hands
//! the table back to NEW without consuming an attempt. Other failures
//! count towards `max_copy_attempts`, after which the table is frozen.

use super::EngineContext;
use crate::config::CopyConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::CopyLane;
use crate::source::TableSnapshot;
use crate::store::{
    execute_with_retry, load_table_state, require_table_info, store_table_state, truncate, upsert_rows,
    LocalStore,
};
use crate::sync_state::TableSyncState;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long running copies may take to finish once shutdown starts.
const COPY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A claimed table waiting for a copy worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CopyRequest {
    pub queue: String,
    pub table: String,
}

/// What a copy attempt ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CopyOutcome {
    /// Snapshot loaded; the table is CATCHING_UP at `sync_tick_id`.
    Loaded { rows: usize, sync_tick_id: i64 },
    /// Source cannot serve the table yet; back to NEW, no attempt used.
    NotReady,
    /// Table was removed, reset or frozen while the copy ran.
    Stale,
    /// Attempt failed and was recorded.
    Failed { attempts: u32, frozen: bool },
}

/// Translate a table glob (`*` and `?`) into an anchored regex.
pub(crate) fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 2);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
        .map_err(|e| ReplicationError::Config(format!("invalid table pattern {}: {}", glob, e)))
}

/// The two copy lanes and the globs that pick between them.
#[derive(Debug, Clone)]
pub(crate) struct CopyLanes {
    patterns: Vec<Regex>,
    parallel: CopyLane,
    sequential: CopyLane,
}

impl CopyLanes {
    pub fn new(config: &CopyConfig) -> Result<Self> {
        let patterns = config
            .parallel_tables
            .iter()
            .map(|g| glob_to_regex(g))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            parallel: CopyLane::parallel(config.workers),
            sequential: CopyLane::sequential(),
        })
    }

    pub fn is_parallel(&self, table: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(table))
    }

    pub fn lane_for(&self, table: &str) -> &CopyLane {
        if self.is_parallel(table) {
            &self.parallel
        } else {
            &self.sequential
        }
    }

    fn close(&self) {
        self.parallel.close();
        self.sequential.close();
    }
}

/// Claim NEW tables of `queue` for copying, up to `max_parallel_copies`
/// tables in IN_COPY node-wide. Returns how many were claimed.
pub(crate) async fn schedule_copies(ctx: &EngineContext, queue: &str) -> Result<usize> {
    let states = ctx.store.all_table_states().await?;
    let in_copy = states
        .iter()
        .filter(|t| t.state == TableSyncState::InCopy)
        .count();
    let mut budget = ctx.config.copy.max_parallel_copies.max(1).saturating_sub(in_copy);
    let mut claimed = 0;

    for state in states
        .iter()
        .filter(|t| t.queue == queue && t.is_copy_candidate())
    {
        if budget == 0 {
            break;
        }
        if !ctx.copy_due(queue, &state.name) {
            continue;
        }
        match ctx.store.begin_copy(queue, &state.name).await {
            Ok(_) => {
                debug!(table = %state.name, "Claimed table for copy");
                ctx.request_copy(queue, &state.name);
                budget -= 1;
                claimed += 1;
            }
            // Removed or claimed concurrently.
            Err(ReplicationError::InvalidState { .. } | ReplicationError::UnknownTable { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(claimed)
}

/// Receive copy requests and run them through the lanes until shutdown.
pub(crate) async fn run_dispatcher(
    ctx: Arc<EngineContext>,
    lanes: CopyLanes,
    mut requests: mpsc::UnboundedReceiver<CopyRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        workers = lanes.parallel.size(),
        patterns = lanes.patterns.len(),
        "Starting copy dispatcher"
    );
    let mut workers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };
                let lane = lanes.lane_for(&request.table).clone();
                let ctx = Arc::clone(&ctx);
                workers.spawn(async move {
                    let Some(_slot) = lane.enter().await else {
                        return;
                    };
                    copy_table(&ctx, &request.queue, &request.table).await;
                });
                metrics::set_copies_in_flight(workers.len());
            }

            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Copy worker panicked");
                }
                metrics::set_copies_in_flight(workers.len());
            }
        }
    }

    // Queued copies stop waiting; tables left IN_COPY are re-dispatched on start.
    lanes.close();
    let drained = tokio::time::timeout(COPY_DRAIN_TIMEOUT, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = workers.len(), "Copies still running at shutdown, aborting");
        workers.shutdown().await;
    }
    metrics::set_copies_in_flight(0);
    info!("Copy dispatcher stopped");
}

/// Copy one claimed table. Failures are recorded, never propagated.
pub(crate) async fn copy_table(ctx: &EngineContext, queue: &str, table: &str) -> CopyOutcome {
    let span = info_span!("copy", queue = %queue, table = %table);
    async {
        let started = Instant::now();
        info!("Starting bulk copy");

        let export = match ctx.link(queue) {
            Some(link) => link.source.export(table).await,
            None => Err(ReplicationError::Topology(format!("no copy source for queue {}", queue))),
        };

        let result = match export {
            Ok(None) => {
                return match ctx.store.release_copy(queue, table).await {
                    Ok(_) => {
                        let delay = ctx.config.copy.backoff_for_attempts(1);
                        ctx.defer_copy(queue, table, delay);
                        debug!(retry_in_ms = delay.as_millis() as u64, "Copy source not ready");
                        metrics::record_copy(queue, "not_ready", 0, started.elapsed());
                        CopyOutcome::NotReady
                    }
                    Err(e) => record_failure(ctx, queue, table, &e, started).await,
                };
            }
            Ok(Some(snapshot)) => load_snapshot(&ctx.store, queue, table, &snapshot, ctx.config.copy.chunk_rows).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome @ CopyOutcome::Loaded { rows, sync_tick_id }) => {
                ctx.clear_copy_backoff(queue, table);
                info!(
                    rows,
                    sync_tick_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Bulk copy loaded, catching up"
                );
                metrics::record_copy(queue, "ok", rows, started.elapsed());
                outcome
            }
            Ok(outcome) => {
                debug!("Table changed during copy, result discarded");
                metrics::record_copy(queue, "stale", 0, started.elapsed());
                outcome
            }
            Err(e) => record_failure(ctx, queue, table, &e, started).await,
        }
    }
    .instrument(span)
    .await
}

async fn record_failure(
    ctx: &EngineContext,
    queue: &str,
    table: &str,
    err: &ReplicationError,
    started: Instant,
) -> CopyOutcome {
    metrics::record_copy(queue, "failed", 0, started.elapsed());
    let max_attempts = ctx.config.copy.max_copy_attempts;
    match ctx
        .store
        .record_copy_failure(queue, table, &err.to_string(), max_attempts)
        .await
    {
        Ok(Some(state)) if state.failed => {
            let frozen = ReplicationError::CopyFailed {
                table: table.to_string(),
                attempts: state.copy_attempts,
                message: err.to_string(),
            };
            error!(error = %frozen, "Bulk copy gave up; table frozen until resync");
            CopyOutcome::Failed {
                attempts: state.copy_attempts,
                frozen: true,
            }
        }
        Ok(Some(state)) => {
            let delay = ctx.config.copy.backoff_for_attempts(state.copy_attempts);
            ctx.defer_copy(queue, table, delay);
            warn!(
                error = %err,
                attempts = state.copy_attempts,
                max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                "Bulk copy failed"
            );
            CopyOutcome::Failed {
                attempts: state.copy_attempts,
                frozen: false,
            }
        }
        Ok(None) => CopyOutcome::Stale,
        Err(e) => {
            // The table stays IN_COPY; it is re-dispatched on the next start.
            error!(error = %e, copy_error = %err, "Could not record copy failure");
            CopyOutcome::Failed {
                attempts: 0,
                frozen: false,
            }
        }
    }
}

/// Load a snapshot into the target table in one transaction.
pub(crate) async fn load_snapshot(
    store: &LocalStore,
    queue: &str,
    table: &str,
    snapshot: &TableSnapshot,
    chunk_rows: usize,
) -> Result<CopyOutcome> {
    execute_with_retry("copy_table", || async {
        let mut tx = store.begin_write().await?;

        let Some(mut state) = load_table_state(&mut tx, queue, table).await? else {
            return Ok(CopyOutcome::Stale);
        };
        if state.state != TableSyncState::InCopy || state.failed {
            return Ok(CopyOutcome::Stale);
        }

        let handler = state.handler()?;
        let info = require_table_info(&mut tx, state.dest_table()).await?;
        if handler.truncates_on_copy() && !state.options.skip_truncate {
            truncate(&mut tx, &info).await?;
        }

        let mut rows = Vec::with_capacity(snapshot.len());
        for row in &snapshot.rows {
            let common = row
                .iter()
                .filter(|(column, _)| info.has_column(column))
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();
            if let Some(row) = handler.copy_row(table, common, &info)? {
                rows.push(row);
            }
        }
        upsert_rows(&mut tx, &info, &rows, handler.version_column(), chunk_rows).await?;

        state.finish_copy(snapshot.tick_id)?;
        store_table_state(&mut tx, &state).await?;
        tx.commit().await?;

        Ok(CopyOutcome::Loaded {
            rows: rows.len(),
            sync_tick_id: snapshot.tick_id,
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("public.order_*").unwrap();
        assert!(re.is_match("public.order_lines"));
        assert!(re.is_match("public.order_"));
        assert!(!re.is_match("public.orders"));
        assert!(!re.is_match("xpublic.order_lines"));

        let single = glob_to_regex("t?").unwrap();
        assert!(single.is_match("t1"));
        assert!(!single.is_match("t12"));
    }

    #[test]
    fn test_lanes_pick_by_pattern() {
        let config = CopyConfig {
            workers: 3,
            parallel_tables: vec!["big_*".to_string()],
            ..Default::default()
        };
        let lanes = CopyLanes::new(&config).unwrap();
        assert!(lanes.is_parallel("big_events"));
        assert!(!lanes.is_parallel("users"));
        assert_eq!(lanes.lane_for("big_events").size(), 3);
        assert_eq!(lanes.lane_for("users").size(), 1);
    }

    #[test]
    fn test_no_patterns_means_sequential() {
        let config = CopyConfig {
            parallel_tables: Vec::new(),
            ..Default::default()
        };
        let lanes = CopyLanes::new(&config).unwrap();
        assert!(!lanes.is_parallel("anything"));
    }
}
