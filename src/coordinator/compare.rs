//! Compare a replicated table with its provider.
//!
//! Both sides are summarised at the same tick. The provider is exported
//! through the queue's [`CopySource`](crate::source::CopySource), then the
//! local side is read under the cycle lock once playback has reached the
//! snapshot's tick. If playback is behind, the comparison waits; if it is
//! ahead (a replica provider lagging), the provider is exported again.
//!
//! Provider rows are projected to the shared columns and passed through
//! the table's handler first, exactly as a bulk copy would load them.
//! Values are summed as canonical text, so `"42"` and `42` agree.

use super::EngineContext;
use crate::error::{ReplicationError, Result};
use crate::event::Row;
use crate::handler::canonical_text;
use crate::source::TableSnapshot;
use crate::store::TableInfo;
use crate::sync_state::TableState;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Row count and checksum of one side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableChecksum {
    pub rows: usize,
    /// Order-independent sum of row digests, hex encoded.
    pub checksum: String,
}

impl TableChecksum {
    /// Summarise `rows` over `columns`.
    pub fn of(rows: &[Row], columns: &[String]) -> Self {
        let sum = rows
            .iter()
            .map(|row| row_digest(row, columns))
            .fold(0u64, u64::wrapping_add);
        Self {
            rows: rows.len(),
            checksum: hex::encode(sum.to_be_bytes()),
        }
    }
}

fn row_digest(row: &Row, columns: &[String]) -> u64 {
    let mut hasher = Sha256::new();
    for column in columns {
        match row.get(column).and_then(canonical_text) {
            Some(text) => {
                hasher.update(b"v");
                hasher.update((text.len() as u64).to_be_bytes());
                hasher.update(text.as_bytes());
            }
            None => hasher.update(b"n"),
        }
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Provider and local summaries of one table at one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableComparison {
    pub queue: String,
    pub table: String,
    pub tick_id: i64,
    /// Columns both sides have, sorted.
    pub columns: Vec<String>,
    pub provider: TableChecksum,
    pub local: TableChecksum,
}

impl TableComparison {
    pub fn matches(&self) -> bool {
        self.provider == self.local
    }
}

pub(crate) async fn compare_table(
    ctx: &EngineContext,
    queue: &str,
    table: &str,
    timeout: Duration,
) -> Result<TableComparison> {
    let link = ctx
        .link(queue)
        .ok_or_else(|| ReplicationError::Topology(format!("no provider attached for queue {}", queue)))?;
    let deadline = Instant::now() + timeout;
    let poll = ctx.config.playback.poll_min_duration();

    loop {
        let state = require_ok(ctx, queue, table).await?;
        if let Some(snapshot) = link.source.export(table).await? {
            let lock = ctx.cycle_lock(queue);
            let cycle = lock.lock().await;
            let position = ctx.store.position(queue).await?.unwrap_or(0);
            if position == snapshot.tick_id {
                let info = ctx
                    .store
                    .table_info(state.dest_table())
                    .await?
                    .ok_or_else(|| ReplicationError::handler(table, "target table does not exist"))?;
                let local_rows = ctx.store.fetch_rows(state.dest_table()).await?;
                drop(cycle);

                let comparison = summarise(queue, &state, &info, snapshot, &local_rows)?;
                if comparison.matches() {
                    info!(queue, table, tick_id = comparison.tick_id, rows = comparison.local.rows, "Table matches provider");
                } else {
                    warn!(
                        queue,
                        table,
                        tick_id = comparison.tick_id,
                        provider_rows = comparison.provider.rows,
                        local_rows = comparison.local.rows,
                        "Table differs from provider"
                    );
                }
                return Ok(comparison);
            }
            drop(cycle);
            debug!(queue, table, position, snapshot_tick = snapshot.tick_id, "Waiting to line up with provider");
        }

        if Instant::now() >= deadline {
            return Err(ReplicationError::Timeout(format!(
                "comparison of {} on {} after {:?}",
                table, queue, timeout
            )));
        }
        tokio::time::sleep(poll).await;
    }
}

async fn require_ok(ctx: &EngineContext, queue: &str, table: &str) -> Result<TableState> {
    let state = ctx
        .store
        .table_state(queue, table)
        .await?
        .ok_or_else(|| ReplicationError::UnknownTable {
            queue: queue.to_string(),
            table: table.to_string(),
        })?;
    if !state.is_ok() {
        return Err(ReplicationError::InvalidState {
            expected: format!("{} OK", table),
            actual: if state.failed {
                "failed".to_string()
            } else {
                state.state.to_string()
            },
        });
    }
    if !state.handler()?.truncates_on_copy() {
        // Merged targets hold rows of several providers.
        return Err(ReplicationError::Config(format!(
            "{} uses handler {}, which cannot be compared with one provider",
            table, state.handler
        )));
    }
    Ok(state)
}

fn summarise(
    queue: &str,
    state: &TableState,
    info: &TableInfo,
    snapshot: TableSnapshot,
    local_rows: &[Row],
) -> Result<TableComparison> {
    let handler = state.handler()?;
    let mut columns: Vec<String> = snapshot
        .columns
        .iter()
        .filter(|c| info.has_column(c))
        .cloned()
        .collect();
    columns.sort();

    let mut expected = Vec::with_capacity(snapshot.len());
    for row in snapshot.rows {
        let common = row
            .into_iter()
            .filter(|(column, _)| info.has_column(column))
            .collect();
        if let Some(row) = handler.copy_row(&state.name, common, info)? {
            expected.push(row);
        }
    }

    Ok(TableComparison {
        queue: queue.to_string(),
        table: state.name.clone(),
        tick_id: snapshot.tick_id,
        provider: TableChecksum::of(&expected, &columns),
        local: TableChecksum::of(local_rows, &columns),
        columns,
    })
}
