// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local SQLite store: replicated tables plus all replication bookkeeping.
//!
//! The consumer position, table sync states, copy buffers and the
//! EXECUTE log live in the same database as the replicated data. Applying
//! a batch and advancing the position therefore commit in a single
//! transaction, which is what makes playback exactly-once:
//!
//! ```text
//! BEGIN
//!   apply events of tick T       ─┐
//!   buffer / promote tables       │  all or nothing
//!   consumer_position := T       ─┘
//! COMMIT
//! ```
//!
//! # SQLite Busy Handling
//!
//! Write transactions take the write lock with their first statement so
//! two writers never deadlock on a lock upgrade. SQLITE_BUSY/SQLITE_LOCKED
//! is transient: single statements are retried here with exponential
//! backoff, whole batches are retried by the playback loop.

mod apply;
mod log;

pub use apply::TableInfo;
pub(crate) use apply::{
    apply_op, load_table_info, quote_ident, require_table_info, select_rows, truncate, upsert_rows,
};
pub(crate) use log::emit_batch;

use crate::config::StoreConfig;
use crate::error::{ReplicationError, Result};
use crate::event::{Event, Op, Row};
use crate::sync_state::{TableOptions, TableState, TableSyncState};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row as _, Sqlite, SqliteConnection, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS store_lock (
    id INTEGER PRIMARY KEY,
    touched_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS consumer_position (
    queue_name TEXT PRIMARY KEY,
    last_tick INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS table_state (
    queue_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    handler TEXT NOT NULL,
    dest_table TEXT,
    skip_truncate INTEGER NOT NULL DEFAULT 0,
    ignore_truncate INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    sync_tick_id INTEGER,
    copy_attempts INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (queue_name, table_name)
);
CREATE TABLE IF NOT EXISTS pending_event (
    queue_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    tick_id INTEGER NOT NULL,
    event_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (queue_name, table_name, tick_id, event_id)
);
CREATE TABLE IF NOT EXISTS execute_log (
    name TEXT PRIMARY KEY,
    queue_name TEXT NOT NULL,
    executed_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS queue_event (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_name TEXT NOT NULL,
    tick_id INTEGER,
    op TEXT NOT NULL,
    table_name TEXT NOT NULL,
    row_data TEXT NOT NULL,
    sql_text TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS queue_event_tick ON queue_event (queue_name, tick_id, event_id);
CREATE TABLE IF NOT EXISTS queue_tick (
    queue_name TEXT NOT NULL,
    tick_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (queue_name, tick_id)
);
CREATE TABLE IF NOT EXISTS queue_consumer (
    queue_name TEXT NOT NULL,
    consumer TEXT NOT NULL,
    group_name TEXT NOT NULL,
    last_tick INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 0,
    pause_requested INTEGER NOT NULL DEFAULT 0,
    paused INTEGER NOT NULL DEFAULT 0,
    handoff TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (queue_name, consumer)
);
"#;

/// Check if an error is a retryable SQLite busy/locked error
pub fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6, plus their extended codes
            if let Some(code) = db_err.code() {
                if matches!(code.as_ref(), "5" | "6" | "261" | "262" | "517") {
                    return true;
                }
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

fn is_busy(e: &ReplicationError) -> bool {
    matches!(e, ReplicationError::Store(inner) if is_sqlite_busy_error(inner))
}

/// Run a store operation, retrying on SQLITE_BUSY/SQLITE_LOCKED.
pub(crate) async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_busy(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_busy(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SQLite-backed local store.
pub struct LocalStore {
    pool: SqlitePool,
    path: String,
}

impl LocalStore {
    /// Open (or create) the store described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let in_memory = config.is_in_memory();
        info!(path = %config.sqlite_path, in_memory, "Opening local store");

        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.sqlite_path)
                .create_if_missing(true)
        };
        let mut options = options.busy_timeout(config.busy_timeout_duration());
        if config.wal_mode && !in_memory {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // An in-memory database lives exactly as long as its one connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self {
            pool,
            path: config.sqlite_path.clone(),
        })
    }

    /// Private in-memory store, mostly for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory()).await
    }

    /// File-backed store in WAL mode at `path`.
    pub async fn open_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        Self::open(&StoreConfig::at_path(path)).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Begin a transaction that already holds the write lock.
    pub(crate) async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO store_lock (id, touched_at) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET touched_at = excluded.touched_at",
        )
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Data tables
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run one or more raw statements (DDL, fixtures).
    pub async fn execute_sql(&self, sql: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("execute_sql", || async move {
            sqlx::raw_sql(sql).execute(pool).await?;
            Ok(())
        })
        .await
    }

    pub async fn table_info(&self, table: &str) -> Result<Option<TableInfo>> {
        let mut conn = self.pool.acquire().await?;
        load_table_info(&mut conn, table).await
    }

    /// All rows of `table` ordered by primary key.
    pub async fn fetch_rows(&self, table: &str) -> Result<Vec<Row>> {
        let mut conn = self.pool.acquire().await?;
        let info = load_table_info(&mut conn, table)
            .await?
            .ok_or_else(|| ReplicationError::handler(table, "table does not exist"))?;
        select_rows(&mut conn, &info).await
    }

    pub async fn row_count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Consumer position
    // ═══════════════════════════════════════════════════════════════════════════

    /// Last tick fully applied for `queue`; `None` before the first batch.
    pub async fn position(&self, queue: &str) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        read_position(&mut conn, queue).await
    }

    pub async fn set_position(&self, queue: &str, tick_id: i64) -> Result<()> {
        execute_with_retry("set_position", || async {
            let mut tx = self.begin_write().await?;
            write_position(&mut tx, queue, tick_id).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Table sync state
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn table_state(&self, queue: &str, table: &str) -> Result<Option<TableState>> {
        let mut conn = self.pool.acquire().await?;
        load_table_state(&mut conn, queue, table).await
    }

    pub async fn table_states(&self, queue: &str) -> Result<Vec<TableState>> {
        let mut conn = self.pool.acquire().await?;
        load_table_states(&mut conn, queue).await
    }

    /// Every registered table across all queues.
    pub async fn all_table_states(&self) -> Result<Vec<TableState>> {
        let rows = sqlx::query("SELECT * FROM table_state ORDER BY queue_name, table_name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(table_state_from_row).collect()
    }

    pub async fn save_table_state(&self, state: &TableState) -> Result<()> {
        execute_with_retry("save_table_state", || async {
            let mut tx = self.begin_write().await?;
            store_table_state(&mut tx, state).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Register a table, or re-register it if its configuration changed.
    ///
    /// Returns the stored state. An identical registration is a no-op; a
    /// changed one restarts the table from NEW and drops its copy buffer.
    pub async fn register_table(
        &self,
        queue: &str,
        table: &str,
        handler: &str,
        options: &TableOptions,
    ) -> Result<TableState> {
        let fresh = TableState::register(queue, table, handler, options.clone())?;
        execute_with_retry("register_table", || async {
            let mut tx = self.begin_write().await?;
            let state = match load_table_state(&mut tx, queue, table).await? {
                Some(existing)
                    if existing.handler == fresh.handler && existing.options == fresh.options =>
                {
                    existing
                }
                _ => {
                    clear_pending(&mut tx, queue, table).await?;
                    store_table_state(&mut tx, &fresh).await?;
                    fresh.clone()
                }
            };
            tx.commit().await?;
            Ok(state)
        })
        .await
    }

    /// Drop a table's registration and copy buffer. Returns whether it existed.
    pub async fn remove_table(&self, queue: &str, table: &str) -> Result<bool> {
        execute_with_retry("remove_table", || async {
            let mut tx = self.begin_write().await?;
            clear_pending(&mut tx, queue, table).await?;
            let removed = sqlx::query("DELETE FROM table_state WHERE queue_name = ? AND table_name = ?")
                .bind(queue)
                .bind(table)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok(removed > 0)
        })
        .await
    }

    /// Reset a table to NEW so it is copied again.
    pub async fn reset_table(&self, queue: &str, table: &str) -> Result<TableState> {
        execute_with_retry("reset_table", || async {
            let mut tx = self.begin_write().await?;
            let mut state = load_table_state(&mut tx, queue, table)
                .await?
                .ok_or_else(|| ReplicationError::UnknownTable {
                    queue: queue.to_string(),
                    table: table.to_string(),
                })?;
            state.reset();
            clear_pending(&mut tx, queue, table).await?;
            store_table_state(&mut tx, &state).await?;
            tx.commit().await?;
            Ok(state)
        })
        .await
    }

    /// Claim a NEW table for copying (NEW → IN_COPY).
    pub async fn begin_copy(&self, queue: &str, table: &str) -> Result<TableState> {
        execute_with_retry("begin_copy", || async {
            let mut tx = self.begin_write().await?;
            let mut state = load_table_state(&mut tx, queue, table)
                .await?
                .ok_or_else(|| ReplicationError::UnknownTable {
                    queue: queue.to_string(),
                    table: table.to_string(),
                })?;
            state.begin_copy()?;
            store_table_state(&mut tx, &state).await?;
            tx.commit().await?;
            Ok(state)
        })
        .await
    }

    /// Record a failed copy attempt (IN_COPY → NEW, or failed once exhausted).
    pub async fn record_copy_failure(
        &self,
        queue: &str,
        table: &str,
        message: &str,
        max_attempts: u32,
    ) -> Result<Option<TableState>> {
        execute_with_retry("record_copy_failure", || async {
            let mut tx = self.begin_write().await?;
            let Some(mut state) = load_table_state(&mut tx, queue, table).await? else {
                return Ok(None);
            };
            if state.state != TableSyncState::InCopy {
                return Ok(Some(state));
            }
            state.copy_failed(message, max_attempts);
            clear_pending(&mut tx, queue, table).await?;
            store_table_state(&mut tx, &state).await?;
            tx.commit().await?;
            Ok(Some(state))
        })
        .await
    }

    /// Hand a claimed table back to NEW without counting an attempt.
    ///
    /// Used when the copy source is not ready to serve the table yet.
    pub async fn release_copy(&self, queue: &str, table: &str) -> Result<Option<TableState>> {
        execute_with_retry("release_copy", || async {
            let mut tx = self.begin_write().await?;
            let Some(mut state) = load_table_state(&mut tx, queue, table).await? else {
                return Ok(None);
            };
            if state.state != TableSyncState::InCopy {
                return Ok(Some(state));
            }
            state.release_copy();
            clear_pending(&mut tx, queue, table).await?;
            store_table_state(&mut tx, &state).await?;
            tx.commit().await?;
            Ok(Some(state))
        })
        .await
    }

    /// Number of events buffered for a table in copy.
    pub async fn pending_count(&self, queue: &str, table: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_event WHERE queue_name = ? AND table_name = ?",
        )
        .bind(queue)
        .bind(table)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Take over another consumer's position and table states.
    ///
    /// Tables the previous owner was still copying restart from NEW: their
    /// snapshot and copy buffer live in the previous owner's store.
    pub async fn adopt_handoff(&self, queue: &str, last_tick: i64, tables: &[TableState]) -> Result<()> {
        execute_with_retry("adopt_handoff", || async {
            let mut tx = self.begin_write().await?;
            write_position(&mut tx, queue, last_tick).await?;
            for table in tables {
                let mut state = table.clone();
                state.queue = queue.to_string();
                if !state.failed
                    && matches!(state.state, TableSyncState::InCopy | TableSyncState::CatchingUp)
                {
                    state.reset();
                }
                clear_pending(&mut tx, queue, &state.name).await?;
                store_table_state(&mut tx, &state).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await?;
            Ok(())
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "Local store closed");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transaction-level helpers
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) async fn read_position(conn: &mut SqliteConnection, queue: &str) -> Result<Option<i64>> {
    Ok(
        sqlx::query_scalar("SELECT last_tick FROM consumer_position WHERE queue_name = ?")
            .bind(queue)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub(crate) async fn write_position(conn: &mut SqliteConnection, queue: &str, tick_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO consumer_position (queue_name, last_tick, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(queue_name) DO UPDATE SET
             last_tick = excluded.last_tick,
             updated_at = excluded.updated_at",
    )
    .bind(queue)
    .bind(tick_id)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn table_state_from_row(row: &SqliteRow) -> Result<TableState> {
    let state: String = row.try_get("state")?;
    let copy_attempts: i64 = row.try_get("copy_attempts")?;
    Ok(TableState {
        queue: row.try_get("queue_name")?,
        name: row.try_get("table_name")?,
        handler: row.try_get("handler")?,
        options: TableOptions {
            dest_table: row.try_get("dest_table")?,
            skip_truncate: row.try_get("skip_truncate")?,
            ignore_truncate: row.try_get("ignore_truncate")?,
        },
        state: state.parse()?,
        sync_tick_id: row.try_get("sync_tick_id")?,
        copy_attempts: u32::try_from(copy_attempts).unwrap_or(u32::MAX),
        failed: row.try_get("failed")?,
        last_error: row.try_get("last_error")?,
    })
}

pub(crate) async fn load_table_state(
    conn: &mut SqliteConnection,
    queue: &str,
    table: &str,
) -> Result<Option<TableState>> {
    let row = sqlx::query("SELECT * FROM table_state WHERE queue_name = ? AND table_name = ?")
        .bind(queue)
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(table_state_from_row).transpose()
}

pub(crate) async fn load_table_states(conn: &mut SqliteConnection, queue: &str) -> Result<Vec<TableState>> {
    let rows = sqlx::query("SELECT * FROM table_state WHERE queue_name = ? ORDER BY table_name")
        .bind(queue)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(table_state_from_row).collect()
}

pub(crate) async fn store_table_state(conn: &mut SqliteConnection, state: &TableState) -> Result<()> {
    sqlx::query(
        "INSERT INTO table_state (
             queue_name, table_name, handler, dest_table, skip_truncate, ignore_truncate,
             state, sync_tick_id, copy_attempts, failed, last_error, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(queue_name, table_name) DO UPDATE SET
             handler = excluded.handler,
             dest_table = excluded.dest_table,
             skip_truncate = excluded.skip_truncate,
             ignore_truncate = excluded.ignore_truncate,
             state = excluded.state,
             sync_tick_id = excluded.sync_tick_id,
             copy_attempts = excluded.copy_attempts,
             failed = excluded.failed,
             last_error = excluded.last_error,
             updated_at = excluded.updated_at",
    )
    .bind(&state.queue)
    .bind(&state.name)
    .bind(&state.handler)
    .bind(&state.options.dest_table)
    .bind(state.options.skip_truncate)
    .bind(state.options.ignore_truncate)
    .bind(state.state.as_str())
    .bind(state.sync_tick_id)
    .bind(i64::from(state.copy_attempts))
    .bind(state.failed)
    .bind(&state.last_error)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Hold an event for a table that is being copied.
pub(crate) async fn buffer_event(conn: &mut SqliteConnection, queue: &str, event: &Event) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO pending_event (queue_name, table_name, tick_id, event_id, payload)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(queue)
    .bind(&event.table)
    .bind(event.tick_id)
    .bind(event.event_id)
    .bind(serde_json::to_string(event)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Remove and return a table's buffered events in `(tick, event)` order.
pub(crate) async fn take_pending(conn: &mut SqliteConnection, queue: &str, table: &str) -> Result<Vec<Event>> {
    let payloads: Vec<String> = sqlx::query_scalar(
        "SELECT payload FROM pending_event WHERE queue_name = ? AND table_name = ?
         ORDER BY tick_id, event_id",
    )
    .bind(queue)
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;
    clear_pending(conn, queue, table).await?;
    payloads
        .iter()
        .map(|p| serde_json::from_str(p).map_err(ReplicationError::from))
        .collect()
}

pub(crate) async fn clear_pending(conn: &mut SqliteConnection, queue: &str, table: &str) -> Result<()> {
    sqlx::query("DELETE FROM pending_event WHERE queue_name = ? AND table_name = ?")
        .bind(queue)
        .bind(table)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record an EXECUTE by name. Returns false if it already ran.
///
/// Names are unique per node: a script delivered by several queues runs once.
pub(crate) async fn record_execute(conn: &mut SqliteConnection, queue: &str, name: &str) -> Result<bool> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO execute_log (queue_name, name, executed_at) VALUES (?, ?, ?)",
    )
    .bind(queue)
    .bind(name)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(inserted > 0)
}

/// Whether an EXECUTE with this name already ran on this node.
pub(crate) async fn execute_seen(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    let seen: Option<i64> = sqlx::query_scalar("SELECT 1 FROM execute_log WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(seen.is_some())
}

/// Tables and views of the main schema, name to type.
pub(crate) async fn schema_objects(conn: &mut SqliteConnection) -> Result<HashMap<String, String>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT name, type FROM sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Serialize an event's row for queue storage.
pub(crate) fn encode_row(event: &Event) -> Result<String> {
    Ok(serde_json::to_string(&event.row)?)
}

pub(crate) fn decode_op(code: &str) -> Result<Op> {
    Op::from_code(code).ok_or_else(|| ReplicationError::Internal(format!("unknown event op: {}", code)))
}
