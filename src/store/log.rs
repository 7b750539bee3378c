//! Queue storage: captured events, ticks and the consumer registry.
//!
//! A node that provides a queue (a root, or a branch re-emitting what it
//! applied) keeps the queue in its own store. Events are written with no
//! tick; `tick` closes the open set into the next batch.
//!
//! ```text
//! capture ──► queue_event (tick NULL) ──tick()──► queue_event (tick T) + queue_tick T
//!                                                         │
//!                                  next_batch(after T-1) ◄┘
//! ```

use super::{
    apply_op, decode_op, encode_row, execute_seen, execute_with_retry, load_table_info,
    load_table_state, now_ms, read_position, record_execute, require_table_info, schema_objects,
    select_rows, LocalStore,
};
use crate::error::{ReplicationError, Result};
use crate::event::{Batch, Event, Op, Row};
use crate::exec_attrs::{ExecAttrs, ExecContext};
use crate::handler::Handler;
use crate::queue::{ConsumerInfo, Handoff, ReassignOutcome};
use crate::source::TableSnapshot;
use crate::store::TableInfo;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqliteConnection};
use std::collections::HashMap;
use tracing::{debug, info};

async fn insert_event(
    conn: &mut SqliteConnection,
    queue: &str,
    event: &Event,
    tick_id: Option<i64>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO queue_event (queue_name, tick_id, op, table_name, row_data, sql_text, retry_count)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(queue)
    .bind(tick_id)
    .bind(event.op.code())
    .bind(&event.table)
    .bind(encode_row(event)?)
    .bind(&event.sql)
    .bind(i64::from(event.retry_count))
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

fn event_from_row(row: &SqliteRow) -> Result<Event> {
    let op: String = row.try_get("op")?;
    let row_data: String = row.try_get("row_data")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(Event {
        event_id: row.try_get("event_id")?,
        tick_id: row.try_get("tick_id")?,
        op: decode_op(&op)?,
        table: row.try_get("table_name")?,
        row: serde_json::from_str::<Row>(&row_data)?,
        sql: row.try_get("sql_text")?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
    })
}

async fn head_tick_on(conn: &mut SqliteConnection, queue: &str) -> Result<Option<i64>> {
    Ok(
        sqlx::query_scalar("SELECT MAX(tick_id) FROM queue_tick WHERE queue_name = ?")
            .bind(queue)
            .fetch_one(&mut *conn)
            .await?,
    )
}

/// Close the open event set of `queue` into a new tick.
///
/// Returns the new tick, or `None` when nothing was waiting.
pub(crate) async fn tick_pending(conn: &mut SqliteConnection, queue: &str) -> Result<Option<i64>> {
    let waiting: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM queue_event WHERE queue_name = ? AND tick_id IS NULL",
    )
    .bind(queue)
    .fetch_one(&mut *conn)
    .await?;
    if waiting == 0 {
        return Ok(None);
    }
    Ok(Some(new_tick(conn, queue).await?))
}

async fn new_tick(conn: &mut SqliteConnection, queue: &str) -> Result<i64> {
    let tick_id = head_tick_on(conn, queue).await?.unwrap_or(0) + 1;
    sqlx::query("INSERT INTO queue_tick (queue_name, tick_id, created_at) VALUES (?, ?, ?)")
        .bind(queue)
        .bind(tick_id)
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE queue_event SET tick_id = ? WHERE queue_name = ? AND tick_id IS NULL")
        .bind(tick_id)
        .bind(queue)
        .execute(&mut *conn)
        .await?;
    Ok(tick_id)
}

/// Re-emit an applied batch into the local copy of `queue` under the same tick.
pub(crate) async fn emit_batch(conn: &mut SqliteConnection, queue: &str, batch: &Batch) -> Result<()> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO queue_tick (queue_name, tick_id, created_at) VALUES (?, ?, ?)",
    )
    .bind(queue)
    .bind(batch.tick_id)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if inserted == 0 {
        return Ok(());
    }
    for event in &batch.events {
        insert_event(conn, queue, event, Some(batch.tick_id)).await?;
    }
    Ok(())
}

/// The statement a root runs for an EXECUTE, or None if its attributes
/// rule it out. The root holds every table under its own name.
async fn root_execute_sql(conn: &mut SqliteConnection, event: &Event) -> Result<Option<String>> {
    let Some(sql) = event.sql.as_deref() else {
        return Ok(None);
    };
    let attrs = ExecAttrs::parse(&event.table, sql)?;
    if attrs.is_empty() {
        return Ok(Some(sql.to_string()));
    }
    let schema = schema_objects(conn).await?;
    let local: HashMap<String, String> = schema
        .iter()
        .filter(|(_, kind)| kind.as_str() == "table")
        .map(|(name, _)| (name.clone(), name.clone()))
        .collect();
    let ctx = ExecContext {
        local: &local,
        schema: &schema,
    };
    Ok(attrs
        .need_execute(&event.table, &ctx)?
        .then(|| attrs.rewrite(sql, &ctx)))
}

fn consumer_from_row(row: &SqliteRow) -> Result<ConsumerInfo> {
    let handoff: Option<String> = row.try_get("handoff")?;
    Ok(ConsumerInfo {
        queue: row.try_get("queue_name")?,
        consumer: row.try_get("consumer")?,
        group: row.try_get("group_name")?,
        last_tick: row.try_get("last_tick")?,
        active: row.try_get("active")?,
        pause_requested: row.try_get("pause_requested")?,
        paused: row.try_get("paused")?,
        handoff: handoff
            .map(|h| serde_json::from_str::<Handoff>(&h))
            .transpose()?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn load_consumer(
    conn: &mut SqliteConnection,
    queue: &str,
    consumer: &str,
) -> Result<Option<ConsumerInfo>> {
    let row = sqlx::query("SELECT * FROM queue_consumer WHERE queue_name = ? AND consumer = ?")
        .bind(queue)
        .bind(consumer)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(consumer_from_row).transpose()
}

async fn require_consumer(conn: &mut SqliteConnection, queue: &str, consumer: &str) -> Result<ConsumerInfo> {
    load_consumer(conn, queue, consumer)
        .await?
        .ok_or_else(|| ReplicationError::UnknownConsumer {
            queue: queue.to_string(),
            consumer: consumer.to_string(),
        })
}

async fn store_consumer(conn: &mut SqliteConnection, info: &ConsumerInfo) -> Result<()> {
    let handoff = info.handoff.as_ref().map(serde_json::to_string).transpose()?;
    sqlx::query(
        "INSERT INTO queue_consumer (
             queue_name, consumer, group_name, last_tick, active, pause_requested, paused, handoff,
             updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(queue_name, consumer) DO UPDATE SET
             last_tick = excluded.last_tick,
             active = excluded.active,
             pause_requested = excluded.pause_requested,
             paused = excluded.paused,
             handoff = excluded.handoff,
             updated_at = excluded.updated_at",
    )
    .bind(&info.queue)
    .bind(&info.consumer)
    .bind(&info.group)
    .bind(info.last_tick)
    .bind(info.active)
    .bind(info.pause_requested)
    .bind(info.paused)
    .bind(handoff)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Like [`store_consumer`], but keeps `updated_at`: the demoted owner
/// must still read as silent.
async fn store_dead_consumer(conn: &mut SqliteConnection, info: &ConsumerInfo) -> Result<()> {
    sqlx::query(
        "UPDATE queue_consumer SET active = ?, pause_requested = ?, paused = ?, handoff = NULL
         WHERE queue_name = ? AND consumer = ?",
    )
    .bind(info.active)
    .bind(info.pause_requested)
    .bind(info.paused)
    .bind(&info.queue)
    .bind(&info.consumer)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Drop what every active consumer of `queue` has acked.
///
/// The lowest acked tick itself stays in `queue_tick`: the next batch
/// names it as its `prev_tick_id`. Standby members follow their group's
/// owner, so only active consumers hold rotation back.
async fn rotate(conn: &mut SqliteConnection, queue: &str) -> Result<()> {
    let floor: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(last_tick) FROM queue_consumer WHERE queue_name = ? AND active = 1",
    )
    .bind(queue)
    .fetch_one(&mut *conn)
    .await?;
    let Some(floor) = floor else {
        return Ok(());
    };
    let events = sqlx::query("DELETE FROM queue_event WHERE queue_name = ? AND tick_id <= ?")
        .bind(queue)
        .bind(floor)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    let ticks = sqlx::query("DELETE FROM queue_tick WHERE queue_name = ? AND tick_id < ?")
        .bind(queue)
        .bind(floor)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if events > 0 || ticks > 0 {
        debug!(queue, floor, events, ticks, "Rotated queue");
    }
    Ok(())
}

impl LocalStore {
    // ═══════════════════════════════════════════════════════════════════════════
    // Events and ticks
    // ═══════════════════════════════════════════════════════════════════════════

    /// Append events to `queue` without touching local tables.
    pub async fn enqueue(&self, queue: &str, events: &[Event]) -> Result<Vec<i64>> {
        execute_with_retry("enqueue", || async {
            let mut tx = self.begin_write().await?;
            let mut ids = Vec::with_capacity(events.len());
            for event in events {
                ids.push(insert_event(&mut tx, queue, event, None).await?);
            }
            tx.commit().await?;
            Ok(ids)
        })
        .await
    }

    /// Apply row changes to local tables and queue them, in one transaction.
    ///
    /// This is the capture side of a root: the queued events are exactly
    /// the changes that committed. An EXECUTE runs once per script name;
    /// a repeat is still queued, and every consumer skips it by name.
    pub async fn capture(&self, queue: &str, events: &[Event]) -> Result<Vec<i64>> {
        execute_with_retry("capture", || async {
            let mut tx = self.begin_write().await?;
            let mut tables: HashMap<String, TableInfo> = HashMap::new();
            let mut ids = Vec::with_capacity(events.len());
            for event in events {
                if event.op == Op::Execute {
                    if execute_seen(&mut tx, &event.table).await? {
                        debug!(queue, script = %event.table, "EXECUTE already ran on root");
                    } else {
                        if let Some(sql) = root_execute_sql(&mut tx, event).await? {
                            sqlx::Executor::execute(&mut *tx, sql.as_str()).await?;
                        } else {
                            debug!(queue, script = %event.table, "EXECUTE not needed on root");
                        }
                        record_execute(&mut tx, queue, &event.table).await?;
                        tables.clear();
                    }
                } else {
                    if !tables.contains_key(&event.table) {
                        let info = require_table_info(&mut tx, &event.table).await?;
                        tables.insert(event.table.clone(), info);
                    }
                    if let Some(info) = tables.get(&event.table) {
                        if let Some(op) = Handler::Passthrough.transform(event, info)? {
                            apply_op(&mut tx, info, &op).await?;
                        }
                    }
                }
                ids.push(insert_event(&mut tx, queue, event, None).await?);
            }
            tx.commit().await?;
            Ok(ids)
        })
        .await
    }

    /// Close the open event set into a new tick, even if it is empty.
    pub async fn tick(&self, queue: &str) -> Result<i64> {
        let tick_id = execute_with_retry("tick", || async {
            let mut tx = self.begin_write().await?;
            let tick_id = new_tick(&mut tx, queue).await?;
            tx.commit().await?;
            Ok(tick_id)
        })
        .await?;
        debug!(queue, tick_id, "Ticked queue");
        Ok(tick_id)
    }

    /// Tick only if events are waiting.
    pub async fn tick_if_pending(&self, queue: &str) -> Result<Option<i64>> {
        execute_with_retry("tick_if_pending", || async {
            let mut tx = self.begin_write().await?;
            let tick_id = tick_pending(&mut tx, queue).await?;
            tx.commit().await?;
            Ok(tick_id)
        })
        .await
    }

    /// Latest tick of `queue`, `None` if it never ticked.
    pub async fn head_tick(&self, queue: &str) -> Result<Option<i64>> {
        let mut conn = self.pool().acquire().await?;
        head_tick_on(&mut conn, queue).await
    }

    /// The batch of the first tick after `after_tick`.
    pub async fn next_batch(&self, queue: &str, after_tick: i64) -> Result<Option<Batch>> {
        let mut tx = self.pool().begin().await?;
        let tick_id: Option<i64> =
            sqlx::query_scalar("SELECT MIN(tick_id) FROM queue_tick WHERE queue_name = ? AND tick_id > ?")
                .bind(queue)
                .bind(after_tick)
                .fetch_one(&mut *tx)
                .await?;
        let Some(tick_id) = tick_id else {
            return Ok(None);
        };
        let prev_tick_id: Option<i64> =
            sqlx::query_scalar("SELECT MAX(tick_id) FROM queue_tick WHERE queue_name = ? AND tick_id < ?")
                .bind(queue)
                .bind(tick_id)
                .fetch_one(&mut *tx)
                .await?;
        let rows = sqlx::query(
            "SELECT event_id, tick_id, op, table_name, row_data, sql_text, retry_count
             FROM queue_event WHERE queue_name = ? AND tick_id = ? ORDER BY event_id",
        )
        .bind(queue)
        .bind(tick_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let events = rows.iter().map(event_from_row).collect::<Result<Vec<_>>>()?;
        Ok(Some(Batch::new(tick_id, prev_tick_id.unwrap_or(0), tick_id, events)))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Consumer registry
    // ═══════════════════════════════════════════════════════════════════════════

    /// Register `consumer` in `group` on `queue`. Idempotent.
    ///
    /// A new consumer starts at `start_tick` or the queue head, and is the
    /// active one only if no other member of its group is.
    pub async fn register_consumer(
        &self,
        queue: &str,
        consumer: &str,
        group: &str,
        start_tick: Option<i64>,
    ) -> Result<ConsumerInfo> {
        execute_with_retry("register_consumer", || async {
            let mut tx = self.begin_write().await?;
            if let Some(existing) = load_consumer(&mut tx, queue, consumer).await? {
                return Ok(existing);
            }
            let last_tick = match start_tick {
                Some(tick) => tick,
                None => head_tick_on(&mut tx, queue).await?.unwrap_or(0),
            };
            let someone_active: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM queue_consumer
                 WHERE queue_name = ? AND group_name = ? AND active = 1 LIMIT 1",
            )
            .bind(queue)
            .bind(group)
            .fetch_optional(&mut *tx)
            .await?;
            let info = ConsumerInfo {
                queue: queue.to_string(),
                consumer: consumer.to_string(),
                group: group.to_string(),
                last_tick,
                active: someone_active.is_none(),
                pause_requested: false,
                paused: false,
                handoff: None,
                updated_at: now_ms(),
            };
            store_consumer(&mut tx, &info).await?;
            tx.commit().await?;
            info!(queue, consumer, group, last_tick, active = info.active, "Registered consumer");
            Ok(info)
        })
        .await
    }

    pub async fn unregister_consumer(&self, queue: &str, consumer: &str) -> Result<bool> {
        execute_with_retry("unregister_consumer", || async {
            let removed = sqlx::query("DELETE FROM queue_consumer WHERE queue_name = ? AND consumer = ?")
                .bind(queue)
                .bind(consumer)
                .execute(self.pool())
                .await?
                .rows_affected();
            Ok(removed > 0)
        })
        .await
    }

    pub async fn consumer_info(&self, queue: &str, consumer: &str) -> Result<Option<ConsumerInfo>> {
        let mut conn = self.pool().acquire().await?;
        load_consumer(&mut conn, queue, consumer).await
    }

    pub async fn consumers(&self, queue: &str) -> Result<Vec<ConsumerInfo>> {
        let rows = sqlx::query("SELECT * FROM queue_consumer WHERE queue_name = ? ORDER BY consumer")
            .bind(queue)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(consumer_from_row).collect()
    }

    /// Record that `consumer` finished `tick_id`. Only the active consumer may ack.
    ///
    /// Every ack refreshes `updated_at`, so an ack of the current tick is a
    /// heartbeat. Ticks every active consumer has acked are rotated out.
    pub async fn ack(&self, queue: &str, consumer: &str, tick_id: i64) -> Result<()> {
        execute_with_retry("ack", || async {
            let mut tx = self.begin_write().await?;
            let mut info = require_consumer(&mut tx, queue, consumer).await?;
            if !info.active {
                return Err(ReplicationError::NotOwner {
                    queue: queue.to_string(),
                    consumer: consumer.to_string(),
                });
            }
            info.last_tick = info.last_tick.max(tick_id);
            store_consumer(&mut tx, &info).await?;
            rotate(&mut tx, queue).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn request_pause(&self, queue: &str, consumer: &str) -> Result<()> {
        self.update_consumer("request_pause", queue, consumer, |info| {
            info.pause_requested = true;
            Ok(())
        })
        .await
    }

    /// Clear any pause request and handoff.
    pub async fn resume(&self, queue: &str, consumer: &str) -> Result<()> {
        self.update_consumer("resume", queue, consumer, |info| {
            info.pause_requested = false;
            info.paused = false;
            info.handoff = None;
            Ok(())
        })
        .await
    }

    /// Acknowledge a pause request and publish the handoff.
    pub async fn confirm_pause(&self, queue: &str, consumer: &str, handoff: &Handoff) -> Result<()> {
        self.update_consumer("confirm_pause", queue, consumer, |info| {
            if !info.pause_requested {
                return Err(ReplicationError::InvalidState {
                    expected: format!("pause requested for {}", info.consumer),
                    actual: "no pause request".to_string(),
                });
            }
            info.paused = true;
            info.last_tick = info.last_tick.max(handoff.last_tick);
            info.handoff = Some(handoff.clone());
            Ok(())
        })
        .await
    }

    async fn update_consumer<F>(&self, operation: &str, queue: &str, consumer: &str, f: F) -> Result<()>
    where
        F: Fn(&mut ConsumerInfo) -> Result<()>,
    {
        execute_with_retry(operation, || async {
            let mut tx = self.begin_write().await?;
            let mut info = require_consumer(&mut tx, queue, consumer).await?;
            f(&mut info)?;
            store_consumer(&mut tx, &info).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Move queue ownership from a paused `from` to `to`, atomically.
    pub async fn reassign_consumer(&self, queue: &str, from: &str, to: &str) -> Result<ReassignOutcome> {
        execute_with_retry("reassign_consumer", || async {
            let mut tx = self.begin_write().await?;
            let mut target = require_consumer(&mut tx, queue, to).await?;
            let mut source = require_consumer(&mut tx, queue, from).await?;
            if target.group != source.group {
                return Err(ReplicationError::Topology(format!(
                    "{} (group {}) cannot take over from {} (group {})",
                    to, target.group, from, source.group
                )));
            }

            if target.active && !source.active {
                return Ok(ReassignOutcome::AlreadyAssigned);
            }
            if !source.active {
                return Err(ReplicationError::NotOwner {
                    queue: queue.to_string(),
                    consumer: from.to_string(),
                });
            }
            let handoff = match source.handoff.clone() {
                Some(handoff) if source.paused => handoff,
                _ => {
                    return Err(ReplicationError::InvalidState {
                        expected: format!("{} paused with handoff", from),
                        actual: format!(
                            "pause_requested={} paused={}",
                            source.pause_requested, source.paused
                        ),
                    });
                }
            };

            source.active = false;
            target.active = true;
            target.last_tick = handoff.last_tick;
            target.pause_requested = false;
            target.paused = false;
            target.handoff = None;
            store_consumer(&mut tx, &source).await?;
            store_consumer(&mut tx, &target).await?;
            tx.commit().await?;
            info!(queue, from, to, last_tick = handoff.last_tick, "Reassigned queue consumer");
            Ok(ReassignOutcome::Reassigned { handoff })
        })
        .await
    }

    /// Move ownership away from an owner silent since before `silent_before`
    /// (epoch millis), without its cooperation.
    ///
    /// The successor continues from the owner's last ack. A handoff the
    /// owner published before dying is passed on; otherwise the handoff
    /// carries no table states.
    pub async fn reassign_dead_consumer(
        &self,
        queue: &str,
        from: &str,
        to: &str,
        silent_before: i64,
    ) -> Result<ReassignOutcome> {
        execute_with_retry("reassign_dead_consumer", || async {
            let mut tx = self.begin_write().await?;
            let mut target = require_consumer(&mut tx, queue, to).await?;
            let mut source = require_consumer(&mut tx, queue, from).await?;
            if target.group != source.group {
                return Err(ReplicationError::Topology(format!(
                    "{} (group {}) cannot take over from {} (group {})",
                    to, target.group, from, source.group
                )));
            }
            if target.active && !source.active {
                return Ok(ReassignOutcome::AlreadyAssigned);
            }
            if !source.active {
                return Err(ReplicationError::NotOwner {
                    queue: queue.to_string(),
                    consumer: from.to_string(),
                });
            }
            if source.updated_at >= silent_before {
                return Err(ReplicationError::InvalidState {
                    expected: format!("{} silent since before {}", from, silent_before),
                    actual: format!("last seen at {}", source.updated_at),
                });
            }

            let handoff = match source.handoff.take() {
                Some(handoff) if source.paused => handoff,
                _ => Handoff {
                    last_tick: source.last_tick,
                    tables: Vec::new(),
                },
            };
            source.active = false;
            source.pause_requested = false;
            source.paused = false;
            target.active = true;
            target.last_tick = handoff.last_tick;
            target.pause_requested = false;
            target.paused = false;
            target.handoff = None;
            store_dead_consumer(&mut tx, &source).await?;
            store_consumer(&mut tx, &target).await?;
            tx.commit().await?;
            info!(queue, from, to, last_tick = handoff.last_tick, "Reassigned queue from dead consumer");
            Ok(ReassignOutcome::Reassigned { handoff })
        })
        .await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Snapshot export
    // ═══════════════════════════════════════════════════════════════════════════

    /// Export `table` of a queue-providing root.
    ///
    /// Waiting events are ticked in the same transaction, so the snapshot
    /// holds exactly the changes of ticks `<= tick_id`.
    pub async fn export_root(&self, queue: &str, table: &str) -> Result<TableSnapshot> {
        execute_with_retry("export_root", || async {
            let mut tx = self.begin_write().await?;
            tick_pending(&mut tx, queue).await?;
            let tick_id = head_tick_on(&mut tx, queue).await?.unwrap_or(0);
            let info = require_table_info(&mut tx, table).await?;
            let rows = select_rows(&mut tx, &info).await?;
            tx.commit().await?;
            Ok(TableSnapshot {
                table: table.to_string(),
                columns: info.columns,
                pkey: info.pkey,
                rows,
                tick_id,
            })
        })
        .await
    }

    /// Export `table` of a replica that consumes `queue`.
    ///
    /// The snapshot boundary is the replica's own position. `None` while
    /// the replica itself is still syncing the table.
    pub async fn export_replica(&self, queue: &str, table: &str) -> Result<Option<TableSnapshot>> {
        let mut tx = self.pool().begin().await?;
        let state = load_table_state(&mut tx, queue, table)
            .await?
            .ok_or_else(|| ReplicationError::UnknownTable {
                queue: queue.to_string(),
                table: table.to_string(),
            })?;
        if !state.is_ok() {
            return Ok(None);
        }
        let tick_id = read_position(&mut tx, queue).await?.unwrap_or(0);
        let info = load_table_info(&mut tx, state.dest_table())
            .await?
            .ok_or_else(|| ReplicationError::handler(table, "table does not exist on provider"))?;
        let rows = select_rows(&mut tx, &info).await?;
        tx.commit().await?;
        Ok(Some(TableSnapshot {
            table: table.to_string(),
            columns: info.columns,
            pkey: info.pkey,
            rows,
            tick_id,
        }))
    }
}
