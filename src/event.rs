// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Captured row changes and the tick-bounded batches that carry them.
//!
//! # Ordering
//!
//! Events are ordered by `(tick_id, event_id)`. A batch holds the events
//! of exactly one tick, in capture order, and names the tick before it so
//! the consumer can prove there is no gap:
//!
//! ```text
//! position = 7 ──► next_batch(after 7) ──► Batch { prev_tick_id: 7, tick_id: 8 }
//!                                                   ▲ must equal position
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered column → value mapping.
pub type Row = Map<String, Value>;

/// Kind of captured change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "I")]
    Insert,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
    /// Table truncate.
    #[serde(rename = "R")]
    Truncate,
    /// Raw statement passthrough.
    #[serde(rename = "EXECUTE")]
    Execute,
}

impl Op {
    /// Short code used in queue storage.
    pub fn code(&self) -> &'static str {
        match self {
            Op::Insert => "I",
            Op::Update => "U",
            Op::Delete => "D",
            Op::Truncate => "R",
            Op::Execute => "EXECUTE",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(Op::Insert),
            "U" => Some(Op::Update),
            "D" => Some(Op::Delete),
            "R" => Some(Op::Truncate),
            "EXECUTE" => Some(Op::Execute),
            _ => None,
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Insert => write!(f, "INSERT"),
            Op::Update => write!(f, "UPDATE"),
            Op::Delete => write!(f, "DELETE"),
            Op::Truncate => write!(f, "TRUNCATE"),
            Op::Execute => write!(f, "EXECUTE"),
        }
    }
}

/// One captured row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic ordinal within the queue.
    pub event_id: i64,
    /// Tick (batch boundary) the event belongs to.
    pub tick_id: i64,
    pub op: Op,
    /// Qualified table name, or the script name for `Execute`.
    pub table: String,
    /// Row image: new values for insert/update, key values for delete.
    #[serde(default)]
    pub row: Row,
    /// Statement text for `Execute`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Event {
    /// Row change for `table`. Ids are assigned by the queue.
    pub fn row_change(op: Op, table: impl Into<String>, row: Row) -> Self {
        Self {
            event_id: 0,
            tick_id: 0,
            op,
            table: table.into(),
            row,
            sql: None,
            retry_count: 0,
        }
    }

    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self::row_change(Op::Insert, table, row)
    }

    pub fn update(table: impl Into<String>, row: Row) -> Self {
        Self::row_change(Op::Update, table, row)
    }

    pub fn delete(table: impl Into<String>, key: Row) -> Self {
        Self::row_change(Op::Delete, table, key)
    }

    pub fn truncate(table: impl Into<String>) -> Self {
        Self::row_change(Op::Truncate, table, Row::new())
    }

    /// Statement passthrough; `name` de-duplicates repeated delivery.
    pub fn execute(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            sql: Some(sql.into()),
            ..Self::row_change(Op::Execute, name, Row::new())
        }
    }

    /// Ordering key within a queue.
    pub fn position(&self) -> (i64, i64) {
        (self.tick_id, self.event_id)
    }
}

/// A contiguous, tick-bounded group of events for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: i64,
    pub tick_id: i64,
    /// Tick this batch continues from.
    pub prev_tick_id: i64,
    pub events: Vec<Event>,
}

impl Batch {
    pub fn new(batch_id: i64, prev_tick_id: i64, tick_id: i64, events: Vec<Event>) -> Self {
        Self {
            batch_id,
            tick_id,
            prev_tick_id,
            events,
        }
    }

    pub fn first_event_id(&self) -> Option<i64> {
        self.events.first().map(|e| e.event_id)
    }

    pub fn last_event_id(&self) -> Option<i64> {
        self.events.last().map(|e| e.event_id)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check the batch continues `position` and its events are in order.
    pub fn follows(&self, position: i64) -> bool {
        self.prev_tick_id == position
            && self.tick_id > position
            && self.events.iter().all(|e| e.tick_id == self.tick_id)
            && self.events.windows(2).all(|w| w[0].event_id < w[1].event_id)
    }
}

/// Build a [`Row`] from `(column, value)` pairs, keeping their order.
pub fn row_of<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
