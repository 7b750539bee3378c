//! Snapshot sources for bulk copy.
//!
//! A [`CopySource`] answers "give me table X as of some tick". The tick is
//! the contract: every event with `tick_id <= snapshot.tick_id` is in the
//! rows, none after it is.

use crate::event::Row;
use crate::queue::BoxFuture;
use crate::store::LocalStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Consistent image of one provider table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table: String,
    pub columns: Vec<String>,
    pub pkey: Vec<String>,
    pub rows: Vec<Row>,
    /// Last tick reflected in `rows`.
    pub tick_id: i64,
}

impl TableSnapshot {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Provider of table snapshots.
pub trait CopySource: Send + Sync {
    /// Snapshot of `table`, or `None` if the provider cannot serve it yet.
    fn export<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Option<TableSnapshot>>;
}

/// How a provider store relates to the queue it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    /// Captures and ticks the queue itself.
    Root,
    /// Re-emits a queue it consumes; snapshots are bounded by its position.
    Replica,
}

/// [`CopySource`] reading a provider's [`LocalStore`].
pub struct StoreSource {
    store: Arc<LocalStore>,
    queue: String,
    role: SourceRole,
}

impl StoreSource {
    pub fn root(store: Arc<LocalStore>, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
            role: SourceRole::Root,
        }
    }

    pub fn replica(store: Arc<LocalStore>, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
            role: SourceRole::Replica,
        }
    }

    pub fn role(&self) -> SourceRole {
        self.role
    }
}

impl CopySource for StoreSource {
    fn export<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Option<TableSnapshot>> {
        Box::pin(async move {
            match self.role {
                SourceRole::Root => self.store.export_root(&self.queue, table).await.map(Some),
                SourceRole::Replica => self.store.export_replica(&self.queue, table).await,
            }
        })
    }
}
