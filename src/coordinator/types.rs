//! Engine state and status types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (consumers registered, tasks spawned)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ──(topology or registration error)──→ Failed
//! ```
//!
//! - **Created**: after `ReplicationEngine::new()`. No tasks running.
//! - **Starting**: validating the topology and registering consumers.
//! - **Running**: playback loops, copy dispatcher and ticker are live.
//! - **ShuttingDown**: draining tasks between batches.
//! - **Stopped**: clean shutdown. Safe to drop.
//! - **Failed**: `start()` could not bring the node up.

use crate::sync_state::{TableState, TableSyncState};
use crate::topology::NodeType;
use serde::Serialize;

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Call [`start()`](super::ReplicationEngine::start) to begin replication.
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    /// Check logs for error details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// What a queue's playback loop is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueRole {
    /// Loop not started yet.
    Pending,
    /// Active owner, applying batches.
    Active,
    /// Registered but another consumer owns the queue.
    Standby,
    /// Pause confirmed; waiting to be reassigned or resumed.
    Paused,
    /// Stopped on a queue-fatal error.
    Halted,
}

impl std::fmt::Display for QueueRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueRole::Pending => write!(f, "pending"),
            QueueRole::Active => write!(f, "active"),
            QueueRole::Standby => write!(f, "standby"),
            QueueRole::Paused => write!(f, "paused"),
            QueueRole::Halted => write!(f, "halted"),
        }
    }
}

/// In-memory view of a playback loop, shared with `status()`.
#[derive(Debug, Clone)]
pub(crate) struct QueueRuntime {
    pub role: QueueRole,
    pub head: Option<i64>,
    pub halted_error: Option<String>,
}

impl Default for QueueRuntime {
    fn default() -> Self {
        Self {
            role: QueueRole::Pending,
            head: None,
            halted_error: None,
        }
    }
}

/// Sync state of one table as reported by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStatus {
    pub name: String,
    pub dest_table: String,
    pub handler: String,
    pub state: TableSyncState,
    pub failed: bool,
    pub last_error: Option<String>,
    pub sync_tick_id: Option<i64>,
    pub copy_attempts: u32,
    /// Events buffered while the table is being copied.
    pub pending_events: i64,
}

impl TableStatus {
    pub(crate) fn from_state(state: &TableState, pending_events: i64) -> Self {
        Self {
            name: state.name.clone(),
            dest_table: state.dest_table().to_string(),
            handler: state.handler.clone(),
            state: state.state,
            failed: state.failed,
            last_error: state.last_error.clone(),
            sync_tick_id: state.sync_tick_id,
            copy_attempts: state.copy_attempts,
            pending_events,
        }
    }
}

/// One consumed queue as reported by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub queue: String,
    /// Queue service backend (`local`, `redis`).
    pub backend: String,
    pub role: QueueRole,
    /// Last applied tick.
    pub position: Option<i64>,
    /// Latest tick seen on the provider.
    pub head: Option<i64>,
    /// Error that halted the playback loop.
    pub halted_error: Option<String>,
    pub tables: Vec<TableStatus>,
}

impl QueueStatus {
    pub fn lag_ticks(&self) -> Option<i64> {
        match (self.head, self.position) {
            (Some(head), Some(position)) => Some((head - position).max(0)),
            _ => None,
        }
    }

    /// Every table is OK and the loop is not halted.
    pub fn is_synced(&self) -> bool {
        self.halted_error.is_none() && self.tables.iter().all(|t| t.state == TableSyncState::Ok && !t.failed)
    }
}

/// Snapshot of a node returned by `ReplicationEngine::status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub node_name: String,
    pub node_type: NodeType,
    pub state: EngineState,
    pub queues: Vec<QueueStatus>,
}

impl NodeStatus {
    pub fn queue(&self, name: &str) -> Option<&QueueStatus> {
        self.queues.iter().find(|q| q.queue == name)
    }

    pub fn table(&self, queue: &str, table: &str) -> Option<&TableStatus> {
        self.queue(queue)?.tables.iter().find(|t| t.name == table)
    }

    pub fn failed_tables(&self) -> Vec<(&str, &TableStatus)> {
        self.queues
            .iter()
            .flat_map(|q| q.tables.iter().filter(|t| t.failed).map(move |t| (q.queue.as_str(), t)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_state::TableOptions;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_queue_role_display() {
        assert_eq!(QueueRole::Standby.to_string(), "standby");
        assert_eq!(QueueRole::Halted.to_string(), "halted");
    }

    fn queue_status(tables: Vec<TableStatus>) -> QueueStatus {
        QueueStatus {
            queue: "q".to_string(),
            backend: "local".to_string(),
            role: QueueRole::Active,
            position: Some(4),
            head: Some(7),
            halted_error: None,
            tables,
        }
    }

    #[test]
    fn test_queue_status_sync_and_lag() {
        let mut state = TableState::register("q", "users", "passthrough", TableOptions::default()).unwrap();
        let status = queue_status(vec![TableStatus::from_state(&state, 0)]);
        assert!(!status.is_synced());
        assert_eq!(status.lag_ticks(), Some(3));

        state.state = TableSyncState::Ok;
        let mut status = queue_status(vec![TableStatus::from_state(&state, 0)]);
        assert!(status.is_synced());

        status.halted_error = Some("position mismatch".to_string());
        assert!(!status.is_synced());
    }

    #[test]
    fn test_node_status_lookup() {
        let mut state = TableState::register("q", "users", "passthrough", TableOptions::default()).unwrap();
        state.fail("missing shard key");
        let node = NodeStatus {
            node_name: "leaf-1".to_string(),
            node_type: NodeType::Leaf,
            state: EngineState::Running,
            queues: vec![queue_status(vec![TableStatus::from_state(&state, 2)])],
        };

        let table = node.table("q", "users").unwrap();
        assert!(table.failed);
        assert_eq!(table.pending_events, 2);
        assert!(node.table("q", "missing").is_none());
        assert_eq!(node.failed_tables().len(), 1);
    }
}
