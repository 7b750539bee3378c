// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-table synchronization state machine.
//!
//! # State Transitions
//!
//! ```text
//!   register()            begin_copy()            finish_copy(tick)
//! ────────────► NEW ──────────────────► IN_COPY ──────────────────► CATCHING_UP
//!                ▲                         │                             │
//!                │   copy_failed()         │        mark_caught_up(pos)  │
//!                └─────────────────────────┘        (pos >= sync_tick)   ▼
//!                ▲                                                       OK
//!                └──────────────── reset() (resync / re-register) ───────┘
//! ```
//!
//! # Routing
//!
//! | State | Event tick | Decision |
//! |-------|-----------|----------|
//! | NEW | any | Skip (not subscribed yet) |
//! | IN_COPY | any | Buffer (replayed after the copy) |
//! | CATCHING_UP | `<= sync_tick` | Skip (already in the snapshot) |
//! | CATCHING_UP | `> sync_tick` | Apply |
//! | OK | any | Apply |
//! | failed | any | Skip (frozen until resync) |

use crate::error::{ReplicationError, Result};
use crate::handler::Handler;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a replicated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableSyncState {
    New,
    InCopy,
    CatchingUp,
    Ok,
}

impl TableSyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InCopy => "in-copy",
            Self::CatchingUp => "catching-up",
            Self::Ok => "ok",
        }
    }
}

impl std::fmt::Display for TableSyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TableSyncState {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(Self::New),
            "in-copy" => Ok(Self::InCopy),
            "catching-up" => Ok(Self::CatchingUp),
            "ok" => Ok(Self::Ok),
            other => Err(ReplicationError::Internal(format!("unknown table state: {}", other))),
        }
    }
}

/// What the playback loop does with an event for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Skip,
    Buffer,
    Apply,
}

/// Registration options of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    /// Local table to apply into, when it differs from the source name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_table: Option<String>,
    /// Bulk copy appends instead of emptying the table first.
    #[serde(default)]
    pub skip_truncate: bool,
    /// Drop TRUNCATE events for this table.
    #[serde(default)]
    pub ignore_truncate: bool,
}

/// Persisted sync state of one (queue, table) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableState {
    pub queue: String,
    /// Source table name, as it appears in events.
    pub name: String,
    /// Handler specification string.
    pub handler: String,
    #[serde(default)]
    pub options: TableOptions,
    pub state: TableSyncState,
    /// Tick boundary of the loaded snapshot.
    pub sync_tick_id: Option<i64>,
    #[serde(default)]
    pub copy_attempts: u32,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl TableState {
    /// A freshly registered table.
    pub fn register(queue: &str, name: &str, handler: &str, options: TableOptions) -> Result<Self> {
        Handler::parse(handler)?;
        Ok(Self {
            queue: queue.to_string(),
            name: name.to_string(),
            handler: handler.trim().to_string(),
            options,
            state: TableSyncState::New,
            sync_tick_id: None,
            copy_attempts: 0,
            failed: false,
            last_error: None,
        })
    }

    /// Local table events are applied into.
    pub fn dest_table(&self) -> &str {
        self.options.dest_table.as_deref().unwrap_or(&self.name)
    }

    pub fn handler(&self) -> Result<Handler> {
        Handler::parse(&self.handler)
    }

    pub fn is_ok(&self) -> bool {
        self.state == TableSyncState::Ok && !self.failed
    }

    /// Whether a copy worker may claim the table.
    pub fn is_copy_candidate(&self) -> bool {
        self.state == TableSyncState::New && !self.failed
    }

    pub fn route(&self, tick_id: i64) -> Route {
        if self.failed {
            return Route::Skip;
        }
        match self.state {
            TableSyncState::New => Route::Skip,
            TableSyncState::InCopy => Route::Buffer,
            TableSyncState::CatchingUp => match self.sync_tick_id {
                Some(sync) if tick_id <= sync => Route::Skip,
                _ => Route::Apply,
            },
            TableSyncState::Ok => Route::Apply,
        }
    }

    /// NEW → IN_COPY.
    pub fn begin_copy(&mut self) -> Result<()> {
        if !self.is_copy_candidate() {
            return Err(ReplicationError::InvalidState {
                expected: format!("{} {}", self.name, TableSyncState::New),
                actual: self.describe(),
            });
        }
        self.state = TableSyncState::InCopy;
        Ok(())
    }

    /// IN_COPY → CATCHING_UP with the snapshot's tick boundary.
    pub fn finish_copy(&mut self, sync_tick_id: i64) -> Result<()> {
        if self.state != TableSyncState::InCopy || self.failed {
            return Err(ReplicationError::InvalidState {
                expected: format!("{} {}", self.name, TableSyncState::InCopy),
                actual: self.describe(),
            });
        }
        self.state = TableSyncState::CatchingUp;
        self.sync_tick_id = Some(sync_tick_id);
        self.copy_attempts = 0;
        self.last_error = None;
        Ok(())
    }

    /// CATCHING_UP → OK once the consumer position reaches the snapshot.
    /// Returns whether the table was promoted.
    pub fn mark_caught_up(&mut self, position: i64) -> bool {
        if self.failed || self.state != TableSyncState::CatchingUp {
            return false;
        }
        match self.sync_tick_id {
            Some(sync) if position < sync => false,
            _ => {
                self.state = TableSyncState::Ok;
                true
            }
        }
    }

    /// IN_COPY → NEW after a failed copy; freezes the table when attempts run out.
    pub fn copy_failed(&mut self, message: &str, max_attempts: u32) {
        self.state = TableSyncState::New;
        self.sync_tick_id = None;
        self.copy_attempts = self.copy_attempts.saturating_add(1);
        self.last_error = Some(message.to_string());
        if self.copy_attempts >= max_attempts {
            self.failed = true;
        }
    }

    /// IN_COPY → NEW without counting an attempt.
    pub fn release_copy(&mut self) {
        if self.state == TableSyncState::InCopy {
            self.state = TableSyncState::New;
        }
    }

    /// Freeze the table after a fatal apply or handler error.
    pub fn fail(&mut self, message: &str) {
        self.failed = true;
        self.last_error = Some(message.to_string());
    }

    /// Back to NEW with a clean slate (resync or re-registration).
    pub fn reset(&mut self) {
        self.state = TableSyncState::New;
        self.sync_tick_id = None;
        self.copy_attempts = 0;
        self.failed = false;
        self.last_error = None;
    }

    fn describe(&self) -> String {
        if self.failed {
            format!("{} {} (failed)", self.name, self.state)
        } else {
            format!("{} {}", self.name, self.state)
        }
    }
}
