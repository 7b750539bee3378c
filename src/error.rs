// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the playback engine.
//!
//! Every error carries a [`ErrorScope`] describing how far its damage
//! reaches. The playback loop uses the scope to decide whether to retry,
//! freeze a single table, halt a queue, or reject an operator request.
//!
//! # Error Categories
//!
//! | Error Type | Scope | Description |
//! |------------|-------|-------------|
//! | `Redis` | Transient | Queue backend unreachable, timeouts |
//! | `Queue` | Transient | Queue service temporarily unavailable |
//! | `Store` | Transient if busy, else Process | Local SQLite errors |
//! | `Handler` | Table | Transform failed (missing shard key, bad row) |
//! | `CopyFailed` | Table | Bulk copy gave up after bounded retries |
//! | `TableFailed` | Table | Table is frozen, waiting for resync |
//! | `PositionMismatch` | Queue | Batch does not follow our position |
//! | `NotOwner` | Queue | Consumer lost ownership of the queue |
//! | `Execute` | Queue | Passthrough statement failed |
//! | `Topology` | Queue | Inconsistent node/queue relationships |
//! | `StaleSubscriber` | Protocol | Takeover target too far behind |
//! | `UnknownConsumer` | Protocol | Takeover on unregistered consumer |
//! | `UnknownTable` | Protocol | Table not registered on this node |
//! | `Config` | Process | Configuration invalid |

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// How far the effect of an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Retry the failed operation with backoff; nothing durable moved.
    Transient,
    /// Freeze one table; the rest of the queue keeps going.
    Table,
    /// Halt the playback loop of one queue.
    Queue,
    /// Reject an operator request; no state was mutated.
    Protocol,
    /// Surface to the caller; the node cannot make progress.
    Process,
}

impl std::fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Table => write!(f, "table"),
            Self::Queue => write!(f, "queue"),
            Self::Protocol => write!(f, "protocol"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Redis connection or command error from the streams queue backend.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Local SQLite error.
    ///
    /// Busy/locked errors are transient; anything else needs attention.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Event or handoff payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue service temporarily unavailable (circuit open, timeout).
    #[error("Queue error ({queue}): {message}")]
    Queue { queue: String, message: String },

    /// A handler could not transform a row of this table.
    #[error("Handler error on {table}: {message}")]
    Handler { table: String, message: String },

    /// Bulk copy of a table gave up.
    #[error("Copy of {table} failed after {attempts} attempts: {message}")]
    CopyFailed {
        table: String,
        attempts: u32,
        message: String,
    },

    /// Table is frozen in a failed state.
    #[error("Table {table} is failed: {message}")]
    TableFailed { table: String, message: String },

    /// The fetched batch does not continue from our position.
    #[error("Position mismatch on {queue}: expected prev tick {expected}, got {actual}")]
    PositionMismatch {
        queue: String,
        expected: i64,
        actual: i64,
    },

    /// Consumer is not the active owner of the queue.
    #[error("Consumer {consumer} does not own queue {queue}")]
    NotOwner { queue: String, consumer: String },

    /// A passthrough statement failed.
    #[error("Execute of {name} failed: {message}")]
    Execute { name: String, message: String },

    /// Node or queue relationships are inconsistent.
    #[error("Topology error: {0}")]
    Topology(String),

    /// Takeover target is too far behind the current owner.
    #[error("Stale subscriber {consumer} on {queue}: {lag_ticks} ticks behind (max {max_lag_ticks})")]
    StaleSubscriber {
        queue: String,
        consumer: String,
        lag_ticks: i64,
        max_lag_ticks: i64,
    },

    /// Consumer is not registered on the queue.
    #[error("Consumer {consumer} is not registered on queue {queue}")]
    UnknownConsumer { queue: String, consumer: String },

    /// Table is not registered on the queue.
    #[error("Table {table} is not registered on queue {queue}")]
    UnknownTable { queue: String, table: String },

    /// Operation did not finish in time.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn handler(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Scope of the error.
    pub fn scope(&self) -> ErrorScope {
        match self {
            Self::Redis { .. } | Self::Queue { .. } | Self::Timeout(_) => ErrorScope::Transient,
            Self::Store(e) if crate::store::is_sqlite_busy_error(e) => ErrorScope::Transient,
            Self::Handler { .. } | Self::CopyFailed { .. } | Self::TableFailed { .. } => {
                ErrorScope::Table
            }
            Self::PositionMismatch { .. }
            | Self::NotOwner { .. }
            | Self::Execute { .. }
            | Self::Topology(_) => ErrorScope::Queue,
            Self::StaleSubscriber { .. }
            | Self::UnknownConsumer { .. }
            | Self::UnknownTable { .. }
            | Self::InvalidState { .. } => ErrorScope::Protocol,
            Self::Store(_)
            | Self::Serialization(_)
            | Self::Config(_)
            | Self::Shutdown
            | Self::Internal(_) => ErrorScope::Process,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.scope() == ErrorScope::Transient
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}
