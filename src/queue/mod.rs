// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue service interface.
//!
//! A queue service hands out tick-bounded batches to registered consumers
//! and coordinates ownership changes between them. The playback loop only
//! talks to this trait, so a provider can be a local SQLite store
//! ([`LocalQueue`]) or a Redis deployment ([`RedisQueue`]).
//!
//! # Ownership
//!
//! Consumers belong to a group (the node's worker name). Independent
//! nodes sit in groups of their own and consume side by side; within a
//! group at most one consumer is *active*, and only it may ack.
//! Ownership moves between group members with a pause handshake:
//!
//! ```text
//!  takeover driver            owner A                   queue
//!  ───────────────            ───────                   ─────
//!  request_pause(A) ──────────────────────────────────► pause_requested
//!                            sees request, stops applying
//!                            confirm_pause(A, handoff) ► paused + handoff
//!  reassign(A → B) ───────────────────────────────────► A inactive, B active
//! ```
//!
//! An owner that stopped acking (acks double as heartbeats) can be
//! replaced without the handshake via `reassign_dead_consumer`.

mod local;
mod redis_streams;

pub use self::local::LocalQueue;
pub use self::redis_streams::{RedisQueue, RedisQueueConfig};

use crate::error::Result;
use crate::event::Batch;
use crate::sync_state::TableState;
use serde::{Deserialize, Serialize};

/// Boxed, `Send` future resolving to a crate [`Result`].
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, Result<T>>;

/// State handed from a pausing owner to its successor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    /// Last tick the owner fully applied.
    pub last_tick: i64,
    /// Table sync states at that tick.
    pub tables: Vec<TableState>,
}

/// A consumer's registration on a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub queue: String,
    pub consumer: String,
    /// At most one consumer per group is active.
    #[serde(default)]
    pub group: String,
    /// Last acknowledged tick.
    pub last_tick: i64,
    /// Whether this consumer owns the queue.
    pub active: bool,
    pub pause_requested: bool,
    pub paused: bool,
    /// Published by the owner when it confirms a pause.
    #[serde(default)]
    pub handoff: Option<Handoff>,
    /// Epoch millis of the last change.
    pub updated_at: i64,
}

/// Result of a reassignment.
#[derive(Debug, Clone, PartialEq)]
pub enum ReassignOutcome {
    /// Ownership moved; the successor continues from the handoff.
    Reassigned { handoff: Handoff },
    /// The target already owns the queue.
    AlreadyAssigned,
}

/// Batch delivery and consumer coordination for one or more queues.
pub trait QueueService: Send + Sync {
    /// Short backend name for logs and status.
    fn name(&self) -> &str;

    /// The batch of the first tick after `after_tick`, if any.
    fn next_batch<'a>(&'a self, queue: &'a str, after_tick: i64) -> BoxFuture<'a, Option<Batch>>;

    /// Acknowledge `tick_id`. Lower ticks than the current one are ignored.
    fn ack<'a>(&'a self, queue: &'a str, consumer: &'a str, tick_id: i64) -> BoxFuture<'a, ()>;

    /// Register `consumer` in `group`; idempotent. Starts at `start_tick`
    /// or the head, and is active only if no group member is.
    fn register_consumer<'a>(
        &'a self,
        queue: &'a str,
        consumer: &'a str,
        group: &'a str,
        start_tick: Option<i64>,
    ) -> BoxFuture<'a, ConsumerInfo>;

    fn unregister_consumer<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, bool>;

    fn consumer_info<'a>(&'a self, queue: &'a str, consumer: &'a str)
        -> BoxFuture<'a, Option<ConsumerInfo>>;

    fn consumers<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Vec<ConsumerInfo>>;

    /// Latest tick of the queue.
    fn head_tick<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Option<i64>>;

    /// Ask the owner to stop applying and publish a handoff.
    fn request_pause<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, ()>;

    /// Clear a pause request.
    fn resume<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, ()>;

    /// Owner side of the pause handshake.
    fn confirm_pause<'a>(
        &'a self,
        queue: &'a str,
        consumer: &'a str,
        handoff: &'a Handoff,
    ) -> BoxFuture<'a, ()>;

    /// Atomically move ownership from a paused `from` to `to`.
    fn reassign_consumer<'a>(
        &'a self,
        queue: &'a str,
        from: &'a str,
        to: &'a str,
    ) -> BoxFuture<'a, ReassignOutcome>;

    /// Atomically move ownership from `from` to `to` without a pause, provided
    /// `from` has not been heard from since `silent_before` (epoch millis).
    ///
    /// `to` continues from `from`'s last ack. The returned handoff has no
    /// table states unless `from` had published one.
    fn reassign_dead_consumer<'a>(
        &'a self,
        queue: &'a str,
        from: &'a str,
        to: &'a str,
        silent_before: i64,
    ) -> BoxFuture<'a, ReassignOutcome>;
}
