//! Takeover: move a queue's consumption from another consumer to this node.
//!
//! ```text
//!  this node (B)                queue service                 owner (A)
//!  ─────────────                ─────────────                 ─────────
//!  check lag, registration
//!  hold own cycle lock
//!  request_pause(A) ─────────►  pause_requested = true
//!                                                  ◄───────── next cycle sees it,
//!                                                             confirm_pause(handoff)
//!  poll consumer_info(A) ◄────  paused + handoff
//!  reassign_consumer(A, B) ──►  A inactive, B active
//!  adopt handoff locally
//!  release cycle lock → playback continues as owner
//! ```
//!
//! Nothing is mutated before the pause request. Once the pause is
//! requested, a failure resumes A before returning.
//!
//! A crashed owner never confirms. [`run_dead_takeover`] skips the
//! handshake once A has been silent for `takeover.dead_after`: the queue
//! service demotes A and B continues from A's last ack, keeping its own
//! table states unless A had already published a handoff.

use super::types::QueueRole;
use super::{EngineContext, QueueLink};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::queue::{ConsumerInfo, Handoff, ReassignOutcome};
use crate::store::now_ms;
use serde::Serialize;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

/// Result of a successful takeover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TakeoverOutcome {
    /// Ownership moved; this node continues after `last_tick`.
    Reassigned { last_tick: i64 },
    /// This node already owned the queue.
    AlreadyOwner,
}

pub(crate) async fn run_takeover(ctx: &EngineContext, queue: &str, from: &str) -> Result<TakeoverOutcome> {
    let span = info_span!("takeover", queue = %queue, from = %from);
    async {
        let started = Instant::now();
        let result = takeover(ctx, queue, from).await;
        record_outcome(queue, "reassigned", &result, started);
        result
    }
    .instrument(span)
    .await
}

/// Take over from an owner that stopped acking, without its cooperation.
pub(crate) async fn run_dead_takeover(ctx: &EngineContext, queue: &str, from: &str) -> Result<TakeoverOutcome> {
    let span = info_span!("dead_takeover", queue = %queue, from = %from);
    async {
        let started = Instant::now();
        let result = dead_takeover(ctx, queue, from).await;
        record_outcome(queue, "forced", &result, started);
        result
    }
    .instrument(span)
    .await
}

fn record_outcome(queue: &str, moved: &str, result: &Result<TakeoverOutcome>, started: Instant) {
    let outcome = match result {
        Ok(TakeoverOutcome::Reassigned { .. }) => moved,
        Ok(TakeoverOutcome::AlreadyOwner) => "noop",
        Err(ReplicationError::Timeout(_)) => "timeout",
        Err(e) if e.scope() == crate::error::ErrorScope::Protocol => "rejected",
        Err(_) => "error",
    };
    metrics::record_takeover(queue, outcome, started.elapsed());
    match result {
        Ok(o) => info!(outcome = ?o, elapsed_ms = started.elapsed().as_millis() as u64, "Takeover finished"),
        Err(e) => warn!(error = %e, "Takeover failed"),
    }
}

async fn takeover(ctx: &EngineContext, queue: &str, from: &str) -> Result<TakeoverOutcome> {
    let link = ctx
        .link(queue)
        .ok_or_else(|| ReplicationError::Topology(format!("{} does not consume queue {}", ctx.config.node.node_name, queue)))?;
    let me = ctx.config.node.consumer_name();
    if from == me {
        return Err(ReplicationError::InvalidState {
            expected: "takeover from another consumer".to_string(),
            actual: format!("{} is this node", from),
        });
    }

    let target = require_consumer(&link, queue, me).await?;
    let source = require_consumer(&link, queue, from).await?;
    if source.group != target.group {
        return Err(ReplicationError::Topology(format!(
            "{} (group {}) cannot take over from {} (group {})",
            me, target.group, from, source.group
        )));
    }
    if target.active {
        if !source.active {
            return Ok(TakeoverOutcome::AlreadyOwner);
        }
        return Err(ReplicationError::InvalidState {
            expected: format!("{} inactive", me),
            actual: format!("{} and {} both active", me, from),
        });
    }

    let local = ctx.store.position(queue).await?.unwrap_or(target.last_tick);
    check_lag(ctx, queue, me, source.last_tick, local)?;

    // Our own loop must not run a cycle between the pause and the adoption.
    let lock = ctx.cycle_lock(queue);
    let _cycle = lock.lock().await;

    link.service.request_pause(queue, from).await?;
    info!(owner_tick = source.last_tick, local_position = local, "Pause requested");

    let handoff = match wait_for_pause(ctx, &link, queue, from).await {
        Ok(handoff) => handoff,
        Err(e) => {
            resume_quietly(&link, queue, from).await;
            return Err(e);
        }
    };

    let local = ctx.store.position(queue).await?.unwrap_or(target.last_tick);
    if let Err(e) = check_lag(ctx, queue, me, handoff.last_tick, local) {
        resume_quietly(&link, queue, from).await;
        return Err(e);
    }

    match link.service.reassign_consumer(queue, from, me).await {
        Ok(ReassignOutcome::Reassigned { handoff }) => {
            if let Err(e) = ctx.store.adopt_handoff(queue, handoff.last_tick, &handoff.tables).await {
                // Ownership already moved; our local state cannot follow it.
                error!(error = %e, last_tick = handoff.last_tick, "Could not adopt handoff");
                ctx.halt(queue, &e);
                return Err(e);
            }
            ctx.set_role(queue, QueueRole::Active);
            Ok(TakeoverOutcome::Reassigned {
                last_tick: handoff.last_tick,
            })
        }
        Ok(ReassignOutcome::AlreadyAssigned) => {
            resume_quietly(&link, queue, from).await;
            Ok(TakeoverOutcome::AlreadyOwner)
        }
        Err(e) => {
            resume_quietly(&link, queue, from).await;
            Err(e)
        }
    }
}

async fn dead_takeover(ctx: &EngineContext, queue: &str, from: &str) -> Result<TakeoverOutcome> {
    let link = ctx
        .link(queue)
        .ok_or_else(|| ReplicationError::Topology(format!("{} does not consume queue {}", ctx.config.node.node_name, queue)))?;
    let me = ctx.config.node.consumer_name();
    if from == me {
        return Err(ReplicationError::InvalidState {
            expected: "takeover from another consumer".to_string(),
            actual: format!("{} is this node", from),
        });
    }

    let target = require_consumer(&link, queue, me).await?;
    let source = require_consumer(&link, queue, from).await?;
    if source.group != target.group {
        return Err(ReplicationError::Topology(format!(
            "{} (group {}) cannot take over from {} (group {})",
            me, target.group, from, source.group
        )));
    }
    if target.active && !source.active {
        return Ok(TakeoverOutcome::AlreadyOwner);
    }

    let dead_after = ctx.config.takeover.dead_after_duration();
    let silent_before = now_ms() - dead_after.as_millis() as i64;
    if source.updated_at >= silent_before {
        return Err(ReplicationError::InvalidState {
            expected: format!("{} silent for {:?}", from, dead_after),
            actual: format!("last seen {}ms ago", now_ms() - source.updated_at),
        });
    }

    let local = ctx.store.position(queue).await?.unwrap_or(target.last_tick);
    check_lag(ctx, queue, me, source.last_tick, local)?;

    let lock = ctx.cycle_lock(queue);
    let _cycle = lock.lock().await;

    match link.service.reassign_dead_consumer(queue, from, me, silent_before).await? {
        ReassignOutcome::Reassigned { handoff } => {
            if handoff.tables.is_empty() {
                info!(last_tick = handoff.last_tick, "No handoff from dead owner; keeping local table states");
            }
            if let Err(e) = ctx.store.adopt_handoff(queue, handoff.last_tick, &handoff.tables).await {
                error!(error = %e, last_tick = handoff.last_tick, "Could not adopt dead owner's position");
                ctx.halt(queue, &e);
                return Err(e);
            }
            ctx.set_role(queue, QueueRole::Active);
            Ok(TakeoverOutcome::Reassigned {
                last_tick: handoff.last_tick,
            })
        }
        ReassignOutcome::AlreadyAssigned => Ok(TakeoverOutcome::AlreadyOwner),
    }
}

async fn require_consumer(link: &QueueLink, queue: &str, consumer: &str) -> Result<ConsumerInfo> {
    link.service
        .consumer_info(queue, consumer)
        .await?
        .ok_or_else(|| ReplicationError::UnknownConsumer {
            queue: queue.to_string(),
            consumer: consumer.to_string(),
        })
}

fn check_lag(ctx: &EngineContext, queue: &str, me: &str, owner_tick: i64, local: i64) -> Result<()> {
    let lag_ticks = owner_tick - local;
    let max_lag_ticks = ctx.config.takeover.max_lag_ticks;
    if lag_ticks > max_lag_ticks {
        return Err(ReplicationError::StaleSubscriber {
            queue: queue.to_string(),
            consumer: me.to_string(),
            lag_ticks,
            max_lag_ticks,
        });
    }
    Ok(())
}

/// Poll the owner until it confirms the pause, within `pause_timeout`.
async fn wait_for_pause(ctx: &EngineContext, link: &QueueLink, queue: &str, from: &str) -> Result<Handoff> {
    let timeout = ctx.config.takeover.pause_timeout_duration();
    let poll = ctx.config.playback.poll_min_duration();
    let deadline = Instant::now() + timeout;

    loop {
        let info = require_consumer(link, queue, from).await?;
        if !info.active {
            return Err(ReplicationError::NotOwner {
                queue: queue.to_string(),
                consumer: from.to_string(),
            });
        }
        if info.paused {
            if let Some(handoff) = info.handoff {
                info!(handoff_tick = handoff.last_tick, tables = handoff.tables.len(), "Owner paused");
                return Ok(handoff);
            }
        }
        if Instant::now() >= deadline {
            return Err(ReplicationError::Timeout(format!(
                "{} to confirm pause on {} after {:?}",
                from, queue, timeout
            )));
        }
        tokio::time::sleep(poll).await;
    }
}

async fn resume_quietly(link: &QueueLink, queue: &str, from: &str) {
    if let Err(e) = link.service.resume(queue, from).await {
        warn!(error = %e, "Could not resume previous owner");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serializes_kebab_case() {
        let json = serde_json::to_value(TakeoverOutcome::AlreadyOwner).unwrap();
        assert_eq!(json, serde_json::json!("already-owner"));

        let json = serde_json::to_value(TakeoverOutcome::Reassigned { last_tick: 7 }).unwrap();
        assert_eq!(json["reassigned"]["last_tick"], 7);
    }
}
