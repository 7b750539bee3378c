//! Circuit breakers on the playback loop's queue-service calls.
//!
//! An unreachable queue backend should cost one fast failure per cycle,
//! not a connect timeout per cycle. Only transient errors count against a
//! breaker: a `NotOwner` or a position mismatch is an answer from a healthy
//! backend. Built on `recloser`.
//!
//! ```rust,no_run
//! # use cascade_replication::circuit_breaker::QueueCircuit;
//! # async fn example() -> cascade_replication::Result<()> {
//! let circuit = QueueCircuit::new();
//! let head = circuit
//!     .fetch("orders", || async { Ok(Some(42i64)) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Breaker state, inferred from call outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a breaker trips and how it recovers.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Recent calls judged while closed.
    pub window: u32,
    /// Failed share of the window that opens the breaker.
    pub error_rate: f32,
    /// Calls let through half-open before deciding.
    pub trial_calls: u32,
    /// Time spent open before the half-open trial.
    pub recovery: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window: 5,
            error_rate: 0.5,
            trial_calls: 2,
            recovery: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// For acks: a short window, a longer and more careful recovery.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            window: 3,
            error_rate: 0.5,
            trial_calls: 3,
            recovery: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn testing() -> Self {
        Self {
            window: 2,
            error_rate: 0.5,
            trial_calls: 1,
            recovery: Duration::from_millis(50),
        }
    }
}

/// One named breaker with outcome counters.
pub struct QueueBreaker {
    name: &'static str,
    inner: AsyncRecloser,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl QueueBreaker {
    pub fn new(name: &'static str, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(config.window.max(1) as usize)
            .half_open_len(config.trial_calls.max(1) as usize)
            .open_wait(config.recovery)
            .build();
        Self {
            name,
            inner: recloser.into(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `f` for `queue`; a rejected call becomes a transient queue error.
    pub async fn call<F, Fut, T>(&self, queue: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let before = self.state();
        let outcome = self
            .inner
            .call_with(|e: &ReplicationError| e.is_retryable(), f())
            .await;
        let result = match outcome {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(self.name, "rejected");
                debug!(circuit = self.name, queue, "Call rejected by open circuit");
                Err(ReplicationError::Queue {
                    queue: queue.to_string(),
                    message: format!("{} circuit open", self.name),
                })
            }
            Err(RecloserError::Inner(e)) => {
                if e.is_retryable() {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    metrics::record_circuit_call(self.name, "failure");
                }
                Err(e)
            }
        };

        let after = self.state();
        if after != before {
            metrics::set_circuit_state(self.name, after.as_str());
            if after == CircuitState::Open {
                warn!(circuit = self.name, queue, "Circuit opened");
            }
        }
        result
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// recloser keeps its state private; guess it from the counters.
    pub fn state(&self) -> CircuitState {
        let rejections = self.rejections();
        if rejections == 0 {
            CircuitState::Closed
        } else if rejections > self.successes() {
            CircuitState::Open
        } else {
            CircuitState::HalfOpen
        }
    }
}

/// The fetch and ack breakers shared by every playback loop of an engine.
pub struct QueueCircuit {
    pub fetch: QueueBreaker,
    pub ack: QueueBreaker,
}

impl Default for QueueCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueCircuit {
    pub fn new() -> Self {
        Self::with_configs(CircuitConfig::default(), CircuitConfig::aggressive())
    }

    pub fn with_configs(fetch: CircuitConfig, ack: CircuitConfig) -> Self {
        Self {
            fetch: QueueBreaker::new("queue_fetch", fetch),
            ack: QueueBreaker::new("queue_ack", ack),
        }
    }

    pub async fn fetch<F, Fut, T>(&self, queue: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.fetch.call(queue, f).await
    }

    pub async fn ack<F, Fut>(&self, queue: &str, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.ack.call(queue, f).await
    }

    pub fn any_open(&self) -> bool {
        self.fetch.state() == CircuitState::Open || self.ack.state() == CircuitState::Open
    }
}
