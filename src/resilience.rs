//! Connect retries, event throttling and copy lanes.
//!
//! - [`RetryConfig`]: backoff schedule for queue-backend connects
//! - [`EventThrottle`]: caps how many events per second playback applies
//! - [`CopyLane`]: bounds how many table copies run side by side
//!
//! ```rust,no_run
//! # async fn example() {
//! use cascade_replication::resilience::{CopyLane, EventThrottle};
//!
//! // At most 500 events/sec, bursts of 50
//! let throttle = EventThrottle::new(500, 50);
//! throttle.admit(120).await;
//!
//! let lane = CopyLane::parallel(4);
//! if let Some(_slot) = lane.enter().await {
//!     // copy one table; the slot frees on drop
//! }
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Backoff schedule for connecting to a queue backend.
///
/// The default gives up after roughly a minute so a wrong URL fails
/// `start()` instead of hanging it.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before giving up, the first one included.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Bound on each attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Pause after failed attempt `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether another attempt follows failed attempt `attempt`.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

// =============================================================================
// Event throttle
// =============================================================================

/// Token bucket in events: `per_sec` sustained, `burst` at once.
pub struct EventThrottle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    burst: NonZeroU32,
}

impl EventThrottle {
    pub fn new(per_sec: u32, burst: u32) -> Self {
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(NonZeroU32::new(per_sec).unwrap_or(NonZeroU32::MIN)).allow_burst(burst);
        Self {
            limiter: RateLimiter::direct(quota),
            burst,
        }
    }

    /// Wait until `events` more events may be applied.
    ///
    /// Batches larger than the burst are admitted burst by burst.
    pub async fn admit(&self, events: usize) {
        let mut remaining = events;
        while remaining > 0 {
            let chunk = remaining.min(self.burst.get() as usize);
            let Some(n) = NonZeroU32::new(chunk as u32) else {
                return;
            };
            // chunk never exceeds the burst, so capacity always suffices.
            if self.limiter.until_n_ready(n).await.is_err() {
                return;
            }
            remaining -= chunk;
        }
    }

    pub fn burst(&self) -> u32 {
        self.burst.get()
    }
}

// =============================================================================
// Copy lanes
// =============================================================================

/// A fixed number of copy slots.
///
/// Tables matching the parallel globs share a worker pool; everything else
/// goes through a single-slot lane and is copied one table at a time.
#[derive(Debug, Clone)]
pub struct CopyLane {
    slots: Arc<Semaphore>,
    size: usize,
}

impl CopyLane {
    /// Pool of `workers` slots, at least one.
    pub fn parallel(workers: usize) -> Self {
        let size = workers.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn sequential() -> Self {
        Self::parallel(1)
    }

    /// Wait for a slot; `None` once the lane is closed.
    pub async fn enter(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).acquire_owned().await.ok()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Turn away every waiting and future `enter`.
    pub fn close(&self) {
        self.slots.close();
    }
}
