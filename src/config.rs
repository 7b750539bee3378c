//! Configuration for the playback engine.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use cascade_replication::config::EngineConfig;
//! use cascade_replication::topology::NodeType;
//!
//! let mut config = EngineConfig::for_testing("leaf-1");
//! config.node.node_type = NodeType::Leaf;
//! config.node.queue_name = "orders".into();
//! config.node.provider_node = Some("root".into());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── node: NodeInfo               # Role, queue, provider, merge set
//! ├── playback: PlaybackConfig     # Batch loop polling and EXECUTE policy
//! ├── copy: CopyConfig             # Bulk copy workers and retry policy
//! ├── takeover: TakeoverConfig     # Staleness bound, pause timeout, dead owner bound
//! ├── slo: SloConfig               # SLO thresholds
//! └── store: StoreConfig           # SQLite target database
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node:
//!   node_name: "leaf-eu-1"
//!   node_type: leaf
//!   queue_name: "orders"
//!   provider_node: "branch-eu"
//!   worker_name: "leaf-eu-1-worker"
//!
//! playback:
//!   poll_min: "100ms"
//!   poll_max: "5s"
//!
//! copy:
//!   workers: 4
//!   parallel_tables: ["public.order_*"]
//!
//! store:
//!   sqlite_path: "/var/lib/replica/leaf.db"
//! ```

use crate::topology::NodeInfo;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parse a humantime duration string, falling back on bad input.
fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from daemon to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// This node's role and queue relationships.
    pub node: NodeInfo,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub copy: CopyConfig,

    #[serde(default)]
    pub takeover: TakeoverConfig,

    #[serde(default)]
    pub slo: SloConfig,

    /// Target database settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node: NodeInfo::default(),
            playback: PlaybackConfig::default(),
            copy: CopyConfig::default(),
            takeover: TakeoverConfig::default(),
            slo: SloConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a fast-polling config for testing.
    pub fn for_testing(node_name: &str) -> Self {
        Self {
            node: NodeInfo::leaf(node_name, "testq", "root"),
            playback: PlaybackConfig {
                poll_min: "5ms".to_string(),
                poll_max: "50ms".to_string(),
                error_backoff_max: "200ms".to_string(),
                idle_poll: "10ms".to_string(),
                tick_interval: "10ms".to_string(),
                ..Default::default()
            },
            copy: CopyConfig {
                retry_backoff_base: "10ms".to_string(),
                retry_backoff_max: "100ms".to_string(),
                ..Default::default()
            },
            takeover: TakeoverConfig {
                pause_timeout: "5s".to_string(),
                dead_after: "200ms".to_string(),
                ..Default::default()
            },
            slo: SloConfig::default(),
            store: StoreConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PlaybackConfig: batch loop settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Playback loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// First sleep after an empty fetch (e.g. "100ms").
    #[serde(default = "default_poll_min")]
    pub poll_min: String,

    /// Ceiling for the empty-fetch backoff (e.g. "5s").
    #[serde(default = "default_poll_max")]
    pub poll_max: String,

    /// Ceiling for backoff after failed batch attempts.
    #[serde(default = "default_error_backoff_max")]
    pub error_backoff_max: String,

    /// Run EXECUTE events on merge-leaf nodes.
    ///
    /// Off by default: every provider of a merge-leaf delivers the same
    /// script, and running it once per provider duplicates DDL.
    #[serde(default = "default_false")]
    pub execute_on_merge: bool,

    /// Poll interval while the consumer is idle (standby or paused).
    #[serde(default = "default_idle_poll")]
    pub idle_poll: String,

    /// How often a root closes waiting events into a tick.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting for applied events.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum events per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_poll_min() -> String {
    "100ms".to_string()
}

fn default_poll_max() -> String {
    "5s".to_string()
}

fn default_error_backoff_max() -> String {
    "60s".to_string()
}

fn default_idle_poll() -> String {
    "500ms".to_string()
}

fn default_tick_interval() -> String {
    "1s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            poll_min: default_poll_min(),
            poll_max: default_poll_max(),
            error_backoff_max: default_error_backoff_max(),
            execute_on_merge: false,
            idle_poll: default_idle_poll(),
            tick_interval: default_tick_interval(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 10_000,
            rate_limit_burst: 1000,
        }
    }
}

impl PlaybackConfig {
    pub fn poll_min_duration(&self) -> Duration {
        parse_duration_or(&self.poll_min, Duration::from_millis(100))
    }

    pub fn poll_max_duration(&self) -> Duration {
        parse_duration_or(&self.poll_max, Duration::from_secs(5))
    }

    pub fn error_backoff_max_duration(&self) -> Duration {
        parse_duration_or(&self.error_backoff_max, Duration::from_secs(60))
    }

    pub fn idle_poll_duration(&self) -> Duration {
        parse_duration_or(&self.idle_poll, Duration::from_millis(500))
    }

    pub fn tick_interval_duration(&self) -> Duration {
        parse_duration_or(&self.tick_interval, Duration::from_secs(1))
    }

    /// Next empty-fetch sleep: double the current one, clamped to the bounds.
    pub fn next_poll_delay(&self, current: Duration) -> Duration {
        let min = self.poll_min_duration();
        let max = self.poll_max_duration();
        current.saturating_mul(2).clamp(min, max.max(min))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CopyConfig: bulk copy settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Bulk copy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Size of the parallel worker pool.
    #[serde(default = "default_copy_workers")]
    pub workers: usize,

    /// Glob patterns of tables copied in the parallel pool.
    /// Everything else is copied one table at a time.
    #[serde(default = "default_parallel_tables")]
    pub parallel_tables: Vec<String>,

    /// Maximum tables in IN_COPY at once.
    #[serde(default = "default_max_parallel_copies")]
    pub max_parallel_copies: usize,

    /// Failed attempts before a table is marked failed.
    #[serde(default = "default_max_copy_attempts")]
    pub max_copy_attempts: u32,

    /// Base delay before retrying a failed copy.
    #[serde(default = "default_retry_backoff_base")]
    pub retry_backoff_base: String,

    /// Maximum delay before retrying a failed copy.
    #[serde(default = "default_retry_backoff_max")]
    pub retry_backoff_max: String,

    /// Rows per INSERT chunk during copy.
    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: usize,
}

fn default_copy_workers() -> usize {
    4
}

fn default_parallel_tables() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_parallel_copies() -> usize {
    8
}

fn default_max_copy_attempts() -> u32 {
    5
}

fn default_retry_backoff_base() -> String {
    "1s".to_string()
}

fn default_retry_backoff_max() -> String {
    "5m".to_string()
}

fn default_chunk_rows() -> usize {
    500
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            parallel_tables: default_parallel_tables(),
            max_parallel_copies: 8,
            max_copy_attempts: 5,
            retry_backoff_base: default_retry_backoff_base(),
            retry_backoff_max: default_retry_backoff_max(),
            chunk_rows: 500,
        }
    }
}

impl CopyConfig {
    /// Calculate backoff duration for a given number of failed attempts.
    pub fn backoff_for_attempts(&self, attempts: u32) -> Duration {
        let base = parse_duration_or(&self.retry_backoff_base, Duration::from_secs(1));
        let max = parse_duration_or(&self.retry_backoff_max, Duration::from_secs(300));
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TakeoverConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Takeover protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeoverConfig {
    /// How many ticks the new owner's local position may trail the old
    /// owner's acknowledged tick. Ticks in that window must already be
    /// present in the new owner's data.
    #[serde(default)]
    pub max_lag_ticks: i64,

    /// How long to wait for the old owner to confirm its pause.
    #[serde(default = "default_pause_timeout")]
    pub pause_timeout: String,

    /// How long an owner must have been silent before a forced takeover
    /// may treat it as dead. Live owners refresh their registration on
    /// every poll.
    #[serde(default = "default_dead_after")]
    pub dead_after: String,
}

fn default_pause_timeout() -> String {
    "30s".to_string()
}

fn default_dead_after() -> String {
    "2m".to_string()
}

impl Default for TakeoverConfig {
    fn default() -> Self {
        Self {
            max_lag_ticks: 0,
            pause_timeout: default_pause_timeout(),
            dead_after: default_dead_after(),
        }
    }
}

impl TakeoverConfig {
    pub fn pause_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.pause_timeout, Duration::from_secs(30))
    }

    pub fn dead_after_duration(&self) -> Duration {
        parse_duration_or(&self.dead_after, Duration::from_secs(120))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig: Service Level Objectives for alerting
// ═══════════════════════════════════════════════════════════════════════════════

/// SLO thresholds for detecting performance degradation.
///
/// Violations are logged and exposed via metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// Maximum acceptable batch fetch latency (ms).
    #[serde(default = "default_max_fetch_latency_ms")]
    pub max_fetch_latency_ms: u64,

    /// Maximum acceptable batch apply latency (ms).
    #[serde(default = "default_max_apply_latency_ms")]
    pub max_apply_latency_ms: u64,

    /// Maximum acceptable lag behind the queue head, in ticks.
    #[serde(default = "default_max_lag_ticks")]
    pub max_lag_ticks: u64,
}

fn default_max_fetch_latency_ms() -> u64 {
    200
}

fn default_max_apply_latency_ms() -> u64 {
    500
}

fn default_max_lag_ticks() -> u64 {
    100
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_fetch_latency_ms: 200,
            max_apply_latency_ms: 500,
            max_lag_ticks: 100,
        }
    }
}

impl SloConfig {
    pub fn is_fetch_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_fetch_latency_ms
    }

    pub fn is_apply_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_apply_latency_ms
    }

    pub fn is_lag_violation(&self, lag_ticks: u64) -> bool {
        lag_ticks > self.max_lag_ticks
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: target database
// ═══════════════════════════════════════════════════════════════════════════════

/// Local SQLite store configuration.
///
/// Replicated rows and replication state share this database so that
/// applying a batch and advancing the position commit together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// SQLite busy timeout (e.g. "5s").
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: String,
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout() -> String {
    "5s".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replica.db".to_string(),
            wal_mode: true,
            max_connections: 8,
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            max_connections: 1,
            busy_timeout: default_busy_timeout(),
        }
    }

    /// Config for a database file with defaults otherwise.
    pub fn at_path(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: path.into(),
            ..Default::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }

    pub fn busy_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.busy_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeType;

    #[test]
    fn test_poll_durations_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
        ];

        for (input, expected) in test_cases {
            let config = PlaybackConfig {
                poll_max: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.poll_max_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_poll_duration_invalid_fallback() {
        let config = PlaybackConfig {
            poll_min: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.poll_min_duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_next_poll_delay_is_bounded() {
        let config = PlaybackConfig::default(); // 100ms .. 5s
        assert_eq!(config.next_poll_delay(Duration::ZERO), Duration::from_millis(100));
        assert_eq!(config.next_poll_delay(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(config.next_poll_delay(Duration::from_secs(4)), Duration::from_secs(5));
        assert_eq!(config.next_poll_delay(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_rate_limit_off_by_default() {
        let config: PlaybackConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.rate_limit_enabled);
        assert_eq!(config.rate_limit_per_sec, 10_000);
        assert_eq!(config.rate_limit_burst, 1000);
    }

    #[test]
    fn test_playback_default_suppresses_merge_execute() {
        let config = PlaybackConfig::default();
        assert!(!config.execute_on_merge);
    }

    #[test]
    fn test_copy_backoff() {
        let config = CopyConfig {
            retry_backoff_base: "5s".to_string(),
            retry_backoff_max: "5m".to_string(),
            ..Default::default()
        };

        assert_eq!(config.backoff_for_attempts(1), Duration::from_secs(5));
        assert_eq!(config.backoff_for_attempts(2), Duration::from_secs(10));
        assert_eq!(config.backoff_for_attempts(3), Duration::from_secs(20));
        // 5 * 2^6 = 320s, capped at 300
        assert_eq!(config.backoff_for_attempts(7), Duration::from_secs(300));
        assert_eq!(config.backoff_for_attempts(40), Duration::from_secs(300));
    }

    #[test]
    fn test_copy_default() {
        let config = CopyConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.parallel_tables, vec!["*".to_string()]);
        assert_eq!(config.max_copy_attempts, 5);
    }

    #[test]
    fn test_takeover_default() {
        let config = TakeoverConfig::default();
        assert_eq!(config.max_lag_ticks, 0);
        assert_eq!(config.pause_timeout_duration(), Duration::from_secs(30));
        assert_eq!(config.dead_after_duration(), Duration::from_secs(120));

        let config: TakeoverConfig = serde_json::from_str(r#"{"dead_after": "5m"}"#).unwrap();
        assert_eq!(config.dead_after_duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_slo_violations() {
        let config = SloConfig::default();
        assert!(!config.is_fetch_violation(Duration::from_millis(200)));
        assert!(config.is_fetch_violation(Duration::from_millis(201)));
        assert!(!config.is_apply_violation(Duration::from_millis(500)));
        assert!(config.is_apply_violation(Duration::from_secs(1)));
        assert!(!config.is_lag_violation(100));
        assert!(config.is_lag_violation(101));
    }

    #[test]
    fn test_store_config_in_memory() {
        let config = StoreConfig::in_memory();
        assert!(config.is_in_memory());
        assert!(!config.wal_mode);
        assert_eq!(config.max_connections, 1);
    }

    #[test]
    fn test_for_testing_config() {
        let config = EngineConfig::for_testing("leaf-1");
        assert_eq!(config.node.node_name, "leaf-1");
        assert_eq!(config.node.node_type, NodeType::Leaf);
        assert!(config.store.is_in_memory());
        assert_eq!(config.playback.poll_min_duration(), Duration::from_millis(5));
        assert_eq!(config.playback.tick_interval_duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = EngineConfig::for_testing("leaf-2");
        config.copy.parallel_tables = vec!["public.order_*".to_string()];
        config.node.combined_set = vec!["eu_orders".to_string()];

        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.node.node_name, "leaf-2");
        assert_eq!(parsed.copy.parallel_tables, vec!["public.order_*".to_string()]);
        assert_eq!(parsed.node.combined_set, vec!["eu_orders".to_string()]);
    }

    #[test]
    fn test_config_minimal_json_uses_defaults() {
        let json = r#"{"node": {"node_name": "b1", "node_type": "branch", "queue_name": "q", "provider_node": "root"}}"#;
        let parsed: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.node.node_type, NodeType::Branch);
        assert_eq!(parsed.copy.workers, 4);
        assert_eq!(parsed.store.sqlite_path, "replica.db");
    }
}
