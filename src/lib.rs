//! # Cascade Replication
//!
//! Playback engine for trigger-based logical replication between SQLite
//! databases arranged in a cascade.
//!
//! ## Architecture
//!
//! A root captures row changes into a tick-delimited queue. Each
//! downstream node runs one playback loop per consumed queue, applying
//! whole ticks in commit order and advancing its position in the same
//! transaction:
//!
//! ```text
//!  ┌──────────┐  queue   ┌──────────┐  queue   ┌──────────┐
//!  │  root    │ ───────► │  branch  │ ───────► │  leaf    │
//!  │ capture  │          │ apply +  │          │ apply    │
//!  │ + ticker │          │ re-emit  │          │          │
//!  └──────────┘          └──────────┘          └──────────┘
//!        ▲                    ▲                     │
//!        └──── bulk copy ─────┴──── bulk copy ──────┘
//!              (snapshot at tick S, then replay ticks > S)
//! ```
//!
//! ## Table Lifecycle
//!
//! Registered tables go `NEW → IN_COPY → CATCHING_UP → OK`. While a table
//! is copied its events are buffered; the snapshot's tick boundary decides
//! which buffered and live events are replayed, so nothing is lost or
//! applied twice.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cascade_replication::{
//!     EngineConfig, LocalQueue, LocalStore, NodeInfo, ReplicationEngine, StoreSource, TableOptions,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> cascade_replication::Result<()> {
//!     let root = Arc::new(LocalStore::open_path("/var/lib/replica/root.db").await?);
//!
//!     let mut config = EngineConfig::default();
//!     config.node = NodeInfo::leaf("leaf-1", "orders", "root");
//!
//!     let store = Arc::new(LocalStore::open_path("/var/lib/replica/leaf.db").await?);
//!     let mut engine = ReplicationEngine::new(config, store).with_provider(
//!         "orders",
//!         Arc::new(LocalQueue::new(Arc::clone(&root))),
//!         Arc::new(StoreSource::root(Arc::clone(&root), "orders")),
//!     );
//!
//!     engine.add_table("orders", "order_lines", "passthrough", TableOptions::default()).await?;
//!     engine.start().await?;
//!     engine.wait_sync(Duration::from_secs(60)).await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod exec_attrs;
pub mod handler;
pub mod metrics;
pub mod queue;
pub mod resilience;
pub mod source;
pub mod store;
pub mod sync_state;
pub mod topology;

// Re-exports for convenience
pub use circuit_breaker::{CircuitConfig, CircuitState, QueueBreaker, QueueCircuit};
pub use config::{CopyConfig, EngineConfig, PlaybackConfig, SloConfig, StoreConfig, TakeoverConfig};
pub use coordinator::{
    EngineState, NodeStatus, QueueRole, QueueStatus, ReplicationEngine, TableChecksum, TableComparison,
    TableStatus, TakeoverOutcome,
};
pub use error::{ErrorScope, ReplicationError, Result};
pub use event::{row_of, Batch, Event, Op, Row};
pub use exec_attrs::{ExecAttr, ExecAttrs};
pub use handler::{Handler, HashFunc, ShardConfig};
pub use queue::{ConsumerInfo, Handoff, LocalQueue, QueueService, RedisQueue, RedisQueueConfig};
pub use source::{CopySource, StoreSource, TableSnapshot};
pub use store::{LocalStore, TableInfo};
pub use sync_state::{TableOptions, TableState, TableSyncState};
pub use topology::{NodeInfo, NodeType};
