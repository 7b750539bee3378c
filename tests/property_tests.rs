//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use cascade_replication::handler::ApplyOp;
use cascade_replication::sync_state::Route;
use cascade_replication::{
    row_of, CopyConfig, Event, Handler, HashFunc, ShardConfig, TableInfo, TableOptions, TableState,
    TableSyncState,
};
use common::*;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn users_info() -> TableInfo {
    TableInfo {
        name: "users".to_string(),
        columns: vec!["id".to_string(), "name".to_string(), "email".to_string()],
        pkey: vec!["id".to_string()],
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Handler Properties
// =============================================================================

proptest! {
    /// Arbitrary specs parse or fail cleanly, never panic
    #[test]
    fn handler_parse_never_panics(spec in ".{0,48}") {
        let _ = Handler::parse(&spec);
    }

    /// Well-formed shard specs round-trip their parameters
    #[test]
    fn shard_spec_parses_parameters(pow in 0u32..6, nr_seed in any::<u64>(), int_hash in any::<bool>()) {
        let count = 1u64 << pow;
        let nr = nr_seed % count;
        let hash = if int_hash { "int" } else { "sha256" };
        let spec = format!("shard(key=id, nr={}, count={}, hash={})", nr, count, hash);

        match Handler::parse(&spec).unwrap() {
            Handler::Shard(shard) => {
                prop_assert_eq!(shard.key, "id");
                prop_assert_eq!(shard.shard.shard_nr, nr);
                prop_assert_eq!(shard.shard.shard_count, count);
                prop_assert_eq!(shard.shard.shard_mask, count - 1);
            }
            other => prop_assert!(false, "parsed as {:?}", other),
        }
    }

    /// A shard config is valid exactly when count is a power of two and nr fits
    #[test]
    fn shard_config_validity(nr in 0u64..70, count in 0u64..70) {
        let valid = count.is_power_of_two() && nr < count;
        prop_assert_eq!(ShardConfig::new(nr, count, HashFunc::Int).is_ok(), valid);
    }

    /// Every row lands on exactly one shard, for events and copies alike
    #[test]
    fn shard_partition_is_disjoint_and_complete(
        ids in prop::collection::vec(any::<i64>(), 1..50),
        pow in 0u32..5,
        int_hash in any::<bool>(),
    ) {
        let count = 1u64 << pow;
        let hash = if int_hash { "int" } else { "sha256" };
        let handlers: Vec<Handler> = (0..count)
            .map(|nr| Handler::parse(&format!("shard(key=id, nr={}, count={}, hash={})", nr, count, hash)).unwrap())
            .collect();
        let info = users_info();

        for id in ids {
            let row = row_of([("id", json!(id)), ("name", json!("n"))]);
            let event = Event::insert("users", row.clone());

            let owners: Vec<usize> = handlers
                .iter()
                .enumerate()
                .filter(|(_, h)| h.transform(&event, &info).unwrap().is_some())
                .map(|(nr, _)| nr)
                .collect();
            prop_assert_eq!(owners.len(), 1, "id {} owned by {:?}", id, owners);

            // Bulk copy places the row on the same shard.
            for (nr, handler) in handlers.iter().enumerate() {
                let copied = handler.copy_row("users", row.clone(), &info).unwrap().is_some();
                prop_assert_eq!(copied, owners[0] == nr);
            }
        }
    }

    /// Obfuscation is deterministic, keeps key and kept columns, and never leaks text
    #[test]
    fn obfuscate_is_deterministic_and_masking(
        id in any::<i64>(),
        name in "[a-z]{4,16}",
        salt in "[a-z0-9]{0,8}",
    ) {
        let handler = Handler::parse(&format!("obfuscate(keep=email, salt={})", salt)).unwrap();
        let info = users_info();
        let row = row_of([
            ("id", json!(id)),
            ("name", json!(name.clone())),
            ("email", json!("x@example.com")),
        ]);

        let live = match handler.transform(&Event::insert("users", row.clone()), &info).unwrap() {
            Some(ApplyOp::Upsert { row, .. }) => row,
            other => return Err(TestCaseError::fail(format!("unexpected op {:?}", other))),
        };
        let copied = handler.copy_row("users", row, &info).unwrap().unwrap();

        prop_assert_eq!(&live, &copied);
        prop_assert_eq!(&live["id"], &json!(id));
        prop_assert_eq!(&live["email"], &json!("x@example.com"));
        prop_assert_ne!(&live["name"], &json!(name));
    }
}

// =============================================================================
// Sync State Properties
// =============================================================================

proptest! {
    /// Around a snapshot boundary, every tick is either in the snapshot or replayed
    #[test]
    fn copy_boundary_is_exact(sync_tick in 0i64..1000, ticks in prop::collection::vec(0i64..2000, 1..50)) {
        let mut state = TableState::register("q", "users", "passthrough", TableOptions::default()).unwrap();
        state.begin_copy().unwrap();
        for &tick in &ticks {
            prop_assert_eq!(state.route(tick), Route::Buffer);
        }

        state.finish_copy(sync_tick).unwrap();
        for &tick in &ticks {
            let expected = if tick <= sync_tick { Route::Skip } else { Route::Apply };
            prop_assert_eq!(state.route(tick), expected);
        }

        prop_assert!(!state.mark_caught_up(sync_tick - 1));
        prop_assert!(state.mark_caught_up(sync_tick));
        prop_assert_eq!(state.state, TableSyncState::Ok);
        for &tick in &ticks {
            prop_assert_eq!(state.route(tick), Route::Apply);
        }
    }

    /// Copy failures freeze a table after exactly max attempts
    #[test]
    fn copy_failures_freeze_at_max(max_attempts in 1u32..10) {
        let mut state = TableState::register("q", "users", "passthrough", TableOptions::default()).unwrap();
        for attempt in 1..=max_attempts {
            prop_assert!(!state.failed);
            state.begin_copy().unwrap();
            state.copy_failed("boom", max_attempts);
            prop_assert_eq!(state.copy_attempts, attempt);
            prop_assert_eq!(state.state, TableSyncState::New);
        }
        prop_assert!(state.failed);
        prop_assert!(!state.is_copy_candidate());
        prop_assert_eq!(state.route(1), Route::Skip);

        state.reset();
        prop_assert!(state.is_copy_candidate());
        prop_assert_eq!(state.copy_attempts, 0);
    }

    /// Copy retry backoff grows monotonically and respects the cap
    #[test]
    fn copy_backoff_bounded_and_monotone(attempts in 1u32..64) {
        let config = CopyConfig::default();
        let max = humantime::parse_duration(&config.retry_backoff_max).unwrap();
        let current = config.backoff_for_attempts(attempts);
        let next = config.backoff_for_attempts(attempts + 1);
        prop_assert!(current <= next);
        prop_assert!(next <= max);
    }
}

// =============================================================================
// End-to-end Convergence
// =============================================================================

#[derive(Debug, Clone)]
enum Change {
    Upsert(i64, u8),
    Delete(i64),
}

fn change_strategy() -> impl Strategy<Value = Change> {
    prop_oneof![
        3 => (0i64..12, any::<u8>()).prop_map(|(id, v)| Change::Upsert(id, v)),
        1 => (0i64..12).prop_map(Change::Delete),
    ]
}

fn to_event(change: &Change) -> Event {
    match change {
        Change::Upsert(id, v) => rename(*id, &format!("v{}", v)),
        Change::Delete(id) => delete_user(*id),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// A leaf copied at any point and then replaying ends equal to its root
    #[test]
    fn leaf_converges_to_root(
        before in prop::collection::vec(prop::collection::vec(change_strategy(), 0..6), 0..6),
        after in prop::collection::vec(prop::collection::vec(change_strategy(), 0..6), 0..6),
    ) {
        let rt = runtime();
        let (leaf_rows, root_rows) = rt.block_on(async {
            let root = store_with(&[USERS_DDL]).await;
            for tick in &before {
                let events: Vec<Event> = tick.iter().map(to_event).collect();
                capture_tick(&root, QUEUE, &events).await;
            }

            let store = store_with(&[USERS_DDL]).await;
            let mut engine = leaf("leaf-1", Arc::clone(&store), &root);
            engine
                .add_table(QUEUE, "users", "passthrough", TableOptions::default())
                .await
                .unwrap();
            engine.start().await.unwrap();

            for tick in &after {
                let events: Vec<Event> = tick.iter().map(to_event).collect();
                capture_tick(&root, QUEUE, &events).await;
            }
            engine.wait_sync(SYNC_TIMEOUT).await.unwrap();
            let result = (users(&store).await, users(&root).await);
            engine.shutdown().await;
            result
        });
        prop_assert_eq!(leaf_rows, root_rows);
    }
}
