//! Fuzz target for shard placement.
//!
//! Every hashable key must land on exactly one shard of a valid layout.

#![no_main]

use cascade_replication::{HashFunc, ShardConfig};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: (&str, u8, bool)| {
    let (key, pow, int_hash) = data;
    let count = 1u64 << (pow % 8);
    let func = if int_hash { HashFunc::Int } else { HashFunc::Sha256 };

    for value in [Value::String(key.to_string()), serde_json::json!(key.len())] {
        let Some(hash) = func.hash(&value) else {
            continue;
        };
        let owners = (0..count)
            .filter_map(|nr| ShardConfig::new(nr, count, func).ok())
            .filter(|shard| shard.owns_hash(hash))
            .count();
        assert_eq!(owners, 1);
    }
});
