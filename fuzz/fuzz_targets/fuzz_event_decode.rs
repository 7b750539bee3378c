//! Fuzz target for batch decoding.
//!
//! Queue payloads come from the network; decoding garbage must not panic.

#![no_main]

use cascade_replication::{Batch, Event};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<Event>(data);
    let _ = serde_json::from_slice::<Batch>(data);
});
