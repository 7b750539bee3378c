//! Fuzz target for handler spec parsing.
//!
//! Arbitrary handler strings must parse or fail with an error, never panic.

#![no_main]

use cascade_replication::Handler;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|spec: &str| {
    let _ = Handler::parse(spec);
});
