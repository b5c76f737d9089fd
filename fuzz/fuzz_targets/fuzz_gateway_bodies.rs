//! Fuzz target: JSON deserialization of gateway request bodies.

#![no_main]

use ferry_gateway::routes::{StartCopyingBody, StartMigrationBody};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<StartMigrationBody>(data);
    let _ = serde_json::from_slice::<StartCopyingBody>(data);
});
