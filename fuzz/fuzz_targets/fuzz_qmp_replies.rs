//! Fuzz target: decoding of monitor replies and events.
//!
//! QEMU output is untrusted input to the engine; decoding must fail
//! cleanly instead of panicking.

#![no_main]

use ferry_engine::qmp::{BlockJobInfo, Event, MigrationInfo};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<Vec<BlockJobInfo>>(data);
    let _ = serde_json::from_slice::<MigrationInfo>(data);
    if let Ok(event) = serde_json::from_slice::<Event>(data) {
        let _ = event.matches("BLOCK_JOB_COMPLETED", &serde_json::Map::new());
    }
});
