//! Fuzz target: `TaskId` parsing.
//!
//! Any id that parses must print back to a string that parses to the same id.

#![no_main]

use ferry_core::TaskId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(id) = s.parse::<TaskId>() {
        let reparsed: TaskId = id.to_string().parse().expect("printed id must parse");
        assert_eq!(id, reparsed);
    }
});
