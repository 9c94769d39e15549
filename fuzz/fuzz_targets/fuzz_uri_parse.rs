//! Fuzz target for server URI parsing.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_distributor::LogUri;

fuzz_target!(|input: &str| {
    // Should never panic
    if let Ok(uri) = LogUri::parse(input) {
        // Anything accepted prints back to an equivalent URI
        let reparsed = LogUri::parse(&uri.to_string()).expect("display output parses");
        assert_eq!(reparsed, uri);
    }
});
