//! Fuzz target for the length-prefixed frame decoder.
//!
//! Arbitrary bytes must never panic the decoder, and a frame it does accept
//! must re-encode to something it decodes to the same message.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use replication_distributor::protocol::{decode_frame, encode_frame};

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    // Drain as many frames as the input holds; stop at the first error.
    while let Ok(Some(message)) = decode_frame(&mut buf) {
        let mut encoded = BytesMut::new();
        encode_frame(&message, &mut encoded).expect("decoded message re-encodes");
        let again = decode_frame(&mut encoded)
            .expect("re-encoded frame decodes")
            .expect("re-encoded frame is complete");
        assert_eq!(again, message);
    }
});
