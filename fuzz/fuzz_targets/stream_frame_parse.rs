#![no_main]

use libfuzzer_sys::fuzz_target;
use riina_runtime::{parse_stream_frame, StreamEvent};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    match parse_stream_frame(&raw) {
        Ok(StreamEvent::Ignored { kind }) => {
            assert!(!kind.is_empty());
        }
        Ok(_) => {}
        Err(error) => {
            assert!(!error.to_string().trim().is_empty());
        }
    }
});
