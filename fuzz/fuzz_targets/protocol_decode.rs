//! Fuzz harness for wire-protocol line decoding.
//!
//! Feeds arbitrary byte sequences through both envelope decoders, ensuring
//! that malformed UTF-8, truncated JSON, unknown `type` tags, and oversized
//! lines always surface as `Err` and never as a panic.

#![no_main]
use libfuzzer_sys::fuzz_target;
use warren_core::protocol::{decode_line, HostCommand, HostEvent};

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        // Both directions share the decoder; neither may panic.
        let _ = decode_line::<HostEvent>(line);
        let _ = decode_line::<HostCommand>(line);
    }
});
