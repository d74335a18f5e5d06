#![no_main]

use libfuzzer_sys::fuzz_target;
use milli_serve::h2::frame::{DEFAULT_MAX_FRAME_SIZE, decode_frame};
use milli_serve::h2::{CONNECTION_PREFACE, H2Config, H2Connection};

fuzz_target!(|data: &[u8]| {
    let mut pos = 0;
    while pos < data.len() {
        match decode_frame(&data[pos..], DEFAULT_MAX_FRAME_SIZE) {
            Ok((_, 0)) | Err(_) => break,
            Ok((_, consumed)) => pos += consumed,
        }
    }

    // The same bytes after a valid preface, through the whole connection.
    let mut conn = H2Connection::new(H2Config::default(), 0);
    let mut wire = CONNECTION_PREFACE.to_vec();
    wire.extend_from_slice(data);
    let _ = conn.feed_data(&wire, 0);
    while conn.poll_event().is_some() {}
    let mut out = [0u8; 4096];
    while conn.poll_output(&mut out).is_some() {}
});
