#![no_main]

use libfuzzer_sys::fuzz_target;
use milli_serve::h3::decode_h3_frame;

fuzz_target!(|data: &[u8]| {
    let mut pos = 0;
    while pos < data.len() {
        match decode_h3_frame(&data[pos..]) {
            Ok((_, 0)) | Err(_) => break,
            Ok((_, consumed)) => pos += consumed,
        }
    }
});
