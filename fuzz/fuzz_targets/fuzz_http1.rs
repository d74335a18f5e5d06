#![no_main]

use libfuzzer_sys::fuzz_target;
use milli_serve::http1::{Http1Codec, Http1Item};

fuzz_target!(|data: &[u8]| {
    let mut codec = Http1Codec::new(8 * 1024, 4);
    let mut seen = 0;
    while let Ok(Some(item)) = codec.next(data) {
        if let Http1Item::Body(range) = &item {
            assert!(range.end <= data.len());
        }
        if let Http1Item::End(seq) = item {
            let _ = codec.response_done();
            assert!(seq > 0);
        }
        seen += 1;
        if seen > 10_000 {
            break;
        }
    }
});
