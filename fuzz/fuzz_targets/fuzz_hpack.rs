#![no_main]

use libfuzzer_sys::fuzz_target;
use milli_serve::hpack::HpackDecoder;

fuzz_target!(|data: &[u8]| {
    let mut decoder = HpackDecoder::default();
    if decoder.decode(data, |_, _| {}).is_ok() {
        assert!(decoder.table().current_size() <= decoder.table().capacity());
    }
});
