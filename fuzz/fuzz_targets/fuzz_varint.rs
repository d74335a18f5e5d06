#![no_main]

use libfuzzer_sys::fuzz_target;
use milli_serve::varint::{decode_varint, encode_varint, varint_len};

fuzz_target!(|data: &[u8]| {
    if let Ok((value, consumed)) = decode_varint(data) {
        assert!(consumed >= varint_len(value));
        let mut buf = [0u8; 8];
        let written = encode_varint(value, &mut buf).unwrap();
        assert_eq!(decode_varint(&buf[..written]).unwrap(), (value, written));
    }
});
