#![no_main]

use libfuzzer_sys::fuzz_target;
use milli_serve::h3::qpack::QpackDecoder;

fuzz_target!(|data: &[u8]| {
    // First byte splits the input between the encoder stream and a field section.
    let Some((&split, rest)) = data.split_first() else { return };
    let split = (split as usize).min(rest.len());
    let (instructions, section) = rest.split_at(split);

    let mut decoder = QpackDecoder::new(4096, 4);
    let _ = decoder.on_encoder_stream(instructions);
    let _ = decoder.decode_field_section(0, section, 0, |_, _| {});
    let _ = decoder.take_instructions();
});
