//! QPACK header compression (RFC 9204).
//!
//! The dynamic table, Huffman code and prefix integers are shared with
//! HPACK (`crate::hpack`). On top of those this module adds the encoder and
//! decoder stream instructions, the field section prefix with its Required
//! Insert Count and Base, and blocked-stream bookkeeping.

pub mod decoder;
pub mod encoder;
pub mod instructions;
pub mod static_table;

pub use decoder::{FieldSection, QpackDecoder};
pub use encoder::QpackEncoder;

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Vec as HVec;

    // Decoded headers copied into bounded buffers for comparison.
    struct CollectedHeaders {
        entries: HVec<(HVec<u8, 256>, HVec<u8, 512>), 32>,
    }

    impl CollectedHeaders {
        fn new() -> Self {
            Self { entries: HVec::new() }
        }

        fn push(&mut self, name: &[u8], value: &[u8]) {
            let mut n = HVec::new();
            n.extend_from_slice(name).unwrap();
            let mut v = HVec::new();
            v.extend_from_slice(value).unwrap();
            self.entries.push((n, v)).unwrap();
        }

        fn assert_eq(&self, expected: &[(&[u8], &[u8])]) {
            assert_eq!(self.entries.len(), expected.len());
            for (got, want) in self.entries.iter().zip(expected) {
                assert_eq!(got.0.as_slice(), want.0);
                assert_eq!(got.1.as_slice(), want.1);
            }
        }
    }

    fn roundtrip(headers: &[(&[u8], &[u8])]) -> HVec<u8, 2048> {
        let mut enc = QpackEncoder::new(0);
        let mut buf: HVec<u8, 2048> = HVec::new();
        enc.encode_field_section(0, headers, &mut buf).unwrap();
        let mut dec = QpackDecoder::new(0, 0);
        let mut out = CollectedHeaders::new();
        let r = dec.decode_field_section(0, &buf, 0, |n, v| out.push(n, v)).unwrap();
        assert!(matches!(r, FieldSection::Decoded { .. }));
        out.assert_eq(headers);
        buf
    }

    #[test]
    fn exact_match_produces_indexed_line() {
        let buf = roundtrip(&[(b":method", b"GET")]);
        // Prefix, then 0b11 | 17.
        assert_eq!(buf.as_slice(), &[0x00, 0x00, 0xc0 | 17]);
    }

    #[test]
    fn name_ref_produces_literal_with_name_ref() {
        let buf = roundtrip(&[(b":path", b"/index.html")]);
        assert_eq!(buf[2] & 0xf0, 0x50);
    }

    #[test]
    fn literal_name_produces_literal_with_literal_name() {
        let buf = roundtrip(&[(b"x-custom", b"value")]);
        assert_eq!(buf[2] & 0xe0, 0x20);
    }

    #[test]
    fn roundtrip_realistic_request() {
        roundtrip(&[
            (b":method", b"GET"),
            (b":scheme", b"https"),
            (b":authority", b"example.com"),
            (b":path", b"/static/app.js"),
            (b"accept-encoding", b"gzip, deflate, br"),
            (b"user-agent", b"curl/8.5.0"),
            (b"cookie", b"session=1"),
        ]);
    }

    #[test]
    fn roundtrip_realistic_response() {
        roundtrip(&[
            (b":status", b"200"),
            (b"content-type", b"application/json"),
            (b"content-length", b"1234"),
            (b"cache-control", b"no-cache"),
            (b"etag", b"\"abc\""),
        ]);
    }

    #[test]
    fn roundtrip_all_exact_match_statuses() {
        for status in [&b"103"[..], b"200", b"304", b"404", b"503", b"100", b"204", b"206", b"302", b"400", b"403", b"421", b"425", b"500"] {
            roundtrip(&[(b":status", status)]);
        }
    }

    #[test]
    fn empty_field_section() {
        let buf = roundtrip(&[]);
        assert_eq!(buf.as_slice(), &[0x00, 0x00]);
    }

    #[test]
    fn encode_buffer_too_small() {
        let mut enc = QpackEncoder::new(0);
        let mut buf: HVec<u8, 4> = HVec::new();
        let r = enc.encode_field_section(0, &[(b"x-long-header-name", b"value")], &mut buf);
        assert!(matches!(r, Err(crate::error::Error::BufferTooSmall { .. })));
    }

    #[test]
    fn decode_empty_src_fails() {
        let mut dec = QpackDecoder::new(0, 0);
        assert!(dec.decode_field_section(0, &[], 0, |_, _| {}).is_err());
    }

    #[test]
    fn dynamic_reference_without_table_fails() {
        let mut dec = QpackDecoder::new(0, 0);
        // RIC 1 cannot be satisfied when we advertised no table.
        assert!(dec.decode_field_section(0, &[0x02, 0x00, 0x80], 0, |_, _| {}).is_err());
    }

    type Fields = Vec<(Vec<u8>, Vec<u8>)>;

    fn random_list(rng: &mut fastrand::Rng) -> Fields {
        const NAMES: [&str; 7] =
            [":path", "content-type", "cookie", "authorization", "x-request-id", "x-forwarded-for", "user-agent"];
        const VALUES: [&str; 5] = ["/", "application/json", "sid=42", "10.0.0.1", "curl/8.0"];
        (0..rng.usize(1..10))
            .map(|_| {
                let name = match rng.u8(..6) {
                    0 => format!("x-custom-{}", rng.u16(..200)).into_bytes(),
                    _ => NAMES[rng.usize(..NAMES.len())].as_bytes().to_vec(),
                };
                let value = match rng.u8(..4) {
                    0 => (0..rng.usize(..120)).map(|_| rng.u8(..)).collect(),
                    1 => format!("v{}", rng.u32(..500)).into_bytes(),
                    _ => VALUES[rng.usize(..VALUES.len())].as_bytes().to_vec(),
                };
                (name, value)
            })
            .collect()
    }

    fn decode(dec: &mut QpackDecoder, stream_id: u64, block: &[u8]) -> (FieldSection, Fields) {
        let mut out = Vec::new();
        let section = dec.decode_field_section(stream_id, block, 0, |n, v| out.push((n.to_vec(), v.to_vec()))).unwrap();
        (section, out)
    }

    /// Encoder and decoder streams run in both directions; acknowledgements
    /// reach the encoder late and sections sometimes arrive before the
    /// inserts they depend on.
    #[test]
    fn seeded_sections_round_trip_with_late_acknowledgements() {
        for capacity in [0u64, 64, 256, 4096] {
            let mut rng = fastrand::Rng::with_seed(0x9ac4_0000_u64.wrapping_add(capacity));
            let mut enc = QpackEncoder::new(4096);
            enc.configure(capacity, 2).unwrap();
            let mut dec = QpackDecoder::new(capacity as usize, 2);
            let mut acks = Vec::new();
            for round in 0..300u64 {
                let stream_id = round * 4;
                let list = random_list(&mut rng);
                let refs: Vec<(&[u8], &[u8])> = list.iter().map(|(n, v)| (n.as_slice(), v.as_slice())).collect();
                let mut block = Vec::new();
                enc.encode_field_section(stream_id, &refs, &mut block).unwrap();
                let inserts = enc.take_instructions();

                let mut early = None;
                if rng.u8(..3) == 0 {
                    early = Some(decode(&mut dec, stream_id, &block));
                }
                dec.on_encoder_stream(&inserts).unwrap();
                let decoded = match early {
                    Some((FieldSection::Decoded { .. }, fields)) => fields,
                    Some((FieldSection::Blocked, fields)) => {
                        assert!(fields.is_empty());
                        let mut ready = Vec::new();
                        dec.take_unblocked(&mut ready);
                        assert_eq!(ready, [stream_id]);
                        decode(&mut dec, stream_id, &block).1
                    }
                    None => decode(&mut dec, stream_id, &block).1,
                };
                assert_eq!(decoded, list, "capacity {capacity} round {round}");
                assert_eq!(enc.table().current_size(), dec.table().current_size());

                acks.extend(dec.take_instructions());
                if rng.bool() {
                    enc.on_decoder_stream(&std::mem::take(&mut acks)).unwrap();
                }
                assert!(enc.blocked_streams() <= 2);
            }
            enc.on_decoder_stream(&acks).unwrap();
            assert_eq!(enc.known_received_count(), dec.table().insert_count());
            assert_eq!(enc.blocked_streams(), 0);
            assert!(dec.table().current_size() <= capacity as usize);
        }
    }
}
