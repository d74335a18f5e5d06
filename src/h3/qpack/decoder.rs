//! QPACK decoder (RFC 9204 §4.5, §2.2).
//!
//! Field sections that reference entries the encoder stream has not
//! delivered yet are parked as blocked streams. The connection re-submits
//! them once [`QpackDecoder::take_unblocked`] reports them ready, or resets
//! them when [`QpackDecoder::expire_blocked`] says they waited too long.

use tracing::trace;

use crate::error::{Error, H3Error};
use crate::hpack::codec::{StrRef, read_string};
use crate::hpack::dynamic_table::{DynamicTable, ENTRY_OVERHEAD, entry_size};
use crate::hpack::integer;
use crate::timer::Instant;

use super::instructions::{self, DecoderInstruction, EncoderInstruction};
use super::static_table;

const FAILED: Error = Error::Http3(H3Error::QpackDecompressionFailed);
const ENCODER_STREAM: Error = Error::Http3(H3Error::QpackEncoderStreamError);

/// Outcome of [`QpackDecoder::decode_field_section`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSection {
    /// Every field was emitted; carries the header list size.
    Decoded { list_size: usize },
    /// Waiting on encoder-stream inserts. Nothing was emitted.
    Blocked,
}

#[derive(Debug, Clone, Copy)]
struct BlockedStream {
    stream_id: u64,
    required: u64,
    since: Instant,
}

enum Name {
    Static(&'static [u8]),
    Dynamic(u64),
    Literal(StrRef),
}

#[derive(Debug)]
pub struct QpackDecoder {
    table: DynamicTable,
    max_entries: u64,
    max_blocked: usize,
    blocked: Vec<BlockedStream>,
    /// Unparsed tail of the encoder stream.
    encoder_buf: Vec<u8>,
    /// Pending decoder-stream output.
    instructions: Vec<u8>,
    /// Insert count the encoder has been told about.
    reported: u64,
    scratch: Vec<u8>,
}

impl QpackDecoder {
    /// `max_capacity` and `max_blocked` are the values advertised in our
    /// SETTINGS_QPACK_MAX_TABLE_CAPACITY and SETTINGS_QPACK_BLOCKED_STREAMS.
    pub fn new(max_capacity: usize, max_blocked: usize) -> Self {
        let mut table = DynamicTable::new(max_capacity);
        // The encoder starts at zero until it sends Set Dynamic Table Capacity.
        let _ = table.set_capacity(0);
        Self {
            table,
            max_entries: (max_capacity / ENTRY_OVERHEAD) as u64,
            max_blocked,
            blocked: Vec::new(),
            encoder_buf: Vec::new(),
            instructions: Vec::new(),
            reported: 0,
            scratch: Vec::with_capacity(256),
        }
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    pub fn blocked_streams(&self) -> usize {
        self.blocked.len()
    }

    /// Feed bytes received on the peer's encoder stream.
    pub fn on_encoder_stream(&mut self, data: &[u8]) -> Result<(), Error> {
        self.encoder_buf.extend_from_slice(data);
        let mut pos = 0;
        loop {
            self.scratch.clear();
            let Some((instr, n)) =
                instructions::parse_encoder_instruction(&self.encoder_buf[pos..], &mut self.scratch)?
            else {
                break;
            };
            let src = &self.encoder_buf[pos..];
            let table = &mut self.table;
            let applied = match instr {
                EncoderInstruction::SetCapacity(cap) => table.set_capacity(cap as usize).map(|_| 0),
                EncoderInstruction::InsertWithNameRef { is_static: true, index, value } => {
                    let entry = static_table::get(index as usize).ok_or(ENCODER_STREAM)?;
                    table.insert(entry.name, value.resolve(src, &self.scratch))
                }
                EncoderInstruction::InsertWithNameRef { is_static: false, index, value } => {
                    let absolute = relative_to_absolute(table.insert_count(), index)?;
                    table.insert_with_name_of(absolute, value.resolve(src, &self.scratch))
                }
                EncoderInstruction::InsertWithLiteralName { name, value } => {
                    table.insert(name.resolve(src, &self.scratch), value.resolve(src, &self.scratch))
                }
                EncoderInstruction::Duplicate(index) => {
                    let absolute = relative_to_absolute(table.insert_count(), index)?;
                    table.duplicate(absolute)
                }
            };
            applied.map_err(|_| ENCODER_STREAM)?;
            pos += n;
        }
        self.encoder_buf.drain(..pos);

        let inserted = self.table.insert_count();
        if inserted > self.reported {
            instructions::put_decoder_instruction(
                &mut self.instructions,
                DecoderInstruction::InsertCountIncrement(inserted - self.reported),
            )?;
            self.reported = inserted;
        }
        Ok(())
    }

    /// Decode one field section received on `stream_id`.
    ///
    /// When the section needs inserts that have not arrived yet the stream
    /// is recorded as blocked and `FieldSection::Blocked` is returned;
    /// exceeding the advertised blocked-stream limit is a connection error.
    pub fn decode_field_section<F>(
        &mut self,
        stream_id: u64,
        src: &[u8],
        now: Instant,
        mut emit: F,
    ) -> Result<FieldSection, Error>
    where
        F: FnMut(&[u8], &[u8]),
    {
        let mut pos = 0;
        let encoded = integer::read_integer(src, &mut pos, 8).map_err(|_| FAILED)?;
        let required = self.required_insert_count(encoded)?;
        let sign = src.get(pos).ok_or(FAILED)? & 0x80 != 0;
        let delta = integer::read_integer(src, &mut pos, 7).map_err(|_| FAILED)?;
        let base = if sign {
            required.checked_sub(delta).and_then(|b| b.checked_sub(1))
        } else {
            required.checked_add(delta)
        }
        .ok_or(FAILED)?;

        if required > self.table.insert_count() {
            if !self.blocked.iter().any(|b| b.stream_id == stream_id) {
                if self.blocked.len() >= self.max_blocked {
                    return Err(FAILED);
                }
                trace!(stream_id, required, "qpack stream blocked");
                self.blocked.push(BlockedStream { stream_id, required, since: now });
            }
            return Ok(FieldSection::Blocked);
        }
        self.blocked.retain(|b| b.stream_id != stream_id);

        let mut list_size = 0;
        while pos < src.len() {
            let first = src[pos];
            self.scratch.clear();
            let (name, value) = if first & 0x80 != 0 {
                // 1Txxxxxx: Indexed Field Line
                let index = integer::read_integer(src, &mut pos, 6).map_err(|_| FAILED)?;
                if first & 0x40 != 0 {
                    let e = static_table::get(index as usize).ok_or(FAILED)?;
                    (Name::Static(e.name), Value::Static(e.value))
                } else {
                    let abs = self.pre_base(base, required, index)?;
                    (Name::Dynamic(abs), Value::Dynamic)
                }
            } else if first & 0xf0 == 0x10 {
                // 0001xxxx: Indexed Field Line With Post-Base Index
                let index = integer::read_integer(src, &mut pos, 4).map_err(|_| FAILED)?;
                let abs = self.post_base(base, required, index)?;
                (Name::Dynamic(abs), Value::Dynamic)
            } else if first & 0xc0 == 0x40 {
                // 01NTxxxx: Literal With Name Reference
                let index = integer::read_integer(src, &mut pos, 4).map_err(|_| FAILED)?;
                let name = if first & 0x10 != 0 {
                    Name::Static(static_table::get(index as usize).ok_or(FAILED)?.name)
                } else {
                    Name::Dynamic(self.pre_base(base, required, index)?)
                };
                let v = read_string(src, &mut pos, 0x80, 7, &mut self.scratch).map_err(|_| FAILED)?;
                (name, Value::Literal(v))
            } else if first & 0xe0 == 0x20 {
                // 001NHxxx: Literal With Literal Name
                let n = read_string(src, &mut pos, 0x08, 3, &mut self.scratch).map_err(|_| FAILED)?;
                let v = read_string(src, &mut pos, 0x80, 7, &mut self.scratch).map_err(|_| FAILED)?;
                (Name::Literal(n), Value::Literal(v))
            } else {
                // 0000Nxxx: Literal With Post-Base Name Reference
                let index = integer::read_integer(src, &mut pos, 3).map_err(|_| FAILED)?;
                let abs = self.post_base(base, required, index)?;
                let v = read_string(src, &mut pos, 0x80, 7, &mut self.scratch).map_err(|_| FAILED)?;
                (Name::Dynamic(abs), Value::Literal(v))
            };

            let entry = match name {
                Name::Dynamic(abs) => Some(self.table.get_absolute(abs).map_err(|_| FAILED)?),
                _ => None,
            };
            let name: &[u8] = match (&name, &entry) {
                (Name::Static(n), _) => *n,
                (Name::Literal(r), _) => r.resolve(src, &self.scratch),
                (Name::Dynamic(_), Some(e)) => e.name,
                (Name::Dynamic(_), None) => return Err(FAILED),
            };
            let value: &[u8] = match (value, &entry) {
                (Value::Static(v), _) => v,
                (Value::Literal(r), _) => r.resolve(src, &self.scratch),
                (Value::Dynamic, Some(e)) => e.value,
                (Value::Dynamic, None) => return Err(FAILED),
            };
            list_size += entry_size(name, value);
            emit(name, value);
        }

        if required > 0 {
            instructions::put_decoder_instruction(
                &mut self.instructions,
                DecoderInstruction::SectionAck(stream_id),
            )?;
            self.reported = self.reported.max(required);
        }
        Ok(FieldSection::Decoded { list_size })
    }

    /// Move streams whose inserts have all arrived into `out`.
    pub fn take_unblocked(&mut self, out: &mut Vec<u64>) {
        let inserted = self.table.insert_count();
        self.blocked.retain(|b| {
            if b.required <= inserted {
                out.push(b.stream_id);
                false
            } else {
                true
            }
        });
    }

    /// Drop streams blocked for at least `lifetime_us`. The caller resets
    /// them with H3_REQUEST_REJECTED.
    pub fn expire_blocked(&mut self, now: Instant, lifetime_us: u64, out: &mut Vec<u64>) -> Result<(), Error> {
        let mut expired = Vec::new();
        self.blocked.retain(|b| {
            if now.saturating_sub(b.since) >= lifetime_us {
                expired.push(b.stream_id);
                false
            } else {
                true
            }
        });
        for id in expired {
            self.push_cancel(id)?;
            out.push(id);
        }
        Ok(())
    }

    /// Earliest moment a blocked stream expires.
    pub fn next_expiry(&self, lifetime_us: u64) -> Option<Instant> {
        self.blocked.iter().map(|b| b.since.saturating_add(lifetime_us)).min()
    }

    /// The stream was reset or abandoned before its section was decoded.
    pub fn cancel_stream(&mut self, stream_id: u64) -> Result<(), Error> {
        self.blocked.retain(|b| b.stream_id != stream_id);
        self.push_cancel(stream_id)
    }

    /// Pending bytes for our decoder stream.
    pub fn take_instructions(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.instructions)
    }

    fn push_cancel(&mut self, stream_id: u64) -> Result<(), Error> {
        // With no dynamic table the encoder has nothing to track (§4.4.2).
        if self.table.max_capacity() == 0 {
            return Ok(());
        }
        instructions::put_decoder_instruction(&mut self.instructions, DecoderInstruction::StreamCancel(stream_id))
    }

    /// §4.5.1.1 Required Insert Count decoding.
    fn required_insert_count(&self, encoded: u64) -> Result<u64, Error> {
        if encoded == 0 {
            return Ok(0);
        }
        let full_range = 2 * self.max_entries;
        if encoded > full_range {
            return Err(FAILED);
        }
        let max_value = self.table.insert_count() + self.max_entries;
        let max_wrapped = (max_value / full_range) * full_range;
        let mut required = max_wrapped + encoded - 1;
        if required > max_value {
            if required <= full_range {
                return Err(FAILED);
            }
            required -= full_range;
        }
        if required == 0 {
            return Err(FAILED);
        }
        Ok(required)
    }

    fn pre_base(&self, base: u64, required: u64, index: u64) -> Result<u64, Error> {
        let abs = base.checked_sub(index + 1).ok_or(FAILED)?;
        if abs >= required {
            return Err(FAILED);
        }
        Ok(abs)
    }

    fn post_base(&self, base: u64, required: u64, index: u64) -> Result<u64, Error> {
        let abs = base.checked_add(index).ok_or(FAILED)?;
        if abs >= required {
            return Err(FAILED);
        }
        Ok(abs)
    }
}

enum Value {
    Static(&'static [u8]),
    Dynamic,
    Literal(StrRef),
}

fn relative_to_absolute(insert_count: u64, relative: u64) -> Result<u64, Error> {
    insert_count.checked_sub(relative + 1).ok_or(ENCODER_STREAM)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        let s: String = s.split_whitespace().collect();
        (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap()).collect()
    }

    fn decode(dec: &mut QpackDecoder, stream: u64, block: &[u8]) -> Result<Option<Vec<(String, String)>>, Error> {
        let mut out = Vec::new();
        let r = dec.decode_field_section(stream, block, 0, |n, v| {
            out.push((String::from_utf8_lossy(n).into_owned(), String::from_utf8_lossy(v).into_owned()))
        })?;
        Ok(match r {
            FieldSection::Decoded { .. } => Some(out),
            FieldSection::Blocked => None,
        })
    }

    #[test]
    fn rfc9204_b1_static_only() {
        let mut dec = QpackDecoder::new(0, 0);
        let fields = decode(&mut dec, 0, &hex("0000 510b 2f69 6e64 6578 2e68 746d 6c")).unwrap().unwrap();
        assert_eq!(fields, [(":path".to_string(), "/index.html".to_string())]);
        assert!(dec.take_instructions().is_empty());
    }

    #[test]
    fn rfc9204_b2_dynamic_table() {
        let mut dec = QpackDecoder::new(220, 1);
        dec.on_encoder_stream(&hex(
            "3fbd01 c00f7777772e6578616d706c652e636f6d c10c2f73616d706c652f70617468",
        ))
        .unwrap();
        assert_eq!(dec.table().insert_count(), 2);
        // Insert Count Increment(2)
        assert_eq!(dec.take_instructions(), [0x02]);

        let fields = decode(&mut dec, 0, &hex("0381 10 11")).unwrap().unwrap();
        assert_eq!(
            fields,
            [
                (":authority".to_string(), "www.example.com".to_string()),
                (":path".to_string(), "/sample/path".to_string()),
            ]
        );
        // Section Acknowledgment for stream 0
        assert_eq!(dec.take_instructions(), [0x80]);
    }

    #[test]
    fn blocked_section_resumes_after_inserts() {
        let mut dec = QpackDecoder::new(220, 1);
        let block = hex("0381 10 11");
        assert_eq!(decode(&mut dec, 0, &block).unwrap(), None);
        assert_eq!(dec.blocked_streams(), 1);
        // A second stream would exceed the advertised limit of one.
        assert_eq!(decode(&mut dec, 4, &block), Err(FAILED));

        dec.on_encoder_stream(&hex("3fbd01 c00f7777772e6578616d706c652e636f6d")).unwrap();
        let mut ready = Vec::new();
        dec.take_unblocked(&mut ready);
        assert!(ready.is_empty());
        dec.on_encoder_stream(&hex("c10c2f73616d706c652f70617468")).unwrap();
        dec.take_unblocked(&mut ready);
        assert_eq!(ready, [0]);
        assert_eq!(decode(&mut dec, 0, &block).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn encoder_stream_split_anywhere() {
        let stream = hex("3fbd01 c00f7777772e6578616d706c652e636f6d");
        for cut in 0..stream.len() {
            let mut dec = QpackDecoder::new(220, 0);
            dec.on_encoder_stream(&stream[..cut]).unwrap();
            dec.on_encoder_stream(&stream[cut..]).unwrap();
            assert_eq!(dec.table().insert_count(), 1);
        }
    }

    #[test]
    fn blocked_streams_expire() {
        let mut dec = QpackDecoder::new(220, 4);
        let mut out = Vec::new();
        dec.decode_field_section(8, &hex("0381 10"), 1_000, |_, _| {}).unwrap();
        assert_eq!(dec.next_expiry(500), Some(1_500));
        dec.expire_blocked(1_400, 500, &mut out).unwrap();
        assert!(out.is_empty());
        dec.expire_blocked(1_500, 500, &mut out).unwrap();
        assert_eq!(out, [8]);
        // Stream Cancellation for stream 8
        assert_eq!(dec.take_instructions(), [0x48]);
        assert_eq!(dec.blocked_streams(), 0);
    }

    #[test]
    fn references_beyond_required_count_rejected() {
        let mut dec = QpackDecoder::new(220, 0);
        dec.on_encoder_stream(&hex("3fbd01 c00f7777772e6578616d706c652e636f6d")).unwrap();
        // RIC 1, base 1, post-base index 0 refers to absolute 1 >= RIC.
        assert_eq!(decode(&mut dec, 0, &hex("0200 10")), Err(FAILED));
        // Encoded insert count above the full range.
        assert_eq!(decode(&mut dec, 0, &hex("ff00 00")), Err(FAILED));
    }

    #[test]
    fn encoder_stream_errors() {
        let mut dec = QpackDecoder::new(100, 0);
        // Capacity above our advertised maximum.
        assert_eq!(dec.on_encoder_stream(&hex("3f ff 01")), Err(ENCODER_STREAM));
        let mut dec = QpackDecoder::new(100, 0);
        // Duplicate with an empty table.
        assert_eq!(dec.on_encoder_stream(&[0x00]), Err(ENCODER_STREAM));
    }
}
