//! QPACK encoder (RFC 9204 §2.1, §4.5).
//!
//! Inserts go out on the encoder stream before the field section that uses
//! them. A section may reference entries the peer has not acknowledged only
//! while the number of potentially blocked streams stays within the peer's
//! SETTINGS_QPACK_BLOCKED_STREAMS; otherwise the encoder falls back to
//! static references and literals.

use std::collections::VecDeque;

use crate::buf::BufExt;
use crate::error::{Error, H3Error};
use crate::hpack::codec::{NEVER_INDEXED, put_string};
use crate::hpack::dynamic_table::{DynamicTable, ENTRY_OVERHEAD, entry_size};
use crate::hpack::integer;

use super::instructions::{self, DecoderInstruction};
use super::static_table::{self, LookupResult};

#[derive(Debug, Clone, Copy)]
struct Section {
    stream_id: u64,
    required: u64,
    /// Oldest absolute index referenced.
    min_ref: u64,
}

#[derive(Debug, Clone, Copy)]
enum Line {
    Static(u64),
    Dynamic(u64),
    StaticName(u64),
    DynamicName(u64),
    Literal,
}

#[derive(Debug)]
pub struct QpackEncoder {
    table: DynamicTable,
    /// Derived from the peer's SETTINGS_QPACK_MAX_TABLE_CAPACITY.
    max_entries: u64,
    max_blocked: usize,
    known_received: u64,
    outstanding: VecDeque<Section>,
    instructions: Vec<u8>,
    decoder_buf: Vec<u8>,
    huffman: bool,
}

impl QpackEncoder {
    /// `max_capacity` bounds our table regardless of what the peer allows.
    /// Until [`configure`](Self::configure) runs the encoder is static-only.
    pub fn new(max_capacity: usize) -> Self {
        let mut table = DynamicTable::new(max_capacity);
        let _ = table.set_capacity(0);
        Self {
            table,
            max_entries: 0,
            max_blocked: 0,
            known_received: 0,
            outstanding: VecDeque::new(),
            instructions: Vec::new(),
            decoder_buf: Vec::new(),
            huffman: true,
        }
    }

    pub fn without_huffman(mut self) -> Self {
        self.huffman = false;
        self
    }

    /// Apply the peer's QPACK settings.
    pub fn configure(&mut self, peer_capacity: u64, peer_blocked: u64) -> Result<(), Error> {
        self.max_entries = peer_capacity / ENTRY_OVERHEAD as u64;
        self.max_blocked = peer_blocked as usize;
        let capacity = (peer_capacity as usize).min(self.table.max_capacity());
        if capacity != self.table.capacity() {
            self.table.set_capacity(capacity)?;
            instructions::put_set_capacity(&mut self.instructions, capacity as u64)?;
        }
        Ok(())
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    pub fn known_received_count(&self) -> u64 {
        self.known_received
    }

    /// Streams with sections that may still block at the peer.
    pub fn blocked_streams(&self) -> usize {
        let mut ids: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|s| s.required > self.known_received)
            .map(|s| s.stream_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Pending bytes for our encoder stream. Must be sent before any field
    /// section produced since the previous call.
    pub fn take_instructions(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.instructions)
    }

    /// Encode a field section for `stream_id` into `out`.
    pub fn encode_field_section<B: BufExt + ?Sized>(
        &mut self,
        stream_id: u64,
        headers: &[(&[u8], &[u8])],
        out: &mut B,
    ) -> Result<(), Error> {
        let may_block = self.may_block(stream_id);
        let mut protect = self.outstanding.iter().map(|s| s.min_ref).min().unwrap_or(u64::MAX);
        let mut lines = Vec::with_capacity(headers.len());
        let mut max_ref = None::<u64>;

        for &(name, value) in headers {
            let line = self.choose(name, value, may_block, protect)?;
            if let Line::Dynamic(abs) | Line::DynamicName(abs) = line {
                protect = protect.min(abs);
                max_ref = Some(max_ref.map_or(abs, |m| m.max(abs)));
            }
            lines.push(line);
        }

        let required = max_ref.map_or(0, |m| m + 1);
        let base = self.table.insert_count();
        let encoded = if required == 0 { 0 } else { required % (2 * self.max_entries) + 1 };
        integer::put_integer(out, encoded, 8, 0x00)?;
        integer::put_integer(out, base - required, 7, 0x00)?;

        for (&(name, value), line) in headers.iter().zip(&lines) {
            let never = if NEVER_INDEXED.iter().any(|n| *n == name) { 0x20 } else { 0x00 };
            match *line {
                Line::Static(i) => integer::put_integer(out, i, 6, 0xc0)?,
                Line::Dynamic(abs) => integer::put_integer(out, base - 1 - abs, 6, 0x80)?,
                Line::StaticName(i) => {
                    integer::put_integer(out, i, 4, 0x50 | never)?;
                    put_string(value, self.huffman, out)?;
                }
                Line::DynamicName(abs) => {
                    integer::put_integer(out, base - 1 - abs, 4, 0x40 | never)?;
                    put_string(value, self.huffman, out)?;
                }
                Line::Literal => {
                    instructions::put_prefixed_string(out, name, 0x20 | (never >> 1), 0x08, 3, self.huffman)?;
                    put_string(value, self.huffman, out)?;
                }
            }
        }

        if required > 0 {
            self.outstanding.push_back(Section { stream_id, required, min_ref: protect });
        }
        Ok(())
    }

    /// Feed bytes received on the peer's decoder stream.
    pub fn on_decoder_stream(&mut self, data: &[u8]) -> Result<(), Error> {
        const ERR: Error = Error::Http3(H3Error::QpackDecoderStreamError);
        self.decoder_buf.extend_from_slice(data);
        let mut pos = 0;
        while let Some((instr, n)) = instructions::parse_decoder_instruction(&self.decoder_buf[pos..])? {
            pos += n;
            match instr {
                DecoderInstruction::SectionAck(id) => {
                    let i = self.outstanding.iter().position(|s| s.stream_id == id).ok_or(ERR)?;
                    if let Some(section) = self.outstanding.remove(i) {
                        self.known_received = self.known_received.max(section.required);
                    }
                }
                DecoderInstruction::StreamCancel(id) => self.outstanding.retain(|s| s.stream_id != id),
                DecoderInstruction::InsertCountIncrement(inc) => {
                    let known = self.known_received.checked_add(inc).ok_or(ERR)?;
                    if known > self.table.insert_count() {
                        return Err(ERR);
                    }
                    self.known_received = known;
                }
            }
        }
        self.decoder_buf.drain(..pos);
        Ok(())
    }

    fn may_block(&self, stream_id: u64) -> bool {
        let already = self
            .outstanding
            .iter()
            .any(|s| s.stream_id == stream_id && s.required > self.known_received);
        already || self.blocked_streams() < self.max_blocked
    }

    fn usable(&self, absolute: u64, may_block: bool) -> bool {
        absolute < self.known_received || may_block
    }

    fn choose(&mut self, name: &[u8], value: &[u8], may_block: bool, protect: u64) -> Result<Line, Error> {
        let static_match = static_table::lookup(name, value);
        if let LookupResult::ExactMatch(i) = static_match {
            return Ok(Line::Static(i as u64));
        }
        let dynamic_match = self.table.find(name, value);
        if let Some(m) = dynamic_match
            && m.exact
            && self.usable(m.absolute, may_block)
        {
            return Ok(Line::Dynamic(m.absolute));
        }

        let size = entry_size(name, value);
        let sensitive = NEVER_INDEXED.iter().any(|n| *n == name);
        if may_block
            && !sensitive
            && self.max_entries > 0
            && size <= self.table.capacity() / 2
            && self.table.can_insert(size, protect)
        {
            match (static_match, dynamic_match) {
                (LookupResult::NameMatch(i), _) => {
                    instructions::put_insert_with_name_ref(&mut self.instructions, true, i as u64, value, self.huffman)?;
                    self.table.insert(name, value)?;
                }
                (_, Some(m)) => {
                    let relative = self.table.insert_count() - 1 - m.absolute;
                    instructions::put_insert_with_name_ref(&mut self.instructions, false, relative, value, self.huffman)?;
                    self.table.insert_with_name_of(m.absolute, value)?;
                }
                _ => {
                    instructions::put_insert_with_literal_name(&mut self.instructions, name, value, self.huffman)?;
                    self.table.insert(name, value)?;
                }
            }
            return Ok(Line::Dynamic(self.table.insert_count() - 1));
        }

        Ok(match (static_match, dynamic_match) {
            (LookupResult::NameMatch(i), _) => Line::StaticName(i as u64),
            (_, Some(m)) if self.usable(m.absolute, may_block) => Line::DynamicName(m.absolute),
            _ => Line::Literal,
        })
    }
}
