//! HPACK encoder and decoder (RFC 7541).
//!
//! Both sides own one [`DynamicTable`]. The decoder accepts every valid
//! representation; the encoder policy is:
//!
//! - exact static or dynamic match: indexed field
//! - sensitive names (`authorization`, `cookie`, ...): never indexed
//! - entries up to half the table capacity: literal with incremental indexing
//! - anything larger: literal without indexing
//!
//! String literals are Huffman-coded whenever that is shorter.

use crate::buf::BufExt;
use crate::error::Error;
use super::dynamic_table::{DynamicTable, entry_size};
use super::static_table::{self, LookupResult, STATIC_TABLE};
use super::{huffman, integer};

/// Default SETTINGS_HEADER_TABLE_SIZE (RFC 9113 §6.5.2).
pub const DEFAULT_TABLE_SIZE: usize = 4096;

pub(crate) const NEVER_INDEXED: &[&[u8]] = &[b"authorization", b"proxy-authorization", b"cookie", b"set-cookie"];

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct HpackEncoder {
    table: DynamicTable,
    /// Size update to emit at the start of the next header block.
    pending_size_update: Option<usize>,
    huffman: bool,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

impl HpackEncoder {
    /// `max_capacity` bounds the memory spent on the encoder table no
    /// matter what the peer advertises.
    pub fn new(max_capacity: usize) -> Self {
        let mut table = DynamicTable::new(max_capacity);
        // The peer's decoder starts at the protocol default.
        let _ = table.set_capacity(DEFAULT_TABLE_SIZE.min(max_capacity));
        Self { table, pending_size_update: None, huffman: true }
    }

    /// Disable Huffman coding of string literals.
    pub fn without_huffman(mut self) -> Self {
        self.huffman = false;
        self
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE.
    pub fn set_max_table_size(&mut self, peer_limit: usize) {
        let capacity = peer_limit.min(self.table.max_capacity());
        if capacity != self.table.capacity() {
            let _ = self.table.set_capacity(capacity);
            self.pending_size_update = Some(capacity);
        }
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Encode a header block. Unlike QPACK, HPACK has no field section prefix.
    pub fn encode<B: BufExt + ?Sized>(
        &mut self,
        headers: &[(&[u8], &[u8])],
        out: &mut B,
    ) -> Result<(), Error> {
        if let Some(size) = self.pending_size_update.take() {
            // §6.3 Dynamic Table Size Update: 001xxxxx
            integer::put_integer(out, size as u64, 5, 0b0010_0000)?;
        }
        for &(name, value) in headers {
            self.encode_field(name, value, out)?;
        }
        Ok(())
    }

    fn encode_field<B: BufExt + ?Sized>(&mut self, name: &[u8], value: &[u8], out: &mut B) -> Result<(), Error> {
        let static_match = static_table::lookup(name, value);
        if let LookupResult::ExactMatch(idx) = static_match {
            // §6.1 Indexed Header Field: 1xxxxxxx
            return integer::put_integer(out, idx as u64, 7, 0b1000_0000);
        }
        let dynamic_match = self.table.find(name, value);
        if let Some(m) = dynamic_match
            && m.exact
        {
            return integer::put_integer(out, self.wire_index(m.absolute), 7, 0b1000_0000);
        }

        let name_index = match (static_match, dynamic_match) {
            (LookupResult::NameMatch(idx), _) => idx as u64,
            (_, Some(m)) => self.wire_index(m.absolute),
            _ => 0,
        };

        let sensitive = NEVER_INDEXED.iter().any(|n| *n == name);
        let index_it = !sensitive && entry_size(name, value) <= self.table.capacity() / 2;
        let (prefix, mask) = if index_it {
            // §6.2.1 Literal with Incremental Indexing: 01xxxxxx
            (6, 0b0100_0000)
        } else if sensitive {
            // §6.2.3 Literal Never Indexed: 0001xxxx
            (4, 0b0001_0000)
        } else {
            // §6.2.2 Literal without Indexing: 0000xxxx
            (4, 0b0000_0000)
        };
        integer::put_integer(out, name_index, prefix, mask)?;
        if name_index == 0 {
            self.put_string(name, out)?;
        }
        self.put_string(value, out)?;

        if index_it {
            self.table.insert(name, value)?;
        }
        Ok(())
    }

    /// HPACK index of a dynamic entry: 62 is the newest.
    fn wire_index(&self, absolute: u64) -> u64 {
        let relative = self.table.insert_count() - 1 - absolute;
        STATIC_TABLE.len() as u64 + 1 + relative
    }

    fn put_string<B: BufExt + ?Sized>(&self, s: &[u8], out: &mut B) -> Result<(), Error> {
        put_string(s, self.huffman, out)
    }
}

/// Write a string literal (§5.2), Huffman-coded when shorter.
pub fn put_string<B: BufExt + ?Sized>(s: &[u8], allow_huffman: bool, out: &mut B) -> Result<(), Error> {
    let coded_len = huffman::encoded_len(s);
    if allow_huffman && coded_len < s.len() {
        integer::put_integer(out, coded_len as u64, 7, 0x80)?;
        huffman::encode_into(s, out)
    } else {
        integer::put_integer(out, s.len() as u64, 7, 0x00)?;
        out.buf_extend_from_slice(s)
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Where a decoded string lives until it is emitted.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StrRef {
    Src(usize, usize),
    Scratch(usize, usize),
}

impl StrRef {
    pub(crate) fn resolve<'a>(self, src: &'a [u8], scratch: &'a [u8]) -> &'a [u8] {
        match self {
            StrRef::Src(a, b) => &src[a..b],
            StrRef::Scratch(a, b) => &scratch[a..b],
        }
    }
}

/// Read a string literal at `*pos` (H bit at `h_mask`, length prefix
/// `prefix_bits`). Huffman strings are decoded into `scratch`.
pub(crate) fn read_string(
    src: &[u8],
    pos: &mut usize,
    h_mask: u8,
    prefix_bits: u8,
    scratch: &mut Vec<u8>,
) -> Result<StrRef, Error> {
    let first = *src.get(*pos).ok_or(Error::HeaderBlock)?;
    let huffman = first & h_mask != 0;
    let len = integer::read_integer(src, pos, prefix_bits).map_err(|_| Error::HeaderBlock)? as usize;
    let start = *pos;
    let end = start.checked_add(len).filter(|&e| e <= src.len()).ok_or(Error::HeaderBlock)?;
    *pos = end;
    if huffman {
        let s = scratch.len();
        huffman::decode_into(&src[start..end], scratch)?;
        Ok(StrRef::Scratch(s, scratch.len()))
    } else {
        Ok(StrRef::Src(start, end))
    }
}

enum Name {
    Static(&'static [u8]),
    Dynamic(u64),
    Literal(StrRef),
}

#[derive(Debug)]
pub struct HpackDecoder {
    table: DynamicTable,
    scratch: Vec<u8>,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

impl HpackDecoder {
    /// `max_capacity` is the SETTINGS_HEADER_TABLE_SIZE we advertise.
    pub fn new(max_capacity: usize) -> Self {
        Self { table: DynamicTable::new(max_capacity), scratch: Vec::with_capacity(256) }
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Decode a complete header block, calling `emit(name, value)` per field.
    ///
    /// Returns the header list size (RFC 9113 §6.5.2), so the caller can
    /// enforce its limit after the table has been brought up to date. Any
    /// error leaves the table unusable: the connection must be torn down.
    pub fn decode<F>(&mut self, src: &[u8], mut emit: F) -> Result<usize, Error>
    where
        F: FnMut(&[u8], &[u8]),
    {
        let mut pos = 0;
        let mut list_size = 0;
        let mut fields_seen = false;

        while pos < src.len() {
            let first = src[pos];
            self.scratch.clear();

            if first & 0b1000_0000 != 0 {
                // §6.1 Indexed Header Field
                let index = integer::read_integer(src, &mut pos, 7)?;
                let (name, value) = match self.resolve(index)? {
                    Name::Static(_) => {
                        let e = static_table::get(index as usize).ok_or(Error::InvalidIndex { index })?;
                        (e.name, e.value)
                    }
                    Name::Dynamic(rel) => {
                        let e = self.table.get_relative(rel)?;
                        (e.name, e.value)
                    }
                    Name::Literal(_) => return Err(Error::InvalidIndex { index }),
                };
                list_size += entry_size(name, value);
                emit(name, value);
                fields_seen = true;
                continue;
            }

            if first & 0b1110_0000 == 0b0010_0000 {
                // §6.3 Dynamic Table Size Update, only before the first field (§4.2)
                if fields_seen {
                    return Err(Error::HeaderBlock);
                }
                let size = integer::read_integer(src, &mut pos, 5)?;
                self.table
                    .set_capacity(size as usize)
                    .map_err(|_| Error::HeaderBlock)?;
                continue;
            }

            let (prefix, indexing) = if first & 0b1100_0000 == 0b0100_0000 {
                (6, true) // §6.2.1 incremental indexing
            } else {
                (4, false) // §6.2.2 without indexing, §6.2.3 never indexed
            };
            let index = integer::read_integer(src, &mut pos, prefix)?;
            let name = if index == 0 {
                Name::Literal(read_string(src, &mut pos, 0x80, 7, &mut self.scratch)?)
            } else {
                self.resolve(index)?
            };
            let value_ref = read_string(src, &mut pos, 0x80, 7, &mut self.scratch)?;
            let value = value_ref.resolve(src, &self.scratch);

            let name_bytes: &[u8] = match &name {
                Name::Static(n) => n,
                Name::Dynamic(rel) => self.table.get_relative(*rel)?.name,
                Name::Literal(r) => r.resolve(src, &self.scratch),
            };
            list_size += entry_size(name_bytes, value);
            emit(name_bytes, value);
            fields_seen = true;

            if indexing {
                let inserted = match name {
                    Name::Dynamic(rel) => {
                        let absolute = self.table.insert_count() - 1 - rel;
                        self.table.insert_with_name_of(absolute, value)
                    }
                    Name::Static(n) => self.table.insert(n, value),
                    Name::Literal(r) => self.table.insert(r.resolve(src, &self.scratch), value),
                };
                // An entry larger than the table empties it (§4.4).
                if let Err(Error::TableCapacityExceeded) = inserted {
                    self.table.clear();
                } else {
                    inserted?;
                }
            }
        }

        Ok(list_size)
    }

    fn resolve(&self, index: u64) -> Result<Name, Error> {
        let static_len = STATIC_TABLE.len() as u64;
        match index {
            0 => Err(Error::InvalidIndex { index }),
            i if i <= static_len => Ok(Name::Static(STATIC_TABLE[(i - 1) as usize].name)),
            i => {
                let rel = i - static_len - 1;
                if rel >= self.table.len() as u64 {
                    return Err(Error::InvalidIndex { index });
                }
                Ok(Name::Dynamic(rel))
            }
        }
    }
}
