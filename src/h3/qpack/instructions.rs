//! QPACK encoder- and decoder-stream instructions (RFC 9204 §4.3, §4.4).
//!
//! Parsers return `Ok(None)` when the instruction is not complete yet; the
//! caller keeps the unconsumed bytes and retries once more stream data has
//! arrived.

use crate::buf::BufExt;
use crate::error::{Error, H3Error};
use crate::hpack::codec::{StrRef, put_string};
use crate::hpack::{huffman, integer};

/// Instruction sent on the encoder stream.
#[derive(Debug, Clone, Copy)]
pub(crate) enum EncoderInstruction {
    SetCapacity(u64),
    InsertWithNameRef { is_static: bool, index: u64, value: StrRef },
    InsertWithLiteralName { name: StrRef, value: StrRef },
    Duplicate(u64),
}

/// Instruction sent on the decoder stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderInstruction {
    SectionAck(u64),
    StreamCancel(u64),
    InsertCountIncrement(u64),
}

fn int(src: &[u8], pos: &mut usize, prefix: u8, err: H3Error) -> Result<Option<u64>, Error> {
    match integer::read_integer(src, pos, prefix) {
        Ok(v) => Ok(Some(v)),
        Err(Error::BufferTooSmall { .. }) => Ok(None),
        Err(_) => Err(Error::Http3(err)),
    }
}

fn string(
    src: &[u8],
    pos: &mut usize,
    h_mask: u8,
    prefix: u8,
    scratch: &mut Vec<u8>,
    err: H3Error,
) -> Result<Option<StrRef>, Error> {
    let Some(&first) = src.get(*pos) else { return Ok(None) };
    let Some(len) = int(src, pos, prefix, err)? else { return Ok(None) };
    let start = *pos;
    let Some(end) = start.checked_add(len as usize).filter(|&e| e <= src.len()) else {
        return Ok(None);
    };
    *pos = end;
    if first & h_mask != 0 {
        let s = scratch.len();
        huffman::decode_into(&src[start..end], scratch).map_err(|_| Error::Http3(err))?;
        Ok(Some(StrRef::Scratch(s, scratch.len())))
    } else {
        Ok(Some(StrRef::Src(start, end)))
    }
}

/// Parse one encoder-stream instruction. Huffman strings land in `scratch`.
pub(crate) fn parse_encoder_instruction(
    src: &[u8],
    scratch: &mut Vec<u8>,
) -> Result<Option<(EncoderInstruction, usize)>, Error> {
    const ERR: H3Error = H3Error::QpackEncoderStreamError;
    let Some(&first) = src.first() else { return Ok(None) };
    let mut pos = 0;
    let instr = if first & 0x80 != 0 {
        // 1Txxxxxx: Insert With Name Reference
        let is_static = first & 0x40 != 0;
        let Some(index) = int(src, &mut pos, 6, ERR)? else { return Ok(None) };
        let Some(value) = string(src, &mut pos, 0x80, 7, scratch, ERR)? else { return Ok(None) };
        EncoderInstruction::InsertWithNameRef { is_static, index, value }
    } else if first & 0x40 != 0 {
        // 01Hxxxxx: Insert With Literal Name
        let Some(name) = string(src, &mut pos, 0x20, 5, scratch, ERR)? else { return Ok(None) };
        let Some(value) = string(src, &mut pos, 0x80, 7, scratch, ERR)? else { return Ok(None) };
        EncoderInstruction::InsertWithLiteralName { name, value }
    } else if first & 0x20 != 0 {
        // 001xxxxx: Set Dynamic Table Capacity
        let Some(cap) = int(src, &mut pos, 5, ERR)? else { return Ok(None) };
        EncoderInstruction::SetCapacity(cap)
    } else {
        // 000xxxxx: Duplicate
        let Some(index) = int(src, &mut pos, 5, ERR)? else { return Ok(None) };
        EncoderInstruction::Duplicate(index)
    };
    Ok(Some((instr, pos)))
}

/// Parse one decoder-stream instruction.
pub fn parse_decoder_instruction(src: &[u8]) -> Result<Option<(DecoderInstruction, usize)>, Error> {
    const ERR: H3Error = H3Error::QpackDecoderStreamError;
    let Some(&first) = src.first() else { return Ok(None) };
    let mut pos = 0;
    let instr = if first & 0x80 != 0 {
        let Some(id) = int(src, &mut pos, 7, ERR)? else { return Ok(None) };
        DecoderInstruction::SectionAck(id)
    } else if first & 0x40 != 0 {
        let Some(id) = int(src, &mut pos, 6, ERR)? else { return Ok(None) };
        DecoderInstruction::StreamCancel(id)
    } else {
        let Some(inc) = int(src, &mut pos, 6, ERR)? else { return Ok(None) };
        if inc == 0 {
            return Err(Error::Http3(ERR));
        }
        DecoderInstruction::InsertCountIncrement(inc)
    };
    Ok(Some((instr, pos)))
}

pub fn put_set_capacity<B: BufExt + ?Sized>(out: &mut B, capacity: u64) -> Result<(), Error> {
    integer::put_integer(out, capacity, 5, 0x20)
}

pub fn put_insert_with_name_ref<B: BufExt + ?Sized>(
    out: &mut B,
    is_static: bool,
    index: u64,
    value: &[u8],
    huffman: bool,
) -> Result<(), Error> {
    integer::put_integer(out, index, 6, if is_static { 0xc0 } else { 0x80 })?;
    put_string(value, huffman, out)
}

pub fn put_insert_with_literal_name<B: BufExt + ?Sized>(
    out: &mut B,
    name: &[u8],
    value: &[u8],
    huffman: bool,
) -> Result<(), Error> {
    put_prefixed_string(out, name, 0x40, 0x20, 5, huffman)?;
    put_string(value, huffman, out)
}

pub fn put_duplicate<B: BufExt + ?Sized>(out: &mut B, relative: u64) -> Result<(), Error> {
    integer::put_integer(out, relative, 5, 0x00)
}

pub fn put_decoder_instruction<B: BufExt + ?Sized>(
    out: &mut B,
    instr: DecoderInstruction,
) -> Result<(), Error> {
    match instr {
        DecoderInstruction::SectionAck(id) => integer::put_integer(out, id, 7, 0x80),
        DecoderInstruction::StreamCancel(id) => integer::put_integer(out, id, 6, 0x40),
        DecoderInstruction::InsertCountIncrement(n) => integer::put_integer(out, n, 6, 0x00),
    }
}

/// String whose length prefix shares its first byte with pattern bits.
pub(crate) fn put_prefixed_string<B: BufExt + ?Sized>(
    out: &mut B,
    s: &[u8],
    pattern: u8,
    h_bit: u8,
    prefix: u8,
    allow_huffman: bool,
) -> Result<(), Error> {
    let coded = huffman::encoded_len(s);
    if allow_huffman && coded < s.len() {
        integer::put_integer(out, coded as u64, prefix, pattern | h_bit)?;
        huffman::encode_into(s, out)
    } else {
        integer::put_integer(out, s.len() as u64, prefix, pattern)?;
        out.buf_extend_from_slice(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_instructions_parse_back() {
        let mut out = Vec::new();
        put_set_capacity(&mut out, 220).unwrap();
        put_insert_with_name_ref(&mut out, true, 0, b"www.example.com", true).unwrap();
        put_insert_with_literal_name(&mut out, b"custom-key", b"custom-value", false).unwrap();
        put_duplicate(&mut out, 1).unwrap();

        let mut scratch = Vec::new();
        let mut pos = 0;
        let mut seen = Vec::new();
        while let Some((instr, n)) = parse_encoder_instruction(&out[pos..], &mut scratch).unwrap() {
            let base = &out[pos..];
            match instr {
                EncoderInstruction::SetCapacity(c) => seen.push(format!("cap {c}")),
                EncoderInstruction::InsertWithNameRef { is_static, index, value } => {
                    let v = value.resolve(base, &scratch);
                    seen.push(format!("ref {is_static} {index} {}", String::from_utf8_lossy(v)));
                }
                EncoderInstruction::InsertWithLiteralName { name, value } => {
                    let (n, v) = (name.resolve(base, &scratch), value.resolve(base, &scratch));
                    seen.push(format!("lit {} {}", String::from_utf8_lossy(n), String::from_utf8_lossy(v)));
                }
                EncoderInstruction::Duplicate(i) => seen.push(format!("dup {i}")),
            }
            pos += n;
        }
        assert_eq!(pos, out.len());
        assert_eq!(
            seen,
            ["cap 220", "ref true 0 www.example.com", "lit custom-key custom-value", "dup 1"]
        );
    }

    #[test]
    fn rfc9204_b2_encoder_stream_bytes() {
        // 3fbd01: Set Dynamic Table Capacity=220
        // c00f7777772e6578616d706c652e636f6d: insert name ref static 0
        let mut out = Vec::new();
        put_set_capacity(&mut out, 220).unwrap();
        put_insert_with_name_ref(&mut out, true, 0, b"www.example.com", false).unwrap();
        assert_eq!(&out[..3], &[0x3f, 0xbd, 0x01]);
        assert_eq!(&out[3..5], &[0xc0, 0x0f]);
    }

    #[test]
    fn incomplete_instruction_waits_for_more() {
        let mut out = Vec::new();
        put_insert_with_literal_name(&mut out, b"name", b"value", false).unwrap();
        let mut scratch = Vec::new();
        for cut in 0..out.len() {
            assert!(parse_encoder_instruction(&out[..cut], &mut scratch).unwrap().is_none());
        }
        assert!(parse_encoder_instruction(&out, &mut scratch).unwrap().is_some());
    }

    #[test]
    fn decoder_instructions() {
        let mut out = Vec::new();
        for i in [
            DecoderInstruction::SectionAck(4),
            DecoderInstruction::StreamCancel(8),
            DecoderInstruction::InsertCountIncrement(2),
        ] {
            put_decoder_instruction(&mut out, i).unwrap();
        }
        assert_eq!(out, [0x84, 0x48, 0x02]);
        let (i, n) = parse_decoder_instruction(&out).unwrap().unwrap();
        assert_eq!((i, n), (DecoderInstruction::SectionAck(4), 1));
        assert_eq!(
            parse_decoder_instruction(&[0x00]),
            Err(Error::Http3(H3Error::QpackDecoderStreamError))
        );
    }
}
