//! HTTP/3 frame types and encode/decode (RFC 9114 §7).
//!
//! HTTP/3 frames are carried on QUIC streams and use a simple TLV format:
//!
//! ```text
//! Frame {
//!   Type (varint),
//!   Length (varint),
//!   Payload (..)
//! }
//! ```
//!
//! Decoding reports `BufferTooSmall` for a frame that has not fully arrived,
//! so stream readers keep the bytes and retry.

use crate::buf::BufExt;
use crate::error::{Error, H3Error};
use crate::varint::{decode_varint, encode_varint, varint_len};

use super::{
    H3Settings, SETTINGS_MAX_FIELD_SECTION_SIZE, SETTINGS_QPACK_BLOCKED_STREAMS,
    SETTINGS_QPACK_MAX_TABLE_CAPACITY,
};

// HTTP/3 frame type codes (RFC 9114 §7.2, RFC 9218 §7.2).
pub const H3_FRAME_DATA: u64 = 0x00;
pub const H3_FRAME_HEADERS: u64 = 0x01;
const H3_FRAME_CANCEL_PUSH: u64 = 0x03;
const H3_FRAME_SETTINGS: u64 = 0x04;
const H3_FRAME_PUSH_PROMISE: u64 = 0x05;
const H3_FRAME_GOAWAY: u64 = 0x07;
const H3_FRAME_MAX_PUSH_ID: u64 = 0x0d;
const H3_FRAME_PRIORITY_UPDATE: u64 = 0xf0700;

/// HTTP/2 frame types that are reserved in HTTP/3 and must not be sent.
const H2_ONLY_FRAMES: [u64; 4] = [0x02, 0x06, 0x08, 0x09];

/// HTTP/2 settings identifiers reserved in HTTP/3 (§7.2.4.1).
const H2_ONLY_SETTINGS: [u64; 4] = [0x02, 0x03, 0x04, 0x05];

/// HTTP/3 frame (carried on QUIC streams, not QUIC frames).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H3Frame<'a> {
    Data(&'a [u8]),
    /// QPACK-encoded field section.
    Headers(&'a [u8]),
    CancelPush(u64),
    Settings(H3Settings),
    /// Only a server may send PUSH_PROMISE; seeing one is an error.
    PushPromise,
    GoAway(u64),
    MaxPushId(u64),
    /// RFC 9218 PRIORITY_UPDATE for a request stream.
    PriorityUpdate { stream_id: u64, value: &'a [u8] },
    /// Unknown or reserved frame type, to be ignored (§7.2.8).
    Unknown(u64),
}

/// Decode a single HTTP/3 frame from a buffer.
///
/// Returns `(frame, bytes_consumed)` on success.
pub fn decode_h3_frame(buf: &[u8]) -> Result<(H3Frame<'_>, usize), Error> {
    let (frame_type, payload_len, header_len) = decode_frame_header(buf)?;
    let payload_len = payload_len as usize;
    let rest = &buf[header_len..];
    if rest.len() < payload_len {
        return Err(Error::BufferTooSmall { needed: header_len + payload_len });
    }
    let payload = &rest[..payload_len];

    let frame = match frame_type {
        H3_FRAME_DATA => H3Frame::Data(payload),
        H3_FRAME_HEADERS => H3Frame::Headers(payload),
        H3_FRAME_CANCEL_PUSH => H3Frame::CancelPush(single_varint(payload)?),
        H3_FRAME_SETTINGS => H3Frame::Settings(decode_settings(payload)?),
        H3_FRAME_PUSH_PROMISE => H3Frame::PushPromise,
        H3_FRAME_GOAWAY => H3Frame::GoAway(single_varint(payload)?),
        H3_FRAME_MAX_PUSH_ID => H3Frame::MaxPushId(single_varint(payload)?),
        H3_FRAME_PRIORITY_UPDATE => {
            let (stream_id, n) = decode_varint(payload).map_err(|_| Error::Http3(H3Error::FrameError))?;
            H3Frame::PriorityUpdate { stream_id, value: &payload[n..] }
        }
        t if H2_ONLY_FRAMES.contains(&t) => return Err(Error::Http3(H3Error::FrameUnexpected)),
        t => H3Frame::Unknown(t),
    };

    Ok((frame, header_len + payload_len))
}

/// Decode only the type and length. Returns `(type, payload_len, header_len)`.
pub fn decode_frame_header(buf: &[u8]) -> Result<(u64, u64, usize), Error> {
    let (frame_type, type_len) = decode_varint(buf)?;
    let (payload_len, len_len) = decode_varint(&buf[type_len..])
        .map_err(|e| match e {
            Error::BufferTooSmall { needed } => Error::BufferTooSmall { needed: type_len + needed },
            other => other,
        })?;
    Ok((frame_type, payload_len, type_len + len_len))
}

/// Largest DATA frame header: type byte and an 8-byte length.
pub const DATA_HEADER_MAX: usize = 9;

/// Write the header of a DATA frame carrying `len` bytes into `dst` so that
/// it ends at `DATA_HEADER_MAX`, where the payload already sits. Returns
/// the offset the frame starts at.
pub fn write_data_header(dst: &mut [u8], len: u64) -> Result<usize, Error> {
    let Some(room) = dst.get_mut(..DATA_HEADER_MAX) else {
        return Err(Error::BufferTooSmall { needed: DATA_HEADER_MAX });
    };
    let start = DATA_HEADER_MAX - varint_len(H3_FRAME_DATA) - varint_len(len);
    let n = encode_varint(H3_FRAME_DATA, &mut room[start..])?;
    encode_varint(len, &mut room[start + n..])?;
    Ok(start)
}

/// Append a frame header (type + length).
pub fn put_frame_header<B: BufExt + ?Sized>(out: &mut B, frame_type: u64, len: u64) -> Result<(), Error> {
    out.buf_put_varint(frame_type)?;
    out.buf_put_varint(len)
}

/// Append an encoded frame.
pub fn put_h3_frame<B: BufExt + ?Sized>(frame: &H3Frame<'_>, out: &mut B) -> Result<(), Error> {
    match frame {
        H3Frame::Data(data) => put_simple_frame(out, H3_FRAME_DATA, data),
        H3Frame::Headers(block) => put_simple_frame(out, H3_FRAME_HEADERS, block),
        H3Frame::CancelPush(id) => put_varint_frame(out, H3_FRAME_CANCEL_PUSH, *id),
        H3Frame::Settings(settings) => put_settings_frame(out, settings),
        H3Frame::GoAway(id) => put_varint_frame(out, H3_FRAME_GOAWAY, *id),
        H3Frame::MaxPushId(id) => put_varint_frame(out, H3_FRAME_MAX_PUSH_ID, *id),
        H3Frame::PriorityUpdate { stream_id, value } => {
            put_frame_header(out, H3_FRAME_PRIORITY_UPDATE, (varint_len(*stream_id) + value.len()) as u64)?;
            out.buf_put_varint(*stream_id)?;
            out.buf_extend_from_slice(value)
        }
        // Receive-only.
        H3Frame::PushPromise | H3Frame::Unknown(_) => Err(Error::InvalidState),
    }
}

fn single_varint(payload: &[u8]) -> Result<u64, Error> {
    match decode_varint(payload) {
        Ok((v, n)) if n == payload.len() => Ok(v),
        _ => Err(Error::Http3(H3Error::FrameError)),
    }
}

fn put_simple_frame<B: BufExt + ?Sized>(out: &mut B, frame_type: u64, payload: &[u8]) -> Result<(), Error> {
    put_frame_header(out, frame_type, payload.len() as u64)?;
    out.buf_extend_from_slice(payload)
}

fn put_varint_frame<B: BufExt + ?Sized>(out: &mut B, frame_type: u64, value: u64) -> Result<(), Error> {
    put_frame_header(out, frame_type, varint_len(value) as u64)?;
    out.buf_put_varint(value)
}

fn settings_pairs(settings: &H3Settings) -> impl Iterator<Item = (u64, u64)> {
    [
        (SETTINGS_MAX_FIELD_SECTION_SIZE, settings.max_field_section_size),
        (SETTINGS_QPACK_MAX_TABLE_CAPACITY, settings.qpack_max_table_capacity),
        (SETTINGS_QPACK_BLOCKED_STREAMS, settings.qpack_blocked_streams),
    ]
    .into_iter()
    .filter_map(|(id, v)| v.map(|v| (id, v)))
}

fn put_settings_frame<B: BufExt + ?Sized>(out: &mut B, settings: &H3Settings) -> Result<(), Error> {
    let len: usize = settings_pairs(settings).map(|(id, v)| varint_len(id) + varint_len(v)).sum();
    put_frame_header(out, H3_FRAME_SETTINGS, len as u64)?;
    for (id, v) in settings_pairs(settings) {
        out.buf_put_varint(id)?;
        out.buf_put_varint(v)?;
    }
    Ok(())
}

/// Decode the payload of a SETTINGS frame into an [`H3Settings`].
///
/// Unknown identifiers are ignored; duplicates and HTTP/2-only identifiers
/// are a SETTINGS_ERROR (§7.2.4).
fn decode_settings(mut payload: &[u8]) -> Result<H3Settings, Error> {
    const ERR: Error = Error::Http3(H3Error::SettingsError);
    let mut settings = H3Settings::default();

    while !payload.is_empty() {
        let (id, id_len) = decode_varint(payload).map_err(|_| ERR)?;
        payload = &payload[id_len..];
        let (value, val_len) = decode_varint(payload).map_err(|_| ERR)?;
        payload = &payload[val_len..];

        let slot = match id {
            SETTINGS_MAX_FIELD_SECTION_SIZE => &mut settings.max_field_section_size,
            SETTINGS_QPACK_MAX_TABLE_CAPACITY => &mut settings.qpack_max_table_capacity,
            SETTINGS_QPACK_BLOCKED_STREAMS => &mut settings.qpack_blocked_streams,
            id if H2_ONLY_SETTINGS.contains(&id) => return Err(ERR),
            _ => continue,
        };
        if slot.replace(value).is_some() {
            return Err(ERR);
        }
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &H3Frame<'_>) {
        let mut buf: heapless::Vec<u8, 512> = heapless::Vec::new();
        put_h3_frame(frame, &mut buf).expect("encode failed");
        let (decoded, consumed) = decode_h3_frame(&buf).expect("decode failed");
        assert_eq!(consumed, buf.len(), "consumed != written");
        assert_eq!(&decoded, frame, "roundtrip mismatch");
    }

    #[test]
    fn data_header_written_in_front_of_payload() {
        for len in [0usize, 5, 63, 64, 16_383, 16_384] {
            let mut page = vec![0xaa; DATA_HEADER_MAX + len];
            let start = write_data_header(&mut page, len as u64).unwrap();
            let mut appended = Vec::new();
            put_h3_frame(&H3Frame::Data(&page[DATA_HEADER_MAX..]), &mut appended).unwrap();
            assert_eq!(&page[start..], &appended[..], "len {len}");
        }
        assert!(write_data_header(&mut [0u8; 4], 1).is_err());
    }

    #[test]
    fn roundtrip_data_and_headers() {
        roundtrip(&H3Frame::Data(b"Hello, HTTP/3!"));
        roundtrip(&H3Frame::Data(b""));
        roundtrip(&H3Frame::Headers(b"\x00\x00\xd1\xd7"));
    }

    #[test]
    fn roundtrip_control_frames() {
        roundtrip(&H3Frame::GoAway(4));
        roundtrip(&H3Frame::GoAway((1 << 62) - 1));
        roundtrip(&H3Frame::MaxPushId(7));
        roundtrip(&H3Frame::CancelPush(42));
        roundtrip(&H3Frame::PriorityUpdate { stream_id: 8, value: b"u=1, i" });
    }

    #[test]
    fn roundtrip_settings() {
        roundtrip(&H3Frame::Settings(H3Settings {
            max_field_section_size: Some(8192),
            qpack_max_table_capacity: Some(4096),
            qpack_blocked_streams: Some(100),
        }));
        roundtrip(&H3Frame::Settings(H3Settings::default()));
    }

    #[test]
    fn settings_unknown_identifiers_ignored() {
        // SETTINGS with a GREASE id (0x21) and QPACK_BLOCKED_STREAMS=5.
        let bytes = [0x04, 0x05, 0x40, 0x21, 0x01, 0x07, 0x05];
        let (frame, _) = decode_h3_frame(&bytes).unwrap();
        assert_eq!(
            frame,
            H3Frame::Settings(H3Settings { qpack_blocked_streams: Some(5), ..Default::default() })
        );
    }

    #[test]
    fn settings_duplicates_and_h2_identifiers_rejected() {
        let dup = [0x04, 0x04, 0x07, 0x01, 0x07, 0x02];
        assert_eq!(decode_h3_frame(&dup), Err(Error::Http3(H3Error::SettingsError)));
        let h2 = [0x04, 0x02, 0x04, 0x10];
        assert_eq!(decode_h3_frame(&h2), Err(Error::Http3(H3Error::SettingsError)));
    }

    #[test]
    fn truncated_frames_need_more() {
        assert!(matches!(decode_h3_frame(&[]), Err(Error::BufferTooSmall { .. })));
        assert!(matches!(decode_h3_frame(&[0x00]), Err(Error::BufferTooSmall { .. })));
        assert_eq!(decode_h3_frame(&[0x00, 0x05, b'a']), Err(Error::BufferTooSmall { needed: 7 }));
    }

    #[test]
    fn goaway_extra_payload_rejected() {
        assert_eq!(decode_h3_frame(&[0x07, 0x02, 0x04, 0x00]), Err(Error::Http3(H3Error::FrameError)));
    }

    #[test]
    fn reserved_h2_frame_types_rejected_unknown_skipped() {
        // HTTP/2 PRIORITY (0x02) is reserved.
        assert_eq!(decode_h3_frame(&[0x02, 0x00]), Err(Error::Http3(H3Error::FrameUnexpected)));
        // Grease frame type 0x21 with a 3-byte payload.
        let (frame, n) = decode_h3_frame(&[0x40, 0x21, 0x03, 1, 2, 3]).unwrap();
        assert_eq!((frame, n), (H3Frame::Unknown(0x21), 6));
    }

    #[test]
    fn multiple_frames_in_buffer() {
        let mut buf = Vec::new();
        put_h3_frame(&H3Frame::Headers(b"\x00\x00\xd1"), &mut buf).unwrap();
        put_h3_frame(&H3Frame::Data(b"body"), &mut buf).unwrap();
        let (first, n) = decode_h3_frame(&buf).unwrap();
        assert_eq!(first, H3Frame::Headers(b"\x00\x00\xd1"));
        let (second, m) = decode_h3_frame(&buf[n..]).unwrap();
        assert_eq!(second, H3Frame::Data(b"body"));
        assert_eq!(n + m, buf.len());
    }
}
