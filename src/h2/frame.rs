//! HTTP/2 frame codec (RFC 9113 §4).
//!
//! HTTP/2 frames have a fixed 9-byte header:
//! ```text
//!  +-----------------------------------------------+
//!  |                 Length (24)                   |
//!  +---------------+---------------+---------------+
//!  |   Type (8)    |   Flags (8)   |
//!  +-+-------------+---------------+---------------+
//!  |R|                Stream Identifier (31)       |
//!  +-+---------------------------------------------+
//!  |                Frame Payload (0...)         ...
//!  +-----------------------------------------------+
//! ```
//!
//! Decoding validates everything that can be checked without connection
//! state and reports violations with the RFC 9113 §7 code the connection
//! must close with. An incomplete frame is `BufferTooSmall`.

use crate::buf::BufExt;
use crate::error::{Error, H2Error};

pub const FRAME_HEADER_LEN: usize = 9;

/// SETTINGS_MAX_FRAME_SIZE initial value and lower bound.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
/// SETTINGS_MAX_FRAME_SIZE upper bound (2^24 - 1).
pub const MAX_FRAME_SIZE_LIMIT: u32 = 16_777_215;

// Frame type constants (RFC 9113 §6).
pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

// Flag bits.
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// HTTP/2 frame header (9 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2FrameHeader {
    /// 24-bit payload length.
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    /// 31-bit; the reserved bit is masked off.
    pub stream_id: u32,
}

/// Stream dependency and weight (RFC 9113 §5.3.2). `weight` is the wire
/// value, one less than the effective weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H2Priority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

impl H2Priority {
    /// Effective weight in 1..=256.
    pub const fn effective_weight(&self) -> u16 {
        self.weight as u16 + 1
    }

    fn decode(b: &[u8]) -> Self {
        Self {
            exclusive: b[0] & 0x80 != 0,
            dependency: u32::from_be_bytes([b[0] & 0x7f, b[1], b[2], b[3]]),
            weight: b[4],
        }
    }

    fn put<B: BufExt + ?Sized>(&self, out: &mut B) -> Result<(), Error> {
        let mut dep = self.dependency & 0x7fff_ffff;
        if self.exclusive {
            dep |= 0x8000_0000;
        }
        out.buf_extend_from_slice(&dep.to_be_bytes())?;
        out.buf_push(self.weight)
    }
}

/// Decoded HTTP/2 frame borrowing its payload from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H2Frame<'a> {
    Data {
        stream_id: u32,
        payload: &'a [u8],
        end_stream: bool,
        /// Bytes on the wire including padding; this is what flow control counts.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        fragment: &'a [u8],
        end_stream: bool,
        end_headers: bool,
        priority: Option<H2Priority>,
    },
    Priority {
        stream_id: u32,
        priority: H2Priority,
    },
    RstStream {
        stream_id: u32,
        error_code: u32,
    },
    Settings {
        ack: bool,
        params: &'a [u8],
    },
    PushPromise {
        stream_id: u32,
    },
    Ping {
        data: [u8; 8],
        ack: bool,
    },
    GoAway {
        last_stream_id: u32,
        error_code: u32,
        debug: &'a [u8],
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        fragment: &'a [u8],
        end_headers: bool,
    },
    /// Unknown frame type, discarded (RFC 9113 §4.1).
    Unknown {
        frame_type: u8,
        stream_id: u32,
    },
}

const fn protocol_error() -> Error {
    Error::Http2(H2Error::ProtocolError)
}

const fn frame_size_error() -> Error {
    Error::Http2(H2Error::FrameSizeError)
}

/// Decode a 9-byte frame header.
pub fn decode_frame_header(buf: &[u8]) -> Result<H2FrameHeader, Error> {
    let Some(b) = buf.get(..FRAME_HEADER_LEN) else {
        return Err(Error::BufferTooSmall { needed: FRAME_HEADER_LEN });
    };
    Ok(H2FrameHeader {
        length: u32::from_be_bytes([0, b[0], b[1], b[2]]),
        frame_type: b[3],
        flags: b[4],
        stream_id: u32::from_be_bytes([b[5] & 0x7f, b[6], b[7], b[8]]),
    })
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied. A payload longer
/// than `max_frame_size` (our SETTINGS_MAX_FRAME_SIZE) is a FRAME_SIZE_ERROR.
pub fn decode_frame(buf: &[u8], max_frame_size: u32) -> Result<(H2Frame<'_>, usize), Error> {
    let hdr = decode_frame_header(buf)?;
    if hdr.length > max_frame_size {
        return Err(frame_size_error());
    }
    let total = FRAME_HEADER_LEN + hdr.length as usize;
    let Some(payload) = buf.get(FRAME_HEADER_LEN..total) else {
        return Err(Error::BufferTooSmall { needed: total });
    };
    let sid = hdr.stream_id;
    let flags = hdr.flags;

    let frame = match hdr.frame_type {
        FRAME_DATA => {
            if sid == 0 {
                return Err(protocol_error());
            }
            H2Frame::Data {
                stream_id: sid,
                payload: strip_padding(payload, flags)?,
                end_stream: flags & FLAG_END_STREAM != 0,
                flow_len: hdr.length,
            }
        }
        FRAME_HEADERS => {
            if sid == 0 {
                return Err(protocol_error());
            }
            let data = strip_padding(payload, flags)?;
            let (priority, fragment) = if flags & FLAG_PRIORITY != 0 {
                if data.len() < 5 {
                    return Err(frame_size_error());
                }
                (Some(H2Priority::decode(data)), &data[5..])
            } else {
                (None, data)
            };
            H2Frame::Headers {
                stream_id: sid,
                fragment,
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
                priority,
            }
        }
        FRAME_PRIORITY => {
            if sid == 0 {
                return Err(protocol_error());
            }
            if payload.len() != 5 {
                return Err(frame_size_error());
            }
            H2Frame::Priority { stream_id: sid, priority: H2Priority::decode(payload) }
        }
        FRAME_RST_STREAM => {
            if sid == 0 {
                return Err(protocol_error());
            }
            if payload.len() != 4 {
                return Err(frame_size_error());
            }
            H2Frame::RstStream { stream_id: sid, error_code: be_u32(payload) }
        }
        FRAME_SETTINGS => {
            if sid != 0 {
                return Err(protocol_error());
            }
            let ack = flags & FLAG_ACK != 0;
            if (ack && !payload.is_empty()) || !payload.len().is_multiple_of(6) {
                return Err(frame_size_error());
            }
            H2Frame::Settings { ack, params: payload }
        }
        FRAME_PUSH_PROMISE => H2Frame::PushPromise { stream_id: sid },
        FRAME_PING => {
            if sid != 0 {
                return Err(protocol_error());
            }
            let data: [u8; 8] = payload.try_into().map_err(|_| frame_size_error())?;
            H2Frame::Ping { data, ack: flags & FLAG_ACK != 0 }
        }
        FRAME_GOAWAY => {
            if sid != 0 {
                return Err(protocol_error());
            }
            if payload.len() < 8 {
                return Err(frame_size_error());
            }
            H2Frame::GoAway {
                last_stream_id: be_u32(payload) & 0x7fff_ffff,
                error_code: be_u32(&payload[4..]),
                debug: &payload[8..],
            }
        }
        FRAME_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(frame_size_error());
            }
            H2Frame::WindowUpdate { stream_id: sid, increment: be_u32(payload) & 0x7fff_ffff }
        }
        FRAME_CONTINUATION => {
            if sid == 0 {
                return Err(protocol_error());
            }
            H2Frame::Continuation {
                stream_id: sid,
                fragment: payload,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        frame_type => H2Frame::Unknown { frame_type, stream_id: sid },
    };
    Ok((frame, total))
}

/// Write a frame header into the first [`FRAME_HEADER_LEN`] bytes of `dst`.
pub fn write_frame_header(dst: &mut [u8], frame_type: u8, flags: u8, stream_id: u32, length: usize) -> Result<(), Error> {
    if length > MAX_FRAME_SIZE_LIMIT as usize {
        return Err(frame_size_error());
    }
    let Some(hdr) = dst.get_mut(..FRAME_HEADER_LEN) else {
        return Err(Error::BufferTooSmall { needed: FRAME_HEADER_LEN });
    };
    hdr[..3].copy_from_slice(&(length as u32).to_be_bytes()[1..]);
    hdr[3] = frame_type;
    hdr[4] = flags;
    hdr[5..].copy_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    Ok(())
}

/// Append a frame header.
pub fn put_frame_header<B: BufExt + ?Sized>(
    out: &mut B,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
    length: usize,
) -> Result<(), Error> {
    if length > MAX_FRAME_SIZE_LIMIT as usize {
        return Err(frame_size_error());
    }
    let len = (length as u32).to_be_bytes();
    out.buf_extend_from_slice(&len[1..])?;
    out.buf_push(frame_type)?;
    out.buf_push(flags)?;
    out.buf_extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes())
}

/// Append an encoded frame. Padding is never produced.
pub fn put_frame<B: BufExt + ?Sized>(frame: &H2Frame<'_>, out: &mut B) -> Result<(), Error> {
    match *frame {
        H2Frame::Data { stream_id, payload, end_stream, .. } => {
            let flags = if end_stream { FLAG_END_STREAM } else { 0 };
            put_frame_header(out, FRAME_DATA, flags, stream_id, payload.len())?;
            out.buf_extend_from_slice(payload)
        }
        H2Frame::Headers { stream_id, fragment, end_stream, end_headers, priority } => {
            let mut flags = 0;
            if end_stream {
                flags |= FLAG_END_STREAM;
            }
            if end_headers {
                flags |= FLAG_END_HEADERS;
            }
            let extra = if priority.is_some() { 5 } else { 0 };
            if priority.is_some() {
                flags |= FLAG_PRIORITY;
            }
            put_frame_header(out, FRAME_HEADERS, flags, stream_id, extra + fragment.len())?;
            if let Some(p) = priority {
                p.put(out)?;
            }
            out.buf_extend_from_slice(fragment)
        }
        H2Frame::Priority { stream_id, priority } => {
            put_frame_header(out, FRAME_PRIORITY, 0, stream_id, 5)?;
            priority.put(out)
        }
        H2Frame::RstStream { stream_id, error_code } => {
            put_frame_header(out, FRAME_RST_STREAM, 0, stream_id, 4)?;
            out.buf_extend_from_slice(&error_code.to_be_bytes())
        }
        H2Frame::Settings { ack, params } => {
            let flags = if ack { FLAG_ACK } else { 0 };
            put_frame_header(out, FRAME_SETTINGS, flags, 0, params.len())?;
            out.buf_extend_from_slice(params)
        }
        H2Frame::Ping { data, ack } => {
            let flags = if ack { FLAG_ACK } else { 0 };
            put_frame_header(out, FRAME_PING, flags, 0, 8)?;
            out.buf_extend_from_slice(&data)
        }
        H2Frame::GoAway { last_stream_id, error_code, debug } => {
            put_frame_header(out, FRAME_GOAWAY, 0, 0, 8 + debug.len())?;
            out.buf_extend_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes())?;
            out.buf_extend_from_slice(&error_code.to_be_bytes())?;
            out.buf_extend_from_slice(debug)
        }
        H2Frame::WindowUpdate { stream_id, increment } => {
            put_frame_header(out, FRAME_WINDOW_UPDATE, 0, stream_id, 4)?;
            out.buf_extend_from_slice(&(increment & 0x7fff_ffff).to_be_bytes())
        }
        H2Frame::Continuation { stream_id, fragment, end_headers } => {
            let flags = if end_headers { FLAG_END_HEADERS } else { 0 };
            put_frame_header(out, FRAME_CONTINUATION, flags, stream_id, fragment.len())?;
            out.buf_extend_from_slice(fragment)
        }
        // A server never pushes and never emits unknown frame types.
        H2Frame::PushPromise { .. } | H2Frame::Unknown { .. } => Err(Error::InvalidState),
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn strip_padding(payload: &[u8], flags: u8) -> Result<&[u8], Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    let (&pad_len, rest) = payload.split_first().ok_or_else(frame_size_error)?;
    let pad_len = pad_len as usize;
    if pad_len > rest.len() {
        return Err(protocol_error());
    }
    Ok(&rest[..rest.len() - pad_len])
}

// SETTINGS identifiers (RFC 9113 §6.5.2).
pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Append one SETTINGS parameter (u16 id, u32 value).
pub fn put_setting<B: BufExt + ?Sized>(out: &mut B, id: u16, value: u32) -> Result<(), Error> {
    out.buf_extend_from_slice(&id.to_be_bytes())?;
    out.buf_extend_from_slice(&value.to_be_bytes())
}

/// Walk the parameters of a SETTINGS payload in order.
pub fn decode_settings_params<F>(payload: &[u8], mut emit: F) -> Result<(), Error>
where
    F: FnMut(u16, u32) -> Result<(), Error>,
{
    if !payload.len().is_multiple_of(6) {
        return Err(frame_size_error());
    }
    for param in payload.chunks_exact(6) {
        emit(u16::from_be_bytes([param[0], param[1]]), be_u32(&param[2..]))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = DEFAULT_MAX_FRAME_SIZE;

    fn encode(frame: &H2Frame<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        put_frame(frame, &mut out).unwrap();
        out
    }

    #[test]
    fn headers_with_priority_round_trip() {
        let priority = H2Priority { exclusive: true, dependency: 3, weight: 31 };
        let frame = H2Frame::Headers {
            stream_id: 5,
            fragment: b"\x82\x84",
            end_stream: true,
            end_headers: true,
            priority: Some(priority),
        };
        let wire = encode(&frame);
        assert_eq!(wire.len(), 9 + 5 + 2);
        let (decoded, used) = decode_frame(&wire, MAX).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(decoded, frame);
        assert_eq!(priority.effective_weight(), 32);
    }

    #[test]
    fn in_place_data_header_matches_appended_frame() {
        let payload = b"body bytes";
        let mut page = vec![0u8; FRAME_HEADER_LEN + payload.len()];
        page[FRAME_HEADER_LEN..].copy_from_slice(payload);
        write_frame_header(&mut page, FRAME_DATA, FLAG_END_STREAM, 7, payload.len()).unwrap();
        let appended = encode(&H2Frame::Data { stream_id: 7, payload, end_stream: true, flow_len: payload.len() as u32 });
        assert_eq!(page, appended);

        let mut short = [0u8; 4];
        assert!(write_frame_header(&mut short, FRAME_DATA, 0, 1, 0).is_err());
    }

    #[test]
    fn settings_wire_format() {
        let mut params = Vec::new();
        put_setting(&mut params, SETTINGS_MAX_CONCURRENT_STREAMS, 100).unwrap();
        let wire = encode(&H2Frame::Settings { ack: false, params: &params });
        assert_eq!(
            wire,
            [0, 0, 6, FRAME_SETTINGS, 0, 0, 0, 0, 0, 0x00, 0x03, 0, 0, 0, 100]
        );
        let mut seen = Vec::new();
        decode_settings_params(&params, |id, v| {
            seen.push((id, v));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, [(SETTINGS_MAX_CONCURRENT_STREAMS, 100)]);
    }

    #[test]
    fn padded_data_counts_padding_for_flow_control() {
        // len 6: pad length 2, "abc", 2 bytes padding
        let wire = [0, 0, 6, FRAME_DATA, FLAG_PADDED, 0, 0, 0, 1, 2, b'a', b'b', b'c', 0, 0];
        let (frame, used) = decode_frame(&wire, MAX).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(
            frame,
            H2Frame::Data { stream_id: 1, payload: b"abc", end_stream: false, flow_len: 6 }
        );
    }

    #[test]
    fn padding_longer_than_payload_is_protocol_error() {
        let wire = [0, 0, 2, FRAME_DATA, FLAG_PADDED, 0, 0, 0, 1, 5, b'a'];
        assert_eq!(decode_frame(&wire, MAX), Err(Error::Http2(H2Error::ProtocolError)));
    }

    #[test]
    fn stream_zero_rules() {
        let data_on_zero = [0, 0, 0, FRAME_DATA, 0, 0, 0, 0, 0];
        assert_eq!(decode_frame(&data_on_zero, MAX), Err(Error::Http2(H2Error::ProtocolError)));
        let ping_on_stream = [0, 0, 8, FRAME_PING, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_frame(&ping_on_stream, MAX), Err(Error::Http2(H2Error::ProtocolError)));
    }

    #[test]
    fn fixed_length_frames_checked() {
        let short_ping = [0, 0, 4, FRAME_PING, 0, 0, 0, 0, 0, 1, 2, 3, 4];
        assert_eq!(decode_frame(&short_ping, MAX), Err(Error::Http2(H2Error::FrameSizeError)));
        let settings_ack_with_body = [0, 0, 6, FRAME_SETTINGS, FLAG_ACK, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        assert_eq!(
            decode_frame(&settings_ack_with_body, MAX),
            Err(Error::Http2(H2Error::FrameSizeError))
        );
        let rst = [0, 0, 3, FRAME_RST_STREAM, 0, 0, 0, 0, 1, 0, 0, 0];
        assert_eq!(decode_frame(&rst, MAX), Err(Error::Http2(H2Error::FrameSizeError)));
    }

    #[test]
    fn oversized_frame_rejected_before_payload_arrives() {
        let hdr = [0, 0x40, 0x01, FRAME_DATA, 0, 0, 0, 0, 1];
        assert_eq!(decode_frame(&hdr, MAX), Err(Error::Http2(H2Error::FrameSizeError)));
    }

    #[test]
    fn incomplete_frame_asks_for_more() {
        assert_eq!(decode_frame(&[0, 0, 4], MAX), Err(Error::BufferTooSmall { needed: 9 }));
        let partial = [0, 0, 4, FRAME_WINDOW_UPDATE, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_frame(&partial, MAX), Err(Error::BufferTooSmall { needed: 13 }));
    }

    #[test]
    fn reserved_bits_masked() {
        let wire = [0, 0, 4, FRAME_WINDOW_UPDATE, 0, 0x80, 0, 0, 3, 0x80, 0, 0x10, 0];
        let (frame, _) = decode_frame(&wire, MAX).unwrap();
        assert_eq!(frame, H2Frame::WindowUpdate { stream_id: 3, increment: 0x1000 });
    }

    #[test]
    fn goaway_and_unknown() {
        let wire = encode(&H2Frame::GoAway { last_stream_id: 7, error_code: 3, debug: b"fc" });
        let (frame, _) = decode_frame(&wire, MAX).unwrap();
        assert_eq!(frame, H2Frame::GoAway { last_stream_id: 7, error_code: 3, debug: b"fc" });

        let unknown = [0, 0, 1, 0xfa, 0, 0, 0, 0, 0, 9];
        let (frame, used) = decode_frame(&unknown, MAX).unwrap();
        assert_eq!(frame, H2Frame::Unknown { frame_type: 0xfa, stream_id: 0 });
        assert_eq!(used, 10);
    }

    #[test]
    fn back_to_back_frames() {
        let mut wire = encode(&H2Frame::Ping { data: [1; 8], ack: true });
        wire.extend(encode(&H2Frame::RstStream { stream_id: 1, error_code: 8 }));
        let (first, n) = decode_frame(&wire, MAX).unwrap();
        assert_eq!(first, H2Frame::Ping { data: [1; 8], ack: true });
        let (second, m) = decode_frame(&wire[n..], MAX).unwrap();
        assert_eq!(second, H2Frame::RstStream { stream_id: 1, error_code: 8 });
        assert_eq!(n + m, wire.len());
    }
}
