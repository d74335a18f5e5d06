//! HTTP/1.1 response framing.
//!
//! The head is encoded once; body bytes are then pulled from the
//! [`BodySource`] straight into the caller's staging slice, with chunk
//! framing written around them in place.

use std::io;

use crate::http::Version;
use crate::http1::codec::{end_head, put_header, put_status_line};

use super::{BodySource, PreparedResponse};

/// Fixed-width chunk-size line: four hex digits and CRLF.
const CHUNK_HEAD: usize = 6;
const CHUNK_TAIL: usize = 2;
const MAX_CHUNK: usize = 0xffff;
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// What the response says about the connection after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirective {
    KeepAlive { timeout_s: u64, max: u32 },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Empty,
    Length { remaining: u64 },
    Chunked,
    /// HTTP/1.0 with an unknown length: the body ends when the connection does.
    UntilClose,
}

#[derive(Debug)]
pub struct Http1Framer {
    mode: Mode,
    done: bool,
}

impl Http1Framer {
    /// Encode the status line and headers into `out` and pick the body framing.
    pub fn encode_head(
        out: &mut Vec<u8>,
        version: Version,
        resp: &PreparedResponse,
        directive: ConnectionDirective,
    ) -> Self {
        let mode = match (&resp.body, resp.length) {
            (BodySource::Empty, _) => Mode::Empty,
            (_, Some(n)) => Mode::Length { remaining: n },
            (_, None) if version == Version::Http11 => Mode::Chunked,
            (_, None) => Mode::UntilClose,
        };
        let directive = if mode == Mode::UntilClose { ConnectionDirective::Close } else { directive };

        put_status_line(out, version, resp.status);
        for (name, value) in &resp.headers {
            put_header(out, name.as_bytes(), value.as_bytes());
        }
        if mode == Mode::Chunked {
            put_header(out, b"transfer-encoding", b"chunked");
        }
        match directive {
            ConnectionDirective::Close => put_header(out, b"connection", b"close"),
            ConnectionDirective::KeepAlive { timeout_s, max } => {
                if version == Version::Http10 {
                    put_header(out, b"connection", b"keep-alive");
                }
                put_header(out, b"keep-alive", format!("timeout={timeout_s}, max={max}").as_bytes());
            }
        }
        end_head(out);
        Self { mode, done: mode == Mode::Empty || mode == (Mode::Length { remaining: 0 }) }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The connection must close once this body is written.
    pub fn requires_close(&self) -> bool {
        self.mode == Mode::UntilClose
    }

    /// Bytes still owed for a fixed-length body, for transfers that bypass
    /// [`fill`](Self::fill) such as `sendfile`.
    pub fn remaining(&self) -> Option<u64> {
        match self.mode {
            Mode::Length { remaining } => Some(remaining),
            _ => None,
        }
    }

    /// Record `n` body bytes sent outside of `fill`.
    pub fn advance(&mut self, n: u64) {
        if let Mode::Length { remaining } = &mut self.mode {
            *remaining = remaining.saturating_sub(n);
            if *remaining == 0 {
                self.done = true;
            }
        }
    }

    /// Write the next framed piece of the body into `dst`. Returns the
    /// bytes written; 0 with `!is_done()` means `dst` is too small and the
    /// caller should flush first.
    pub fn fill(&mut self, body: &mut BodySource, dst: &mut [u8]) -> io::Result<usize> {
        if self.done {
            return Ok(0);
        }
        match self.mode {
            Mode::Empty => {
                self.done = true;
                Ok(0)
            }
            Mode::Length { remaining } => {
                let want = (dst.len() as u64).min(remaining) as usize;
                if want == 0 {
                    return Ok(0);
                }
                let n = body.read(&mut dst[..want])?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "body shorter than its length"));
                }
                self.advance(n as u64);
                Ok(n)
            }
            Mode::Chunked => {
                if dst.len() < CHUNK_HEAD + CHUNK_TAIL + 1 {
                    return Ok(0);
                }
                let cap = (dst.len() - CHUNK_HEAD - CHUNK_TAIL).min(MAX_CHUNK);
                let n = body.read(&mut dst[CHUNK_HEAD..CHUNK_HEAD + cap])?;
                if n == 0 {
                    dst[..LAST_CHUNK.len()].copy_from_slice(LAST_CHUNK);
                    self.done = true;
                    return Ok(LAST_CHUNK.len());
                }
                write_chunk_head(&mut dst[..CHUNK_HEAD], n);
                dst[CHUNK_HEAD + n..CHUNK_HEAD + n + CHUNK_TAIL].copy_from_slice(b"\r\n");
                Ok(CHUNK_HEAD + n + CHUNK_TAIL)
            }
            Mode::UntilClose => {
                let n = body.read(dst)?;
                if n == 0 {
                    self.done = true;
                }
                Ok(n)
            }
        }
    }
}

/// Four lower-case hex digits (leading zeros are valid chunk-size syntax).
fn write_chunk_head(dst: &mut [u8], len: usize) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for (i, shift) in [12, 8, 4, 0].into_iter().enumerate() {
        dst[i] = HEX[(len >> shift) & 0xf];
    }
    dst[4..6].copy_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use crate::pipeline::encoding::BodyReader;

    fn prepared(body: &[u8], length: Option<u64>) -> PreparedResponse {
        PreparedResponse {
            status: StatusCode::OK,
            headers: vec![("content-type".into(), "text/plain".to_string())],
            body: BodySource::Reader(BodyReader::identity(body.to_vec())),
            length,
        }
    }

    fn drain(framer: &mut Http1Framer, body: &mut BodySource, piece: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; piece];
        while !framer.is_done() {
            let n = framer.fill(body, &mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn fixed_length_head_and_body() {
        let mut resp = prepared(b"hello", Some(5));
        resp.headers.push(("content-length".into(), "5".to_string()));
        let mut head = Vec::new();
        let directive = ConnectionDirective::KeepAlive { timeout_s: 30, max: 100 };
        let mut framer = Http1Framer::encode_head(&mut head, Version::Http11, &resp, directive);
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n"));
        assert!(head.contains("keep-alive: timeout=30, max=100\r\n"));
        assert!(!head.contains("connection:"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(drain(&mut framer, &mut resp.body, 3), b"hello");
    }

    #[test]
    fn unknown_length_is_chunked_in_place() {
        let mut resp = prepared(&b"x".repeat(20), None);
        let mut head = Vec::new();
        let mut framer = Http1Framer::encode_head(&mut head, Version::Http11, &resp, ConnectionDirective::Close);
        let head = String::from_utf8(head).unwrap();
        assert!(head.contains("transfer-encoding: chunked\r\n"));
        assert!(head.contains("connection: close\r\n"));
        let wire = drain(&mut framer, &mut resp.body, 18);
        let expected = [&b"000a\r\nxxxxxxxxxx\r\n"[..], b"000a\r\nxxxxxxxxxx\r\n", b"0\r\n\r\n"].concat();
        assert_eq!(wire, expected);
    }

    #[test]
    fn http10_without_length_closes() {
        let mut resp = prepared(b"abc", None);
        let mut head = Vec::new();
        let directive = ConnectionDirective::KeepAlive { timeout_s: 5, max: 10 };
        let mut framer = Http1Framer::encode_head(&mut head, Version::Http10, &resp, directive);
        assert!(framer.requires_close());
        assert!(String::from_utf8(head).unwrap().contains("connection: close\r\n"));
        assert_eq!(drain(&mut framer, &mut resp.body, 64), b"abc");
    }

    #[test]
    fn http10_keep_alive_is_explicit() {
        let resp = PreparedResponse {
            status: StatusCode::NO_CONTENT,
            headers: Vec::new(),
            body: BodySource::Empty,
            length: None,
        };
        let mut head = Vec::new();
        let directive = ConnectionDirective::KeepAlive { timeout_s: 5, max: 10 };
        let framer = Http1Framer::encode_head(&mut head, Version::Http10, &resp, directive);
        assert!(framer.is_done());
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.0 204 No Content\r\n"));
        assert!(head.contains("connection: keep-alive\r\n"));
    }

    #[test]
    fn short_body_is_an_error() {
        let mut resp = prepared(b"abc", Some(10));
        let mut head = Vec::new();
        let mut framer = Http1Framer::encode_head(&mut head, Version::Http11, &resp, ConnectionDirective::Close);
        let mut buf = [0u8; 64];
        assert_eq!(framer.fill(&mut resp.body, &mut buf).unwrap(), 3);
        assert!(framer.fill(&mut resp.body, &mut buf).is_err());
    }

    #[test]
    fn tiny_staging_asks_for_flush() {
        let mut resp = prepared(b"abc", None);
        let mut head = Vec::new();
        let mut framer = Http1Framer::encode_head(&mut head, Version::Http11, &resp, ConnectionDirective::Close);
        let mut buf = [0u8; 8];
        assert_eq!(framer.fill(&mut resp.body, &mut buf).unwrap(), 0);
        assert!(!framer.is_done());
    }
}
