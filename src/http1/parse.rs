//! Zero-copy HTTP/1.1 request parser (RFC 9112).
//!
//! Nothing is copied out of the read buffer: the request line and every
//! header are recorded as [`Slice`] offsets into it. An incomplete input
//! yields `Err(Error::WouldBlock)`; a malformed one a stream error the
//! codec re-tags with the request's sequence number.

use crate::error::{Error, StreamFault};
use crate::http::header::{self, HeaderSlice, Slice, eq_ignore_case, has_list_token};
use crate::http::{Method, Version};

/// Most header fields accepted in one request.
pub const MAX_HEADERS: usize = 64;

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

/// A parsed request head. Slices are relative to the buffer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHead {
    pub method: Method,
    pub path: Slice,
    pub version: Version,
    pub headers: heapless::Vec<HeaderSlice, MAX_HEADERS>,
    pub framing: BodyFraming,
    /// `Connection: close`, or HTTP/1.0 without `Connection: keep-alive`.
    pub close: bool,
    pub expect_continue: bool,
    /// Bytes up to and including the blank line.
    pub len: usize,
}

pub(crate) fn malformed() -> Error {
    Error::stream(0, StreamFault::Malformed)
}

/// Offset just past the `\r\n\r\n` ending the header section.
pub fn find_end_of_headers(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a request line: `METHOD SP request-target SP HTTP/1.x CRLF`.
///
/// Returns `(method, path, version, consumed)`; `path` is relative to `buf`.
pub fn parse_request_line(buf: &[u8]) -> Result<(Method, Slice, Version, usize), Error> {
    let line_end = find_crlf(buf).ok_or(Error::WouldBlock)?;
    let line = &buf[..line_end];

    let (method, method_len) = Method::from_request_line(line).ok_or_else(malformed)?;
    let target_start = method_len + 1;
    let rest = line.get(target_start..).ok_or_else(malformed)?;
    let sp = rest.iter().position(|&b| b == b' ').ok_or_else(malformed)?;
    let target = &rest[..sp];
    if target.is_empty() || target.iter().any(|&b| b <= b' ' || b == 0x7f) {
        return Err(malformed());
    }
    let version = match &rest[sp + 1..] {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        _ => return Err(malformed()),
    };
    Ok((method, Slice::new(target_start, sp), version, line_end + 2))
}

/// Parse one `name: value CRLF` field line starting at `base` in `buf`.
///
/// Returns `None` for the blank line that ends the section, otherwise the
/// field's offsets. Either way the second element is the bytes consumed.
pub fn parse_header_line(buf: &[u8], base: usize) -> Result<(Option<HeaderSlice>, usize), Error> {
    let rest = buf.get(base..).ok_or(Error::WouldBlock)?;
    let line_end = find_crlf(rest).ok_or(Error::WouldBlock)?;
    if line_end == 0 {
        return Ok((None, 2));
    }
    let line = &rest[..line_end];
    // obs-fold is rejected (RFC 9112 §5.2).
    if line[0] == b' ' || line[0] == b'\t' {
        return Err(malformed());
    }
    let colon = line.iter().position(|&b| b == b':').ok_or_else(malformed)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_tchar(b)) {
        return Err(malformed());
    }
    let raw = &line[colon + 1..];
    let value = header::trim_ows(raw);
    if value.iter().any(|&b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(malformed());
    }
    let lead = raw.len() - raw.iter().skip_while(|&&b| b == b' ' || b == b'\t').count();
    let slice = HeaderSlice {
        name: Slice::new(base, colon),
        value: Slice::new(base + colon + 1 + lead, value.len()),
    };
    Ok((Some(slice), line_end + 2))
}

/// Parse a complete request head from the front of `buf`.
///
/// `max_bytes` bounds the head: a longer one is `HeaderTooLarge` even
/// before its end is seen.
pub fn parse_head(buf: &[u8], max_bytes: usize) -> Result<ParsedHead, Error> {
    let Some(end) = find_end_of_headers(buf) else {
        if buf.len() > max_bytes {
            return Err(Error::stream(0, StreamFault::HeaderTooLarge));
        }
        return Err(Error::WouldBlock);
    };
    if end > max_bytes {
        return Err(Error::stream(0, StreamFault::HeaderTooLarge));
    }
    let head = &buf[..end];
    let (method, path, version, mut pos) = parse_request_line(head)?;

    let mut headers = heapless::Vec::new();
    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut transfer_encoding = false;
    let mut close = version == Version::Http10;
    let mut expect_continue = false;
    loop {
        let (field, used) = parse_header_line(head, pos)?;
        pos += used;
        let Some(field) = field else { break };
        let name = field.name.get(head);
        let value = field.value.get(head);
        if eq_ignore_case(name, header::CONTENT_LENGTH) {
            let n = parse_decimal(value).ok_or_else(malformed)?;
            if content_length.is_some_and(|prev| prev != n) {
                return Err(malformed());
            }
            content_length = Some(n);
        } else if eq_ignore_case(name, header::TRANSFER_ENCODING) {
            transfer_encoding = true;
            // chunked must be the final coding (RFC 9112 §6.1).
            let last = value.rsplit(|&b| b == b',').next().map(header::trim_ows).unwrap_or_default();
            chunked = eq_ignore_case(last, b"chunked");
        } else if eq_ignore_case(name, header::CONNECTION) {
            if has_list_token(value, b"close") {
                close = true;
            } else if has_list_token(value, b"keep-alive") {
                close = false;
            }
        } else if eq_ignore_case(name, b"expect") && eq_ignore_case(value, b"100-continue") {
            expect_continue = true;
        }
        headers
            .push(field)
            .map_err(|_| Error::stream(0, StreamFault::HeaderTooLarge))?;
    }

    let framing = match (transfer_encoding, content_length) {
        // Both present is a smuggling vector; refuse it.
        (true, Some(_)) => return Err(malformed()),
        (true, None) if chunked => BodyFraming::Chunked,
        (true, None) => return Err(malformed()),
        (false, Some(0)) | (false, None) => BodyFraming::None,
        (false, Some(n)) => BodyFraming::Length(n),
    };
    Ok(ParsedHead { method, path, version, headers, framing, close, expect_continue, len: end })
}

/// Parse a chunk size line: `HEX [; ext] CRLF`. Returns `(size, consumed)`.
pub fn parse_chunk_size(buf: &[u8]) -> Result<(usize, usize), Error> {
    let line_end = find_crlf(buf).ok_or(Error::WouldBlock)?;
    let line = &buf[..line_end];
    let hex_end = line.iter().position(|&b| b == b';' || b == b' ' || b == b'\t').unwrap_or(line.len());
    let hex = &line[..hex_end];
    if hex.is_empty() || hex.len() > 15 {
        return Err(malformed());
    }
    let size = parse_hex(hex).ok_or_else(malformed)?;
    Ok((size, line_end + 2))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// RFC 9110 §5.6.2 token character.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn parse_decimal(buf: &[u8]) -> Option<u64> {
    if buf.is_empty() {
        return None;
    }
    buf.iter().try_fold(0u64, |n, &b| {
        let d = b.wrapping_sub(b'0');
        if d > 9 {
            return None;
        }
        n.checked_mul(10)?.checked_add(d as u64)
    })
}

fn parse_hex(buf: &[u8]) -> Option<usize> {
    buf.iter().try_fold(0usize, |n, &b| {
        let d = (b as char).to_digit(16)? as usize;
        n.checked_mul(16)?.checked_add(d)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<'a>(buf: &'a [u8], h: &ParsedHead, i: usize) -> (&'a [u8], &'a [u8]) {
        (h.headers[i].name.get(buf), h.headers[i].value.get(buf))
    }

    #[test]
    fn end_of_headers() {
        assert_eq!(find_end_of_headers(b"Host: a\r\n\r\nbody"), Some(11));
        assert_eq!(find_end_of_headers(b"Host: a\r\n"), None);
        assert_eq!(find_end_of_headers(b"\r\n\r\n"), Some(4));
    }

    #[test]
    fn request_line_fast_and_generic_paths() {
        let (m, path, v, used) = parse_request_line(b"GET /index.html HTTP/1.1\r\n").unwrap();
        assert_eq!((m, v, used), (Method::GET, Version::Http11, 26));
        assert_eq!(path.get(b"GET /index.html HTTP/1.1\r\n"), b"/index.html");

        let line = b"OPTIONS * HTTP/1.0\r\n";
        let (m, path, v, _) = parse_request_line(line).unwrap();
        assert_eq!((m, v), (Method::OPTIONS, Version::Http10));
        assert_eq!(path.get(line), b"*");
    }

    #[test]
    fn request_line_errors() {
        assert_eq!(parse_request_line(b"GET / HTTP/1.1"), Err(Error::WouldBlock));
        assert_eq!(parse_request_line(b"GET / HTTP/2.0\r\n"), Err(malformed()));
        assert_eq!(parse_request_line(b"BREW / HTTP/1.1\r\n"), Err(malformed()));
        assert_eq!(parse_request_line(b"GET  HTTP/1.1\r\n"), Err(malformed()));
    }

    #[test]
    fn header_line_offsets() {
        let buf = b"xxContent-Type:  text/html \r\n";
        let (field, used) = parse_header_line(buf, 2).unwrap();
        let field = field.unwrap();
        assert_eq!(field.name.get(buf), b"Content-Type");
        assert_eq!(field.value.get(buf), b"text/html");
        assert_eq!(used, 27);
        assert_eq!(parse_header_line(b"\r\nrest", 0).unwrap(), (None, 2));
    }

    #[test]
    fn header_line_rejects_bad_names() {
        assert_eq!(parse_header_line(b"Bad Name: x\r\n", 0), Err(malformed()));
        assert_eq!(parse_header_line(b"Name : x\r\n", 0), Err(malformed()));
        assert_eq!(parse_header_line(b" folded\r\n", 0), Err(malformed()));
    }

    #[test]
    fn full_head() {
        let buf = b"POST /api HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello";
        let head = parse_head(buf, 1024).unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.path.get(buf), b"/api");
        assert_eq!(head.framing, BodyFraming::Length(5));
        assert_eq!(head.len, buf.len() - 5);
        assert!(!head.close);
        assert_eq!(header(buf, &head, 0), (&b"Host"[..], &b"example.com"[..]));
    }

    #[test]
    fn connection_semantics() {
        let h = parse_head(b"GET / HTTP/1.0\r\n\r\n", 1024).unwrap();
        assert!(h.close);
        let h = parse_head(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", 1024).unwrap();
        assert!(!h.close);
        let h = parse_head(b"GET / HTTP/1.1\r\nConnection: upgrade, close\r\n\r\n", 1024).unwrap();
        assert!(h.close);
    }

    #[test]
    fn body_framing() {
        let h = parse_head(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n", 1024).unwrap();
        assert_eq!(h.framing, BodyFraming::Chunked);
        assert!(parse_head(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n", 1024).is_err());
        assert!(parse_head(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n", 1024).is_err());
        assert!(parse_head(b"POST / HTTP/1.1\r\nContent-Length: 3x\r\n\r\n", 1024).is_err());
        let h = parse_head(b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 0\r\n\r\n", 1024).unwrap();
        assert_eq!(h.framing, BodyFraming::None);
        assert!(h.expect_continue);
    }

    #[test]
    fn head_size_limit() {
        let mut buf = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        buf.extend(std::iter::repeat_n(b'a', 200));
        assert_eq!(parse_head(&buf, 100), Err(Error::stream(0, StreamFault::HeaderTooLarge)));
        assert_eq!(parse_head(&buf, 1000), Err(Error::WouldBlock));
    }

    #[test]
    fn too_many_headers() {
        let mut buf = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            buf.extend_from_slice(format!("X-{i}: v\r\n").as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        assert_eq!(parse_head(&buf, 1 << 16), Err(Error::stream(0, StreamFault::HeaderTooLarge)));
    }

    #[test]
    fn chunk_sizes() {
        assert_eq!(parse_chunk_size(b"1a\r\n").unwrap(), (0x1a, 4));
        assert_eq!(parse_chunk_size(b"0\r\n").unwrap(), (0, 3));
        assert_eq!(parse_chunk_size(b"FF;name=value\r\n").unwrap(), (0xff, 15));
        assert_eq!(parse_chunk_size(b"ff"), Err(Error::WouldBlock));
        assert_eq!(parse_chunk_size(b"zz\r\n"), Err(malformed()));
        assert_eq!(parse_chunk_size(b"ffffffffffffffffff\r\n"), Err(malformed()));
    }
}
