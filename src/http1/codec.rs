//! HTTP/1.1 server codec.
//!
//! [`Http1Codec`] walks the connection's read buffer and yields request
//! heads, body byte ranges and end markers, all as offsets into that
//! buffer. It never copies; the caller moves body ranges into arena body
//! staging. Pipelined requests are parsed ahead up to the configured depth
//! and [`ResponseQueue`] releases their responses strictly in arrival order.

use std::collections::VecDeque;
use std::ops::Range;

use crate::error::{Error, StreamFault};
use crate::http::header::Slice;
use crate::http::{StatusCode, Version};

use super::parse::{self, BodyFraming, ParsedHead};

/// Interim response for `Expect: 100-continue`.
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// A request head with its pipeline sequence number (the synthetic stream
/// id: 1 for the first request on a connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub seq: u64,
    pub head: ParsedHead,
}

impl RequestHead {
    /// Whether the response may keep the connection open.
    pub fn keep_alive(&self) -> bool {
        !self.head.close
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Http1Item {
    Head(RequestHead),
    /// Request body bytes at this range of the read buffer.
    Body(Range<usize>),
    /// The current request is complete.
    End(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkCrlf,
    Trailers,
    EndPending,
    /// A `Connection: close` request finished, or input was malformed.
    Closed,
}

#[derive(Debug)]
pub struct Http1Codec {
    max_header_bytes: usize,
    pipeline_depth: usize,
    state: State,
    /// Bytes of the caller's buffer already turned into items.
    pos: usize,
    next_seq: u64,
    current: u64,
    in_flight: usize,
    closing: bool,
}

impl Http1Codec {
    pub fn new(max_header_bytes: usize, pipeline_depth: usize) -> Self {
        Self {
            max_header_bytes,
            pipeline_depth: pipeline_depth.max(1),
            state: State::Head,
            pos: 0,
            next_seq: 1,
            current: 0,
            in_flight: 0,
            closing: false,
        }
    }

    /// Produce the next item from `buf`, or `None` until more bytes arrive
    /// (or, between requests, until the pipeline has room).
    ///
    /// `buf` must be the same buffer across calls, only ever appended to or
    /// shrunk from the front through [`compact`](Self::compact).
    pub fn next(&mut self, buf: &[u8]) -> Result<Option<Http1Item>, Error> {
        loop {
            let rest = buf.get(self.pos..).unwrap_or_default();
            match self.state {
                State::Closed => return Ok(None),
                State::EndPending => {
                    self.state = if self.closing { State::Closed } else { State::Head };
                    return Ok(Some(Http1Item::End(self.current)));
                }
                State::Head => {
                    if self.in_flight >= self.pipeline_depth {
                        return Ok(None);
                    }
                    let head = match parse::parse_head(rest, self.max_header_bytes) {
                        Ok(head) => head,
                        Err(Error::WouldBlock) => return Ok(None),
                        Err(e) => return Err(self.fail(e, self.next_seq)),
                    };
                    let head = shift(head, self.pos);
                    self.pos += head.len;
                    self.current = self.next_seq;
                    self.next_seq += 1;
                    self.in_flight += 1;
                    self.closing = head.close;
                    self.state = match head.framing {
                        BodyFraming::None => State::EndPending,
                        BodyFraming::Length(n) => State::Length { remaining: n },
                        BodyFraming::Chunked => State::ChunkSize,
                    };
                    return Ok(Some(Http1Item::Head(RequestHead { seq: self.current, head })));
                }
                State::Length { remaining } => {
                    if rest.is_empty() {
                        return Ok(None);
                    }
                    let n = (rest.len() as u64).min(remaining) as usize;
                    let range = self.take(n);
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 { State::EndPending } else { State::Length { remaining } };
                    return Ok(Some(Http1Item::Body(range)));
                }
                State::ChunkSize => match parse::parse_chunk_size(rest) {
                    Ok((size, used)) => {
                        self.pos += used;
                        self.state = if size == 0 { State::Trailers } else { State::ChunkData { remaining: size } };
                    }
                    Err(Error::WouldBlock) => return Ok(None),
                    Err(e) => return Err(self.fail(e, self.current)),
                },
                State::ChunkData { remaining } => {
                    if rest.is_empty() {
                        return Ok(None);
                    }
                    let n = rest.len().min(remaining);
                    let range = self.take(n);
                    let remaining = remaining - n;
                    self.state = if remaining == 0 { State::ChunkCrlf } else { State::ChunkData { remaining } };
                    return Ok(Some(Http1Item::Body(range)));
                }
                State::ChunkCrlf => {
                    if rest.len() < 2 {
                        return Ok(None);
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(self.fail(parse::malformed(), self.current));
                    }
                    self.pos += 2;
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    // Trailer fields are skipped.
                    if rest.len() < 2 {
                        return Ok(None);
                    }
                    let end = if rest.starts_with(b"\r\n") {
                        Some(2)
                    } else {
                        parse::find_end_of_headers(rest)
                    };
                    match end {
                        Some(end) => {
                            self.pos += end;
                            self.state = State::EndPending;
                        }
                        None if rest.len() > self.max_header_bytes => {
                            let e = Error::stream(0, StreamFault::HeaderTooLarge);
                            return Err(self.fail(e, self.current));
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// The caller drained `n` bytes from the front of its buffer.
    pub fn compact(&mut self, n: usize) {
        self.pos = self.pos.saturating_sub(n);
    }

    /// Bytes at the front of the buffer that are fully consumed.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// A response left the pipeline (fully written).
    pub fn response_done(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Requests parsed whose responses have not been written.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Sequence number of the request being read.
    pub fn current(&self) -> u64 {
        self.current
    }

    /// No further requests will be parsed.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Between requests with nothing partially read.
    pub fn is_idle(&self) -> bool {
        self.state == State::Head
    }

    /// Stop after the current request, as if it carried `Connection: close`.
    pub fn close_after_current(&mut self) {
        self.closing = true;
        if self.state == State::Head {
            self.state = State::Closed;
        }
    }

    fn take(&mut self, n: usize) -> Range<usize> {
        let range = self.pos..self.pos + n;
        self.pos += n;
        range
    }

    /// Input is unusable past a framing error: tag the error with the
    /// request it belongs to and stop.
    fn fail(&mut self, e: Error, seq: u64) -> Error {
        self.state = State::Closed;
        match e {
            Error::Stream { fault, .. } => Error::stream(seq, fault),
            other => other,
        }
    }
}

fn shift(mut head: ParsedHead, by: usize) -> ParsedHead {
    let moved = |s: Slice| Slice::new(s.start as usize + by, s.len as usize);
    head.path = moved(head.path);
    for field in head.headers.iter_mut() {
        field.name = moved(field.name);
        field.value = moved(field.value);
    }
    head
}

/// Responses for pipelined requests, released in request order only.
#[derive(Debug)]
pub struct ResponseQueue<T> {
    slots: VecDeque<(u64, Option<T>)>,
}

impl<T> Default for ResponseQueue<T> {
    fn default() -> Self {
        Self { slots: VecDeque::new() }
    }
}

impl<T> ResponseQueue<T> {
    /// Reserve the slot for request `seq`.
    pub fn push(&mut self, seq: u64) {
        self.slots.push_back((seq, None));
    }

    /// Fill the slot for `seq`. Filling twice or an unknown seq is a bug.
    pub fn complete(&mut self, seq: u64, response: T) -> Result<(), Error> {
        let slot = self.slots.iter_mut().find(|(s, _)| *s == seq).ok_or(Error::InvalidState)?;
        if slot.1.is_some() {
            return Err(Error::InvalidState);
        }
        slot.1 = Some(response);
        Ok(())
    }

    /// The oldest response, once it is ready. Later ready responses wait.
    pub fn pop_ready(&mut self) -> Option<(u64, T)> {
        if self.slots.front().is_some_and(|(_, r)| r.is_some()) {
            let (seq, response) = self.slots.pop_front()?;
            return response.map(|r| (seq, r));
        }
        None
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Append `HTTP/1.x NNN Reason\r\n`.
pub fn put_status_line(out: &mut Vec<u8>, version: Version, status: StatusCode) {
    out.extend_from_slice(match version {
        Version::Http10 => b"HTTP/1.0 ",
        Version::Http11 => b"HTTP/1.1 ",
    });
    out.extend_from_slice(&status.to_bytes());
    out.push(b' ');
    out.extend_from_slice(status.reason().as_bytes());
    out.extend_from_slice(b"\r\n");
}

pub fn put_header(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    out.extend_from_slice(name);
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

/// Terminate the header section.
pub fn end_head(out: &mut Vec<u8>) {
    out.extend_from_slice(b"\r\n");
}

/// Frame `data` as one chunk. Empty data is skipped: a zero-size chunk
/// would end the body.
pub fn put_chunk(out: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    put_chunk_size(out, data.len());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Chunk-size line only, for bodies written from elsewhere.
pub fn put_chunk_size(out: &mut Vec<u8>, len: usize) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut digits = [0u8; 16];
    let mut i = digits.len();
    let mut n = len;
    loop {
        i -= 1;
        digits[i] = HEX[n & 0xf];
        n >>= 4;
        if n == 0 {
            break;
        }
    }
    out.extend_from_slice(&digits[i..]);
    out.extend_from_slice(b"\r\n");
}

/// The terminating zero-size chunk, with no trailers.
pub fn put_last_chunk(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn items(codec: &mut Http1Codec, buf: &[u8]) -> Vec<Http1Item> {
        std::iter::from_fn(|| codec.next(buf).unwrap()).collect()
    }

    fn path<'a>(buf: &'a [u8], item: &Http1Item) -> &'a [u8] {
        match item {
            Http1Item::Head(h) => h.head.path.get(buf),
            other => panic!("expected head, got {other:?}"),
        }
    }

    #[test]
    fn pipelined_requests_in_order() {
        let buf = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut codec = Http1Codec::new(1024, 16);
        let got = items(&mut codec, buf);
        assert_eq!(got.len(), 4);
        assert_eq!(path(buf, &got[0]), b"/a");
        assert_eq!(got[1], Http1Item::End(1));
        assert_eq!(path(buf, &got[2]), b"/b");
        assert_eq!(got[3], Http1Item::End(2));
        assert_eq!(codec.consumed(), buf.len());
        assert_eq!(codec.in_flight(), 2);
    }

    #[test]
    fn pipeline_depth_stops_parsing() {
        let buf = b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\n\r\n";
        let mut codec = Http1Codec::new(1024, 2);
        assert_eq!(items(&mut codec, buf).len(), 4);
        codec.response_done();
        let more = items(&mut codec, buf);
        assert_eq!(path(buf, &more[0]), b"/3");
    }

    #[test]
    fn content_length_body_across_reads() {
        let full = b"POST /u HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789";
        let mut codec = Http1Codec::new(1024, 4);
        let got = items(&mut codec, &full[..45]);
        assert!(matches!(&got[0], Http1Item::Head(h) if h.head.method == Method::POST));
        assert_eq!(got[1], Http1Item::Body(40..45));
        assert_eq!(got.len(), 2);
        let got = items(&mut codec, full);
        assert_eq!(got, [Http1Item::Body(45..50), Http1Item::End(1)]);
    }

    #[test]
    fn chunked_body_decoded_to_ranges() {
        let buf = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6;x=y\r\n world\r\n0\r\nX-T: 1\r\n\r\n";
        let mut codec = Http1Codec::new(1024, 4);
        let got = items(&mut codec, buf);
        let body: Vec<u8> = got
            .iter()
            .filter_map(|i| match i {
                Http1Item::Body(r) => Some(&buf[r.clone()]),
                _ => None,
            })
            .flatten()
            .copied()
            .collect();
        assert_eq!(body, b"hello world");
        assert_eq!(got.last(), Some(&Http1Item::End(1)));
        assert_eq!(codec.consumed(), buf.len());
    }

    #[test]
    fn bad_chunk_terminator_is_malformed() {
        let buf = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nabXX";
        let mut codec = Http1Codec::new(1024, 4);
        codec.next(buf).unwrap();
        codec.next(buf).unwrap();
        assert_eq!(codec.next(buf), Err(Error::stream(1, StreamFault::Malformed)));
        assert!(codec.is_closed());
    }

    #[test]
    fn malformed_second_request_tagged_with_its_seq() {
        let buf = b"GET / HTTP/1.1\r\n\r\nGARBAGE\r\n\r\n";
        let mut codec = Http1Codec::new(1024, 4);
        codec.next(buf).unwrap();
        codec.next(buf).unwrap();
        assert_eq!(codec.next(buf), Err(Error::stream(2, StreamFault::Malformed)));
    }

    #[test]
    fn connection_close_stops_after_request() {
        let buf = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\nGET /next HTTP/1.1\r\n\r\n";
        let mut codec = Http1Codec::new(1024, 4);
        let got = items(&mut codec, buf);
        assert_eq!(got.len(), 2);
        assert!(codec.is_closed());
    }

    #[test]
    fn compact_keeps_offsets_consistent() {
        let mut buf = b"GET /a HTTP/1.1\r\n\r\n".to_vec();
        let mut codec = Http1Codec::new(1024, 4);
        items(&mut codec, &buf);
        let n = codec.consumed();
        buf.drain(..n);
        codec.compact(n);
        buf.extend_from_slice(b"GET /b HTTP/1.1\r\n\r\n");
        let got = items(&mut codec, &buf);
        assert_eq!(path(&buf, &got[0]), b"/b");
    }

    #[test]
    fn response_queue_is_fifo() {
        let mut q = ResponseQueue::default();
        q.push(1);
        q.push(2);
        q.complete(2, "second").unwrap();
        assert_eq!(q.pop_ready(), None);
        q.complete(1, "first").unwrap();
        assert_eq!(q.pop_ready(), Some((1, "first")));
        assert_eq!(q.pop_ready(), Some((2, "second")));
        assert!(q.is_empty());
        assert_eq!(q.complete(3, "x"), Err(Error::InvalidState));
    }

    #[test]
    fn response_head_and_chunks() {
        let mut out = Vec::new();
        put_status_line(&mut out, Version::Http11, StatusCode::NOT_FOUND);
        put_header(&mut out, b"transfer-encoding", b"chunked");
        end_head(&mut out);
        put_chunk(&mut out, &[b'x'; 26]);
        put_chunk(&mut out, b"");
        put_last_chunk(&mut out);
        assert_eq!(
            out,
            [
                &b"HTTP/1.1 404 Not Found\r\ntransfer-encoding: chunked\r\n\r\n1a\r\n"[..],
                &[b'x'; 26][..],
                &b"\r\n0\r\n\r\n"[..],
            ]
            .concat()
        );
    }
}
