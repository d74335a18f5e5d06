//! Protocol-independent request views and response descriptors.
//!
//! A [`Request`] borrows everything from connection-owned buffers; the
//! routing collaborator answers with an owned [`ResponseDescriptor`].

use std::borrow::Cow;

use super::header::{HeaderList, eq_ignore_case};
use super::{Method, StatusCode};
use crate::pipeline::FileRegion;

/// Negotiated application protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1,
    Http2,
    Http3,
}

impl Protocol {
    /// ALPN identifier (RFC 7301 registry).
    pub const fn alpn(&self) -> &'static [u8] {
        match self {
            Protocol::Http1 => b"http/1.1",
            Protocol::Http2 => b"h2",
            Protocol::Http3 => b"h3",
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1.1",
            Protocol::Http2 => "h2",
            Protocol::Http3 => "h3",
        }
    }
}

/// HTTP/1.x minor version; HTTP/2 and HTTP/3 requests report `Http11` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// A fully-parsed request handed to the routing collaborator.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub protocol: Protocol,
    pub stream_id: u64,
    pub method: Method,
    pub path: &'a [u8],
    pub authority: Option<&'a [u8]>,
    pub version: Version,
    pub headers: HeaderList<'a>,
    /// Buffered request body (arena-resident).
    pub body: &'a [u8],
}

impl<'a> Request<'a> {
    /// First value of header `name`; `host` falls back to `:authority`.
    pub fn header(&self, name: &[u8]) -> Option<&'a [u8]> {
        match self.headers.get(name) {
            Some(v) => Some(v),
            None if eq_ignore_case(name, b"host") => self.authority,
            None => None,
        }
    }

    /// Path without query string or fragment.
    pub fn path_only(&self) -> &'a [u8] {
        let end = self.path.iter().position(|&b| b == b'?' || b == b'#').unwrap_or(self.path.len());
        &self.path[..end]
    }
}

/// Response body source.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    /// Handler-generated bytes; copied once into the arena body page.
    Bytes(Vec<u8>),
    /// Static asset sent by zero-copy transfer; never touches the arena.
    File(FileRegion),
}

impl Body {
    /// Exact body length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Bytes(b) => b.len() as u64,
            Body::File(f) => f.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Response returned by the routing collaborator.
#[derive(Debug)]
pub struct ResponseDescriptor {
    pub status: StatusCode,
    /// Lower-case header names.
    pub headers: Vec<(Cow<'static, str>, String)>,
    pub body: Body,
    /// Content type used by compression negotiation.
    pub content_type: Option<Cow<'static, str>>,
    /// Set by `HEAD` handling: headers describe `body_len` but no body is sent.
    pub head_only: bool,
}

impl ResponseDescriptor {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::Empty,
            content_type: None,
            head_only: false,
        }
    }

    /// Plain-text response, used for synthesized error responses.
    pub fn text(status: StatusCode, text: &str) -> Self {
        let mut resp = Self::new(status);
        resp.content_type = Some(Cow::Borrowed("text/plain; charset=utf-8"));
        resp.body = Body::Bytes(text.as_bytes().to_vec());
        resp
    }

    /// Response for an error that still allows one, e.g. 413 or 504.
    pub fn for_status(status: StatusCode) -> Self {
        let mut text = String::with_capacity(32);
        text.push_str(status.reason());
        text.push('\n');
        Self::text(status, &text)
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((Cow::Borrowed(name), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Body::Bytes(body);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Where to send a proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub authority: String,
    pub path: String,
}

/// Routing collaborator answer.
#[derive(Debug)]
pub enum RouteDecision {
    Respond(ResponseDescriptor),
    /// Forward to a backend; retried with backoff on timeout.
    Proxy(UpstreamTarget),
    /// Drop the exchange without a response (WAF / rate-limit blocks).
    Terminate,
}
