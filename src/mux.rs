//! Protocol selection for new connections.
//!
//! A TCP connection starts out undetermined. The negotiated ALPN name wins
//! when TLS supplied one; otherwise the first bytes are sniffed for the
//! HTTP/2 connection preface or an HTTP/1.x request line. The decision is
//! made exactly once, before any handler state exists.

use crate::error::Error;
use crate::h2::CONNECTION_PREFACE;
use crate::http::{Method, Protocol};

/// Outcome of inspecting a connection's first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Http1,
    Http2,
    /// The bytes so far are a valid prefix of more than one answer.
    NeedMore,
}

impl Selection {
    pub const fn protocol(self) -> Option<Protocol> {
        match self {
            Selection::Http1 => Some(Protocol::Http1),
            Selection::Http2 => Some(Protocol::Http2),
            Selection::NeedMore => None,
        }
    }
}

/// Pick the handler for a TCP connection.
///
/// `alpn` is the protocol name agreed during the TLS handshake, if any. An
/// ALPN that is neither `h2` nor `http/1.x` is rejected; with no ALPN the
/// first bytes decide.
pub fn select_protocol(alpn: Option<&[u8]>, first_bytes: &[u8]) -> Result<Selection, Error> {
    match alpn {
        Some(b"h2") => return Ok(Selection::Http2),
        Some(b"http/1.1") | Some(b"http/1.0") => return Ok(Selection::Http1),
        Some(_) => return Err(Error::MalformedPreface),
        None => {}
    }
    sniff(first_bytes)
}

fn sniff(first_bytes: &[u8]) -> Result<Selection, Error> {
    if first_bytes.is_empty() {
        return Ok(Selection::NeedMore);
    }
    let n = first_bytes.len().min(CONNECTION_PREFACE.len());
    let maybe_h2 = first_bytes[..n] == CONNECTION_PREFACE[..n];
    if maybe_h2 && n == CONNECTION_PREFACE.len() {
        return Ok(Selection::Http2);
    }
    // "PRI" is not a method we serve, so a preface prefix never reads as HTTP/1.
    if maybe_h2 {
        return Ok(Selection::NeedMore);
    }
    if !Method::is_request_line_prefix(first_bytes) {
        return Err(Error::MalformedPreface);
    }
    let has_space = first_bytes.iter().take(8).any(|&b| b == b' ');
    if has_space { Ok(Selection::Http1) } else { Ok(Selection::NeedMore) }
}

/// Pick the handler for a QUIC connection from its negotiated ALPN.
pub fn select_for_quic(alpn: &[u8]) -> Result<Protocol, Error> {
    match alpn {
        b"h3" => Ok(Protocol::Http3),
        _ => Err(Error::MalformedPreface),
    }
}
