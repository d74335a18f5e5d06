//! HTTP request methods (RFC 9110 §9).

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    CONNECT,
    PATCH,
    TRACE,
}

const ALL: [Method; 9] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
    Method::CONNECT,
    Method::PATCH,
    Method::TRACE,
];

// Little-endian words of the two hot request-line prefixes.
const WORD_GET_SP: u32 = u32::from_le_bytes(*b"GET ");
const WORD_POST: u32 = u32::from_le_bytes(*b"POST");

impl Method {
    /// Parse a method from its ASCII bytes.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Self::GET),
            b"POST" => Some(Self::POST),
            b"PUT" => Some(Self::PUT),
            b"DELETE" => Some(Self::DELETE),
            b"HEAD" => Some(Self::HEAD),
            b"OPTIONS" => Some(Self::OPTIONS),
            b"CONNECT" => Some(Self::CONNECT),
            b"PATCH" => Some(Self::PATCH),
            b"TRACE" => Some(Self::TRACE),
            _ => None,
        }
    }

    /// Recognise the method at the start of a request line.
    ///
    /// GET and POST are matched with a single 4-byte word compare; anything
    /// else falls back to scanning for the delimiting space. Returns the
    /// method and the length of the method token (excluding the space).
    pub fn from_request_line(line: &[u8]) -> Option<(Self, usize)> {
        if line.len() >= 5 {
            let word = u32::from_le_bytes([line[0], line[1], line[2], line[3]]);
            if word == WORD_GET_SP {
                return Some((Self::GET, 3));
            }
            if word == WORD_POST && line[4] == b' ' {
                return Some((Self::POST, 4));
            }
        }
        let end = line.iter().take(8).position(|&b| b == b' ')?;
        Self::from_bytes(&line[..end]).map(|m| (m, end))
    }

    /// Whether `prefix` could still grow into `"<METHOD> "` for a known method.
    ///
    /// Used by protocol sniffing to tell "need more bytes" apart from garbage.
    pub fn is_request_line_prefix(prefix: &[u8]) -> bool {
        ALL.iter().any(|m| {
            let verb = m.as_bytes();
            if prefix.len() <= verb.len() {
                verb.starts_with(prefix)
            } else {
                prefix.starts_with(verb) && prefix[verb.len()] == b' '
            }
        })
    }

    /// Return the method as ASCII bytes.
    pub const fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::GET => b"GET",
            Self::POST => b"POST",
            Self::PUT => b"PUT",
            Self::DELETE => b"DELETE",
            Self::HEAD => b"HEAD",
            Self::OPTIONS => b"OPTIONS",
            Self::CONNECT => b"CONNECT",
            Self::PATCH => b"PATCH",
            Self::TRACE => b"TRACE",
        }
    }

    /// Return the method as a string slice.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GET => "GET",
            Self::POST => "POST",
            Self::PUT => "PUT",
            Self::DELETE => "DELETE",
            Self::HEAD => "HEAD",
            Self::OPTIONS => "OPTIONS",
            Self::CONNECT => "CONNECT",
            Self::PATCH => "PATCH",
            Self::TRACE => "TRACE",
        }
    }

    /// Whether a response to this method never carries a body.
    pub const fn is_head(&self) -> bool {
        matches!(self, Self::HEAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_methods() {
        for m in ALL {
            assert_eq!(Method::from_bytes(m.as_bytes()), Some(m));
        }
    }

    #[test]
    fn unknown_method_returns_none() {
        assert_eq!(Method::from_bytes(b"UNKNOWN"), None);
        assert_eq!(Method::from_bytes(b""), None);
        assert_eq!(Method::from_bytes(b"get"), None); // case sensitive
    }

    #[test]
    fn fast_path_get_and_post() {
        assert_eq!(Method::from_request_line(b"GET / HTTP/1.1"), Some((Method::GET, 3)));
        assert_eq!(Method::from_request_line(b"POST /x HTTP/1.1"), Some((Method::POST, 4)));
        // "POSTX" must not match the POST word
        assert_eq!(Method::from_request_line(b"POSTX / HTTP/1.1"), None);
    }

    #[test]
    fn generic_path_for_other_verbs() {
        assert_eq!(Method::from_request_line(b"DELETE /a HTTP/1.1"), Some((Method::DELETE, 6)));
        assert_eq!(Method::from_request_line(b"OPTIONS * HTTP/1.1"), Some((Method::OPTIONS, 7)));
        assert_eq!(Method::from_request_line(b"BREW /pot HTTP/1.1"), None);
    }

    #[test]
    fn request_line_prefixes() {
        assert!(Method::is_request_line_prefix(b"G"));
        assert!(Method::is_request_line_prefix(b"GE"));
        assert!(Method::is_request_line_prefix(b"GET /"));
        assert!(Method::is_request_line_prefix(b"OPTI"));
        assert!(!Method::is_request_line_prefix(b"GETX"));
        assert!(!Method::is_request_line_prefix(b"\x16\x03\x01"));
    }
}
