//! HTTP header types, zero-copy header references and common names.

/// A single HTTP header (name-value pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header<'a> {
    pub name: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> Header<'a> {
    /// Create a new header.
    pub const fn new(name: &'a [u8], value: &'a [u8]) -> Self {
        Self { name, value }
    }
}

/// Byte range inside a connection-owned buffer.
///
/// Parsers record these instead of copying bytes out of the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slice {
    pub start: u32,
    pub len: u32,
}

impl Slice {
    pub const EMPTY: Slice = Slice { start: 0, len: 0 };

    pub const fn new(start: usize, len: usize) -> Self {
        Self { start: start as u32, len: len as u32 }
    }

    /// Resolve the range against the buffer it was recorded from.
    pub fn get<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let start = self.start as usize;
        let end = start + self.len as usize;
        buf.get(start..end).unwrap_or(&[])
    }

    pub const fn end(&self) -> usize {
        self.start as usize + self.len as usize
    }

    /// Shift the range left after `n` bytes were drained from the buffer front.
    pub const fn shifted(self, n: usize) -> Self {
        Self { start: self.start - n as u32, len: self.len }
    }
}

/// A header recorded as two ranges into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderSlice {
    pub name: Slice,
    pub value: Slice,
}

/// Borrowed view over recorded headers.
#[derive(Debug, Clone, Copy)]
pub struct HeaderList<'a> {
    buf: &'a [u8],
    slices: &'a [HeaderSlice],
}

impl<'a> HeaderList<'a> {
    pub fn new(buf: &'a [u8], slices: &'a [HeaderSlice]) -> Self {
        Self { buf, slices }
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Iterate headers in wire order.
    pub fn iter(&self) -> impl Iterator<Item = Header<'a>> + 'a {
        let buf = self.buf;
        self.slices.iter().map(move |h| Header::new(h.name.get(buf), h.value.get(buf)))
    }

    /// First value for `name` (ASCII case-insensitive).
    pub fn get(&self, name: &[u8]) -> Option<&'a [u8]> {
        self.iter().find(|h| eq_ignore_case(h.name, name)).map(|h| h.value)
    }

    /// Whether any `name` header contains `token` in its comma-separated list.
    pub fn has_token(&self, name: &[u8], token: &[u8]) -> bool {
        self.iter()
            .filter(|h| eq_ignore_case(h.name, name))
            .any(|h| has_list_token(h.value, token))
    }
}

/// ASCII case-insensitive equality.
pub fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

/// Whether a comma-separated header value contains `token` (case-insensitive).
pub fn has_list_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|item| eq_ignore_case(trim_ows(item), token))
}

/// Strip optional whitespace (SP / HTAB) from both ends.
pub fn trim_ows(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(s.len());
    let end = s.iter().rposition(|&b| b != b' ' && b != b'\t').map_or(start, |p| p + 1);
    &s[start..end]
}

// Common header names as byte constants.
pub const CONTENT_TYPE: &[u8] = b"content-type";
pub const CONTENT_LENGTH: &[u8] = b"content-length";
pub const CONTENT_ENCODING: &[u8] = b"content-encoding";
pub const CONTENT_RANGE: &[u8] = b"content-range";
pub const HOST: &[u8] = b"host";
pub const ACCEPT: &[u8] = b"accept";
pub const ACCEPT_ENCODING: &[u8] = b"accept-encoding";
pub const USER_AGENT: &[u8] = b"user-agent";
pub const SERVER: &[u8] = b"server";
pub const CACHE_CONTROL: &[u8] = b"cache-control";
pub const CONNECTION: &[u8] = b"connection";
pub const KEEP_ALIVE: &[u8] = b"keep-alive";
pub const TRANSFER_ENCODING: &[u8] = b"transfer-encoding";
pub const ETAG: &[u8] = b"etag";
pub const IF_NONE_MATCH: &[u8] = b"if-none-match";
pub const RANGE: &[u8] = b"range";
pub const VARY: &[u8] = b"vary";
pub const PRIORITY: &[u8] = b"priority";
pub const STRICT_TRANSPORT_SECURITY: &[u8] = b"strict-transport-security";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_construction() {
        let h = Header::new(b"content-type", b"text/html");
        assert_eq!(h.name, b"content-type");
        assert_eq!(h.value, b"text/html");
    }

    #[test]
    fn slices_resolve_against_buffer() {
        let buf = b"Host: example.com\r\n";
        let list = [HeaderSlice { name: Slice::new(0, 4), value: Slice::new(6, 11) }];
        let headers = HeaderList::new(buf, &list);
        assert_eq!(headers.get(b"host"), Some(&b"example.com"[..]));
        assert_eq!(headers.get(b"accept"), None);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn out_of_range_slice_is_empty() {
        assert_eq!(Slice::new(10, 5).get(b"short"), b"");
    }

    #[test]
    fn list_tokens() {
        assert!(has_list_token(b"keep-alive, Upgrade", b"upgrade"));
        assert!(has_list_token(b" close ", b"close"));
        assert!(!has_list_token(b"closed", b"close"));
        assert_eq!(trim_ows(b" \tgzip \t"), b"gzip");
        assert_eq!(trim_ows(b"   "), b"");
    }
}
