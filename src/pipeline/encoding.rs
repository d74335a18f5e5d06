//! Content-coding negotiation and compression filters.
//!
//! Compression is a pull filter: a [`BodyReader`] wraps the handler's bytes
//! and yields encoded output in whatever piece size the framer asks for,
//! so the encoded body is written straight into staging and never held
//! whole.

use std::io::{self, Cursor, Read};

use serde::{Deserialize, Serialize};

use crate::config::CompressionConfig;
use crate::http::header::{eq_ignore_case, trim_ows};

/// A content coding (RFC 9110 §8.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Encoding {
    #[serde(rename = "zstd")]
    Zstd,
    #[serde(rename = "br")]
    Brotli,
    #[serde(rename = "gzip")]
    Gzip,
    #[serde(rename = "deflate")]
    Deflate,
    #[serde(rename = "identity")]
    Identity,
}

impl Encoding {
    /// Token used in `Accept-Encoding` and `Content-Encoding`.
    pub const fn token(&self) -> &'static str {
        match self {
            Encoding::Zstd => "zstd",
            Encoding::Brotli => "br",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Identity => "identity",
        }
    }

    /// Whether this build can produce the coding.
    pub const fn is_available(&self) -> bool {
        match self {
            Encoding::Zstd => cfg!(feature = "zstd"),
            Encoding::Brotli => cfg!(feature = "brotli"),
            Encoding::Gzip | Encoding::Deflate | Encoding::Identity => true,
        }
    }

    fn matches(&self, token: &[u8]) -> bool {
        eq_ignore_case(token, self.token().as_bytes())
            || (*self == Encoding::Gzip && eq_ignore_case(token, b"x-gzip"))
    }
}

/// Pick the coding for a response from the request's `Accept-Encoding`.
///
/// The client's q-values decide first; among equally weighted codings the
/// server preference order wins. `*` covers codings the client did not
/// name. Without the header, or when nothing acceptable remains, the
/// answer is identity.
pub fn negotiate_encoding(accept: Option<&[u8]>, preference: &[Encoding]) -> Encoding {
    let Some(accept) = accept else {
        return Encoding::Identity;
    };
    let mut best = Encoding::Identity;
    let mut best_q = 0u16;
    for &enc in preference {
        if enc == Encoding::Identity || !enc.is_available() {
            continue;
        }
        let q = qvalue_for(accept, enc);
        if q > best_q {
            best = enc;
            best_q = q;
        }
    }
    best
}

/// Client weight for `enc` in thousandths; 0 when not acceptable.
fn qvalue_for(accept: &[u8], enc: Encoding) -> u16 {
    let mut wildcard = None;
    for item in accept.split(|&b| b == b',') {
        let mut parts = item.split(|&b| b == b';');
        let token = trim_ows(parts.next().unwrap_or_default());
        if token.is_empty() {
            continue;
        }
        let q = parts
            .filter_map(|p| {
                let p = trim_ows(p);
                let v = p.strip_prefix(b"q=").or_else(|| p.strip_prefix(b"Q="))?;
                Some(parse_qvalue(v))
            })
            .next()
            .unwrap_or(1000);
        if enc.matches(token) {
            return q;
        }
        if token == b"*" {
            wildcard = Some(q);
        }
    }
    wildcard.unwrap_or(0)
}

/// `qvalue = ( "0" [ "." 0*3DIGIT ] ) / ( "1" [ "." 0*3("0") ] )`.
/// Anything unparsable counts as 0.
fn parse_qvalue(v: &[u8]) -> u16 {
    let v = trim_ows(v);
    let (int, frac) = match v.iter().position(|&b| b == b'.') {
        Some(dot) => (&v[..dot], &v[dot + 1..]),
        None => (v, &b""[..]),
    };
    if frac.len() > 3 || !frac.iter().all(u8::is_ascii_digit) {
        return 0;
    }
    let mut thousandths = 0u16;
    for i in 0..3 {
        thousandths = thousandths * 10 + frac.get(i).map_or(0, |d| (d - b'0') as u16);
    }
    match int {
        b"1" => 1000,
        b"0" => thousandths,
        _ => 0,
    }
}

/// Whether a body of this media type is worth compressing. Already
/// compressed formats and unknown types are sent as identity.
pub fn is_compressible(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    let essence = essence.to_ascii_lowercase();
    if essence.starts_with("text/") {
        return true;
    }
    matches!(
        essence.as_str(),
        "application/json"
            | "application/javascript"
            | "application/xml"
            | "application/xhtml+xml"
            | "application/manifest+json"
            | "application/wasm"
            | "image/svg+xml"
            | "image/x-icon"
            | "font/ttf"
            | "font/otf"
    ) || essence.ends_with("+json")
        || essence.ends_with("+xml")
}

/// A response body, possibly passing through a compressor.
pub enum BodyReader {
    Identity(Cursor<Vec<u8>>),
    Gzip(flate2::read::GzEncoder<Cursor<Vec<u8>>>),
    Deflate(flate2::read::ZlibEncoder<Cursor<Vec<u8>>>),
    #[cfg(feature = "brotli")]
    Brotli(Box<brotli::CompressorReader<Cursor<Vec<u8>>>>),
    #[cfg(feature = "zstd")]
    Zstd(zstd::stream::read::Encoder<'static, io::BufReader<Cursor<Vec<u8>>>>),
}

impl BodyReader {
    /// Wrap `body` in the compressor for `encoding`. Codings missing from
    /// this build fall back to identity.
    pub fn new(encoding: Encoding, body: Vec<u8>, config: &CompressionConfig) -> io::Result<Self> {
        let src = Cursor::new(body);
        Ok(match encoding {
            Encoding::Gzip => BodyReader::Gzip(flate2::read::GzEncoder::new(
                src,
                flate2::Compression::new(config.gzip_level),
            )),
            Encoding::Deflate => BodyReader::Deflate(flate2::read::ZlibEncoder::new(
                src,
                flate2::Compression::new(config.gzip_level),
            )),
            #[cfg(feature = "brotli")]
            Encoding::Brotli => {
                BodyReader::Brotli(Box::new(brotli::CompressorReader::new(src, 4096, config.brotli_level, 22)))
            }
            #[cfg(feature = "zstd")]
            Encoding::Zstd => BodyReader::Zstd(zstd::stream::read::Encoder::new(src, config.zstd_level)?),
            _ => BodyReader::Identity(src),
        })
    }

    pub fn identity(body: Vec<u8>) -> Self {
        BodyReader::Identity(Cursor::new(body))
    }

    /// Bytes still to come, when known without reading. Compressed output
    /// has no known length.
    pub fn remaining(&self) -> Option<u64> {
        match self {
            BodyReader::Identity(r) => Some((r.get_ref().len() as u64).saturating_sub(r.position())),
            _ => None,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            BodyReader::Identity(_) => Encoding::Identity,
            BodyReader::Gzip(_) => Encoding::Gzip,
            BodyReader::Deflate(_) => Encoding::Deflate,
            #[cfg(feature = "brotli")]
            BodyReader::Brotli(_) => Encoding::Brotli,
            #[cfg(feature = "zstd")]
            BodyReader::Zstd(_) => Encoding::Zstd,
        }
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodyReader::Identity(r) => r.read(buf),
            BodyReader::Gzip(r) => r.read(buf),
            BodyReader::Deflate(r) => r.read(buf),
            #[cfg(feature = "brotli")]
            BodyReader::Brotli(r) => r.read(buf),
            #[cfg(feature = "zstd")]
            BodyReader::Zstd(r) => r.read(buf),
        }
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BodyReader").field(&self.encoding()).finish()
    }
}

/// Encode `data` in one go.
pub fn compress(encoding: Encoding, data: &[u8], config: &CompressionConfig) -> io::Result<Vec<u8>> {
    let mut reader = BodyReader::new(encoding, data.to_vec(), config)?;
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    reader.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREF: [Encoding; 4] = [Encoding::Zstd, Encoding::Brotli, Encoding::Gzip, Encoding::Deflate];

    #[test]
    fn missing_header_means_identity() {
        assert_eq!(negotiate_encoding(None, &PREF), Encoding::Identity);
        assert_eq!(negotiate_encoding(Some(b""), &PREF), Encoding::Identity);
    }

    #[test]
    fn server_order_breaks_ties() {
        assert_eq!(negotiate_encoding(Some(b"gzip, deflate"), &PREF), Encoding::Gzip);
        assert_eq!(negotiate_encoding(Some(b"deflate, gzip"), &PREF), Encoding::Gzip);
    }

    #[test]
    fn qvalues_beat_server_order() {
        assert_eq!(negotiate_encoding(Some(b"gzip;q=0.5, deflate;q=0.8"), &PREF), Encoding::Deflate);
        assert_eq!(negotiate_encoding(Some(b"gzip;q=0, deflate;q=0"), &PREF), Encoding::Identity);
        assert_eq!(negotiate_encoding(Some(b"GZIP ; q=1.0"), &PREF), Encoding::Gzip);
    }

    #[test]
    fn identity_reader_knows_what_is_left() {
        let mut reader = BodyReader::identity(b"0123456789".to_vec());
        assert_eq!(reader.remaining(), Some(10));
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(reader.remaining(), Some(6));

        let gzip = BodyReader::new(Encoding::Gzip, b"text".to_vec(), &CompressionConfig::default()).unwrap();
        assert_eq!(gzip.remaining(), None);
    }

    #[test]
    fn wildcard_covers_unnamed() {
        assert_eq!(negotiate_encoding(Some(b"*;q=0.1, gzip;q=0"), &[Encoding::Gzip, Encoding::Deflate]), Encoding::Deflate);
        assert_eq!(negotiate_encoding(Some(b"*;q=0"), &PREF), Encoding::Identity);
    }

    #[test]
    fn qvalue_grammar() {
        assert_eq!(parse_qvalue(b"1"), 1000);
        assert_eq!(parse_qvalue(b"0.25"), 250);
        assert_eq!(parse_qvalue(b"0.001"), 1);
        assert_eq!(parse_qvalue(b"0.0001"), 0);
        assert_eq!(parse_qvalue(b"2"), 0);
        assert_eq!(parse_qvalue(b"abc"), 0);
    }

    #[test]
    fn media_types() {
        assert!(is_compressible("text/html; charset=utf-8"));
        assert!(is_compressible("application/ld+json"));
        assert!(!is_compressible("image/png"));
        assert!(!is_compressible("application/zip"));
        assert!(!is_compressible("application/octet-stream"));
    }

    #[test]
    fn gzip_round_trip() {
        use std::io::Read;
        let body = b"hello hello hello hello hello hello".repeat(20);
        let packed = compress(Encoding::Gzip, &body, &CompressionConfig::default()).unwrap();
        assert!(packed.len() < body.len());
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(&packed[..]).read_to_end(&mut out).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn deflate_is_zlib_wrapped() {
        use std::io::Read;
        let body = b"abcabcabcabcabcabcabcabc".repeat(8);
        let packed = compress(Encoding::Deflate, &body, &CompressionConfig::default()).unwrap();
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(&packed[..]).read_to_end(&mut out).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn reader_yields_small_pieces() {
        let body = b"0123456789".repeat(100);
        let mut reader = BodyReader::identity(body.clone());
        let mut buf = [0u8; 64];
        let mut total = Vec::new();
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= 64);
            total.extend_from_slice(&buf[..n]);
        }
        assert_eq!(total, body);
    }
}
