//! Response pipeline: body source → content filter → protocol framer.
//!
//! [`Pipeline::prepare`] turns the router's [`ResponseDescriptor`] into a
//! [`PreparedResponse`]: final header list, chosen content coding, and a
//! [`BodySource`] the protocol handler pulls from. Static files bypass
//! compression and stay file regions; dynamic bytes are read into the
//! connection's arena staging exactly once per piece.

pub mod encoding;
pub mod framer;
pub mod sendfile;
pub mod static_files;

use std::borrow::Cow;
use std::io;

use tracing::warn;

use crate::config::{CompressionConfig, WorkerConfig};
use crate::http::header::{ACCEPT_ENCODING, eq_ignore_case};
use crate::http::{Body, Protocol, Request, ResponseDescriptor, StatusCode, Version};

pub use encoding::{BodyReader, Encoding, compress, is_compressible, negotiate_encoding};
pub use framer::{ConnectionDirective, Http1Framer};
pub use sendfile::{FileRegion, send_file};
pub use static_files::StaticFiles;

const HSTS_VALUE: &str = "max-age=31536000; includeSubDomains";

/// Where response body bytes come from.
#[derive(Debug, Default)]
pub enum BodySource {
    #[default]
    Empty,
    Reader(BodyReader),
    File(FileRegion),
}

impl BodySource {
    /// Pull the next piece of body bytes into `dst`; 0 at the end.
    pub fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self {
            BodySource::Empty => Ok(0),
            BodySource::Reader(r) => io::Read::read(r, dst),
            BodySource::File(f) => f.read_into(dst),
        }
    }

    /// Bytes left, when known. Lets a framer mark the last piece as final
    /// without a trailing empty read.
    pub fn remaining(&self) -> Option<u64> {
        match self {
            BodySource::Empty => Some(0),
            BodySource::Reader(r) => r.remaining(),
            BodySource::File(f) => Some(f.len),
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileRegion> {
        match self {
            BodySource::File(f) => Some(f),
            _ => None,
        }
    }
}

/// A response ready for a protocol framer.
#[derive(Debug)]
pub struct PreparedResponse {
    pub status: StatusCode,
    /// Lower-case names; no connection-specific fields.
    pub headers: Vec<(Cow<'static, str>, String)>,
    pub body: BodySource,
    /// Body length when known up front; `None` for compressed streams.
    pub length: Option<u64>,
}

impl PreparedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    /// Header pairs as byte slices, the shape the HTTP/2 and HTTP/3 encoders take.
    pub fn header_pairs(&self) -> Vec<(&[u8], &[u8])> {
        self.headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())).collect()
    }

    /// Whether any body bytes follow the head.
    pub fn has_body(&self) -> bool {
        !matches!(self.body, BodySource::Empty)
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    compression: CompressionConfig,
    hsts: bool,
}

impl Pipeline {
    pub fn new(compression: CompressionConfig, hsts: bool) -> Self {
        Self { compression, hsts }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.compression.clone(), config.tls.as_ref().is_some_and(|t| t.hsts))
    }

    pub fn compression(&self) -> &CompressionConfig {
        &self.compression
    }

    /// Apply the filter chain to a router response for `req`.
    pub fn prepare(&self, req: &Request<'_>, resp: ResponseDescriptor) -> PreparedResponse {
        let ResponseDescriptor { status, mut headers, body, content_type, head_only } = resp;
        let head_only = head_only || req.method.is_head();
        if let Some(ct) = &content_type
            && !has_header(&headers, "content-type")
        {
            headers.push((Cow::Borrowed("content-type"), ct.to_string()));
        }
        if self.hsts && !has_header(&headers, "strict-transport-security") {
            headers.push((Cow::Borrowed("strict-transport-security"), HSTS_VALUE.to_string()));
        }

        let (body, length) = if status.forbids_body() {
            (BodySource::Empty, None)
        } else {
            match body {
                Body::Empty => (BodySource::Empty, Some(0)),
                Body::File(region) => {
                    let len = region.len;
                    if head_only { (BodySource::Empty, Some(len)) } else { (BodySource::File(region), Some(len)) }
                }
                Body::Bytes(bytes) => {
                    let len = bytes.len() as u64;
                    let encoding = self.choose_encoding(req, &mut headers, content_type.as_deref(), bytes.len());
                    if head_only {
                        (BodySource::Empty, Some(len))
                    } else if encoding == Encoding::Identity {
                        (BodySource::Reader(BodyReader::identity(bytes)), Some(len))
                    } else {
                        match BodyReader::new(encoding, bytes, &self.compression) {
                            Ok(reader) => {
                                headers.push((Cow::Borrowed("content-encoding"), encoding.token().to_string()));
                                (BodySource::Reader(reader), None)
                            }
                            Err(e) => {
                                warn!(error = %e, ?encoding, "compressor setup failed");
                                return PreparedResponse {
                                    status: StatusCode::INTERNAL_SERVER_ERROR,
                                    headers: vec![(Cow::Borrowed("content-length"), "0".to_string())],
                                    body: BodySource::Empty,
                                    length: Some(0),
                                };
                            }
                        }
                    }
                }
            }
        };
        if let Some(len) = length
            && status != StatusCode::NOT_MODIFIED
            && !has_header(&headers, "content-length")
        {
            headers.push((Cow::Borrowed("content-length"), len.to_string()));
        }
        PreparedResponse { status, headers, body, length }
    }

    /// Decide the content coding and add `Vary` when the answer depended on
    /// the request. HEAD answers describe the identity representation.
    fn choose_encoding(
        &self,
        req: &Request<'_>,
        headers: &mut Vec<(Cow<'static, str>, String)>,
        content_type: Option<&str>,
        len: usize,
    ) -> Encoding {
        let eligible = content_type.is_some_and(is_compressible)
            && len >= self.compression.min_size
            && !has_header(headers, "content-encoding");
        if !eligible {
            return Encoding::Identity;
        }
        if !has_header(headers, "vary") {
            headers.push((Cow::Borrowed("vary"), "accept-encoding".to_string()));
        }
        // HTTP/1.0 cannot frame a body of unknown length without closing.
        let streaming = req.protocol != Protocol::Http1 || req.version == Version::Http11;
        if req.method.is_head() || !streaming {
            return Encoding::Identity;
        }
        negotiate_encoding(req.header(ACCEPT_ENCODING), &self.compression.preference)
    }
}

fn has_header(headers: &[(Cow<'static, str>, String)], name: &str) -> bool {
    headers.iter().any(|(n, _)| eq_ignore_case(n.as_bytes(), name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::header::{HeaderList, HeaderSlice, Slice};
    use crate::http::Method;

    fn request<'a>(method: Method, version: Version, buf: &'a [u8], slices: &'a [HeaderSlice]) -> Request<'a> {
        Request {
            protocol: Protocol::Http1,
            stream_id: 1,
            method,
            path: b"/",
            authority: None,
            version,
            headers: HeaderList::new(buf, slices),
            body: &[],
        }
    }

    fn accept_gzip() -> (&'static [u8], [HeaderSlice; 1]) {
        (b"accept-encodinggzip", [HeaderSlice { name: Slice::new(0, 15), value: Slice::new(15, 4) }])
    }

    fn html(len: usize) -> ResponseDescriptor {
        let mut resp = ResponseDescriptor::new(StatusCode::OK).with_body(b"<p>".repeat(len / 3));
        resp.content_type = Some(Cow::Borrowed("text/html"));
        resp
    }

    #[test]
    fn large_text_is_compressed_and_streamed() {
        let pipeline = Pipeline::new(CompressionConfig::default(), false);
        let (buf, slices) = accept_gzip();
        let prepared = pipeline.prepare(&request(Method::GET, Version::Http11, buf, &slices), html(4096));
        assert_eq!(prepared.header("content-encoding"), Some("gzip"));
        assert_eq!(prepared.header("vary"), Some("accept-encoding"));
        assert_eq!(prepared.header("content-type"), Some("text/html"));
        assert_eq!(prepared.length, None);
        assert_eq!(prepared.header("content-length"), None);
    }

    #[test]
    fn small_bodies_stay_identity() {
        let pipeline = Pipeline::new(CompressionConfig::default(), false);
        let (buf, slices) = accept_gzip();
        let prepared = pipeline.prepare(&request(Method::GET, Version::Http11, buf, &slices), html(300));
        assert_eq!(prepared.header("content-encoding"), None);
        assert_eq!(prepared.header("vary"), None);
        assert_eq!(prepared.header("content-length"), Some("300"));
    }

    #[test]
    fn http10_gets_identity_with_length() {
        let pipeline = Pipeline::new(CompressionConfig::default(), false);
        let (buf, slices) = accept_gzip();
        let prepared = pipeline.prepare(&request(Method::GET, Version::Http10, buf, &slices), html(4096));
        assert_eq!(prepared.header("content-encoding"), None);
        assert_eq!(prepared.header("vary"), Some("accept-encoding"));
        assert_eq!(prepared.length, Some(4095));
    }

    #[test]
    fn head_keeps_length_drops_body() {
        let pipeline = Pipeline::new(CompressionConfig::default(), false);
        let prepared = pipeline.prepare(&request(Method::HEAD, Version::Http11, b"", &[]), html(30));
        assert!(!prepared.has_body());
        assert_eq!(prepared.header("content-length"), Some("30"));
    }

    #[test]
    fn no_content_has_no_length() {
        let pipeline = Pipeline::new(CompressionConfig::default(), true);
        let resp = ResponseDescriptor::new(StatusCode::NO_CONTENT);
        let prepared = pipeline.prepare(&request(Method::GET, Version::Http11, b"", &[]), resp);
        assert_eq!(prepared.header("content-length"), None);
        assert_eq!(prepared.header("strict-transport-security"), Some(HSTS_VALUE));
    }

    #[test]
    fn streamed_body_decodes_to_original() {
        use std::io::Read;
        let pipeline = Pipeline::new(CompressionConfig::default(), false);
        let (buf, slices) = accept_gzip();
        let original = b"<p>".repeat(2000);
        let mut prepared = pipeline.prepare(&request(Method::GET, Version::Http11, buf, &slices), html(6000));
        let mut packed = Vec::new();
        let mut piece = [0u8; 100];
        loop {
            let n = prepared.body.read(&mut piece).unwrap();
            if n == 0 {
                break;
            }
            packed.extend_from_slice(&piece[..n]);
        }
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(&packed[..]).read_to_end(&mut out).unwrap();
        assert_eq!(out, original);
    }
}
