//! Static file source: the default router.
//!
//! Maps a request path onto a file under the document root and answers
//! with a [`FileRegion`] body so the bytes go out by zero-copy transfer.
//! Handles directory index files, weak validators, `If-None-Match`,
//! single byte ranges and `HEAD`.

use std::borrow::Cow;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::http::header::{IF_NONE_MATCH, RANGE, trim_ows};
use crate::http::{Body, Method, Request, ResponseDescriptor, RouteDecision, StatusCode};
use crate::service::Router;

use super::sendfile::FileRegion;

const INDEX_FILE: &str = "index.html";

#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    /// Serve files below `root`. The root is canonicalised once so symlinks
    /// cannot be used to step outside it.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the response for `req`.
    pub fn resolve(&self, req: &Request<'_>) -> ResponseDescriptor {
        if !matches!(req.method, Method::GET | Method::HEAD) {
            return ResponseDescriptor::for_status(StatusCode::METHOD_NOT_ALLOWED).with_header("allow", "GET, HEAD");
        }
        let Some(path) = self.map_path(req.path_only()) else {
            return ResponseDescriptor::for_status(StatusCode::NOT_FOUND);
        };
        let path = if path.is_dir() { path.join(INDEX_FILE) } else { path };
        let Ok(file) = File::open(&path) else {
            return ResponseDescriptor::for_status(StatusCode::NOT_FOUND);
        };
        let meta = match file.metadata() {
            Ok(meta) if meta.is_file() => meta,
            _ => return ResponseDescriptor::for_status(StatusCode::NOT_FOUND),
        };
        let size = meta.len();
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        let etag = format!("W/\"{size:x}-{mtime:x}\"");

        if let Some(candidates) = req.header(IF_NONE_MATCH)
            && etag_matches(candidates, &etag)
        {
            let mut resp = ResponseDescriptor::new(StatusCode::NOT_MODIFIED).with_header("etag", etag);
            resp.head_only = true;
            return resp;
        }

        let mut resp = ResponseDescriptor::new(StatusCode::OK)
            .with_header("etag", etag)
            .with_header("accept-ranges", "bytes");
        resp.content_type = Some(Cow::Borrowed(mime_for(&path)));

        let (offset, len) = match req.header(RANGE).map(|r| parse_range(r, size)) {
            None | Some(RangeSpec::Ignore) => (0, size),
            Some(RangeSpec::Unsatisfiable) => {
                return ResponseDescriptor::for_status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .with_header("content-range", format!("bytes */{size}"));
            }
            Some(RangeSpec::Bytes { start, end }) => {
                resp.status = StatusCode::PARTIAL_CONTENT;
                resp = resp.with_header("content-range", format!("bytes {start}-{end}/{size}"));
                (start, end - start + 1)
            }
        };
        debug!(path = %path.display(), offset, len, "static file");
        resp.body = Body::File(FileRegion::new(file, offset, len));
        resp.head_only = req.method.is_head();
        resp
    }

    /// Percent-decode and confine the request path to the root. `None` for
    /// traversal attempts, NUL bytes, or paths escaping through symlinks.
    fn map_path(&self, raw: &[u8]) -> Option<PathBuf> {
        let decoded = percent_decode(raw)?;
        if decoded.contains('\0') || decoded.contains('\\') {
            return None;
        }
        let mut path = self.root.clone();
        for component in Path::new(decoded.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        let real = path.canonicalize().ok()?;
        real.starts_with(&self.root).then_some(real)
    }
}

impl Router for StaticFiles {
    fn route(&mut self, req: &Request<'_>) -> RouteDecision {
        RouteDecision::Respond(self.resolve(req))
    }
}

fn percent_decode(raw: &[u8]) -> Option<String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let hi = hex_val(*raw.get(i + 1)?)?;
            let lo = hex_val(*raw.get(i + 2)?)?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Weak comparison against an `If-None-Match` list (RFC 9110 §13.1.2).
fn etag_matches(candidates: &[u8], etag: &str) -> bool {
    let opaque = |tag: &[u8]| -> Vec<u8> { tag.strip_prefix(b"W/").unwrap_or(tag).to_vec() };
    let ours = opaque(etag.as_bytes());
    candidates.split(|&b| b == b',').map(trim_ows).any(|c| c == b"*" || opaque(c) == ours)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    /// Absent, multi-range or unparsable: send the whole file.
    Ignore,
    Unsatisfiable,
    /// Inclusive byte positions.
    Bytes { start: u64, end: u64 },
}

fn parse_range(value: &[u8], size: u64) -> RangeSpec {
    let Some(spec) = trim_ows(value).strip_prefix(b"bytes=") else {
        return RangeSpec::Ignore;
    };
    if spec.contains(&b',') {
        return RangeSpec::Ignore;
    }
    let Some(dash) = spec.iter().position(|&b| b == b'-') else {
        return RangeSpec::Ignore;
    };
    let (first, last) = (trim_ows(&spec[..dash]), trim_ows(&spec[dash + 1..]));
    let number = |s: &[u8]| std::str::from_utf8(s).ok()?.parse::<u64>().ok();
    match (first.is_empty(), last.is_empty()) {
        (true, true) => RangeSpec::Ignore,
        // Suffix range: the last N bytes.
        (true, false) => match number(last) {
            Some(0) => RangeSpec::Unsatisfiable,
            Some(_) if size == 0 => RangeSpec::Unsatisfiable,
            Some(n) => RangeSpec::Bytes { start: size.saturating_sub(n), end: size - 1 },
            None => RangeSpec::Ignore,
        },
        (false, _) => {
            let Some(start) = number(first) else {
                return RangeSpec::Ignore;
            };
            let end = if last.is_empty() { Some(u64::MAX) } else { number(last) };
            match end {
                None => RangeSpec::Ignore,
                Some(end) if end < start => RangeSpec::Ignore,
                Some(_) if start >= size => RangeSpec::Unsatisfiable,
                Some(end) => RangeSpec::Bytes { start, end: end.min(size - 1) },
            }
        }
    }
}

/// Media type by file extension.
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "map" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
