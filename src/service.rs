//! Contracts with the collaborators around the request-processing core.
//!
//! Routing policy, TLS record protection, the QUIC packet layer, upstream
//! backends and metrics emission all live outside the core. The worker only
//! talks to them through the traits in this module, handed in once at
//! startup as [`Services`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::h3::KeyPhase;
use crate::http::header::{HeaderList, HeaderSlice, Slice};
use crate::http::{Method, Protocol, Request, ResponseDescriptor, RouteDecision, UpstreamTarget, Version};
use crate::pipeline::StaticFiles;

/// Routing / policy collaborator. One instance per worker.
pub trait Router {
    /// Decide what to do with a fully-parsed request.
    fn route(&mut self, req: &Request<'_>) -> RouteDecision;
}

/// Which transport carried a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Quic,
}

/// Structured lifecycle events for the metrics/logging collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsEvent {
    ConnectionOpened { conn: u64, transport: Transport },
    ConnectionClosed { conn: u64, bytes_in: u64, bytes_out: u64 },
    ProtocolSelected { conn: u64, protocol: Protocol },
    RequestCompleted { conn: u64, stream: u64, status: u16, latency_us: u64 },
    ProtocolError { conn: u64, error: Error },
    StreamReset { conn: u64, stream: u64, code: u64 },
    WorkerStarted { worker: usize },
    WorkerStopped { worker: usize },
}

/// Metrics sink. Called on the worker thread; must not block.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &MetricsEvent);
}

/// Default sink: every event becomes a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, event: &MetricsEvent) {
        match *event {
            MetricsEvent::ConnectionOpened { conn, transport } => debug!(conn, ?transport, "connection opened"),
            MetricsEvent::ConnectionClosed { conn, bytes_in, bytes_out } => {
                debug!(conn, bytes_in, bytes_out, "connection closed")
            }
            MetricsEvent::ProtocolSelected { conn, protocol } => {
                debug!(conn, protocol = protocol.as_str(), "protocol selected")
            }
            MetricsEvent::RequestCompleted { conn, stream, status, latency_us } => {
                info!(conn, stream, status, latency_us, "request completed")
            }
            MetricsEvent::ProtocolError { conn, error } => warn!(conn, %error, "protocol error"),
            MetricsEvent::StreamReset { conn, stream, code } => debug!(conn, stream, code, "stream reset"),
            MetricsEvent::WorkerStarted { worker } => info!(worker, "worker started"),
            MetricsEvent::WorkerStopped { worker } => info!(worker, "worker stopped"),
        }
    }
}

/// Result of a completed TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// ALPN protocol name, if the client offered one we accepted.
    pub protocol: Option<Vec<u8>>,
    /// Highest packet protection level with keys (QUIC only).
    pub key_phase: Option<KeyPhase>,
}

/// TLS record layer for one TCP connection. Opaque to the core.
pub trait TlsSession: Send {
    /// Consume ciphertext from `input`, appending any plaintext to `plain`.
    /// Returns the bytes of `input` used. A bad record is [`Error::Crypto`].
    fn decrypt(&mut self, input: &[u8], plain: &mut Vec<u8>) -> Result<usize, Error>;
    /// Protect `plain`, appending records to `out`.
    fn encrypt(&mut self, plain: &[u8], out: &mut Vec<u8>) -> Result<(), Error>;
    /// Handshake bytes waiting to go to the peer.
    fn handshake_output(&mut self, out: &mut Vec<u8>);
    /// `Some` once the handshake is complete.
    fn negotiate(&mut self) -> Option<Negotiated>;
}

/// Creates a [`TlsSession`] per accepted connection.
pub trait TlsProvider: Send + Sync {
    fn accept(&self) -> Result<Box<dyn TlsSession>, Error>;
}

/// An owned copy of a request for a backend call that may outlive the
/// connection buffers it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub protocol: Protocol,
    pub method: Method,
    pub path: Vec<u8>,
    pub authority: Option<Vec<u8>>,
    pub version: Version,
    /// Header bytes, laid out as recorded by `slices`.
    buf: Vec<u8>,
    slices: Vec<HeaderSlice>,
    pub body: Vec<u8>,
}

impl ProxyRequest {
    pub fn from_request(req: &Request<'_>) -> Self {
        let mut buf = Vec::new();
        let mut slices = Vec::with_capacity(req.headers.len());
        for h in req.headers.iter() {
            let name = Slice::new(buf.len(), h.name.len());
            buf.extend_from_slice(h.name);
            let value = Slice::new(buf.len(), h.value.len());
            buf.extend_from_slice(h.value);
            slices.push(HeaderSlice { name, value });
        }
        Self {
            protocol: req.protocol,
            method: req.method,
            path: req.path.to_vec(),
            authority: req.authority.map(<[u8]>::to_vec),
            version: req.version,
            buf,
            slices,
            body: req.body.to_vec(),
        }
    }

    /// Borrowed view with the same shape the router saw.
    pub fn as_request(&self, stream_id: u64) -> Request<'_> {
        Request {
            protocol: self.protocol,
            stream_id,
            method: self.method,
            path: &self.path,
            authority: self.authority.as_deref(),
            version: self.version,
            headers: HeaderList::new(&self.buf, &self.slices),
            body: &self.body,
        }
    }
}

/// Backend for proxied requests. Each call must give up after `timeout`
/// with [`Error::UpstreamTimeout`]; retries are the worker's job.
pub trait UpstreamClient {
    fn call(
        &mut self,
        target: &UpstreamTarget,
        req: &ProxyRequest,
        timeout: Duration,
    ) -> Result<ResponseDescriptor, Error>;
}

/// What the QUIC packet layer reports for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuicEvent {
    KeysInstalled(KeyPhase),
    Crypto { phase: KeyPhase, data: Vec<u8> },
    /// Ordered, reassembled bytes of a stream.
    Stream { stream_id: u64, data: Vec<u8>, fin: bool },
    Reset { stream_id: u64, code: u64 },
    MaxData(u64),
    MaxStreamData { stream_id: u64, limit: u64 },
    Closed,
}

/// One QUIC connection as seen by the HTTP/3 handler. Loss recovery,
/// congestion control and packet protection stay behind this trait.
pub trait QuicTransport: Send {
    fn id(&self) -> u64;
    /// ALPN agreed during the handshake.
    fn alpn(&self) -> Option<&[u8]>;
    fn poll_event(&mut self) -> Option<QuicEvent>;
    /// Hand CRYPTO bytes accepted at `phase` to the TLS collaborator.
    fn send_crypto(&mut self, phase: KeyPhase, data: &[u8]) -> Result<(), Error>;
    fn send_stream(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<(), Error>;
    fn reset_stream(&mut self, stream_id: u64, code: u64) -> Result<(), Error>;
    fn send_max_data(&mut self, limit: u64) -> Result<(), Error>;
    fn send_max_stream_data(&mut self, stream_id: u64, limit: u64) -> Result<(), Error>;
    /// Close with an HTTP/3 application error code.
    fn close(&mut self, code: u64);
}

/// A worker's QUIC endpoint: owns the UDP socket and hands out connections.
pub trait QuicAcceptor: Send {
    /// The socket the worker polls for readability.
    fn socket(&mut self) -> &mut mio::net::UdpSocket;
    /// Process received datagrams, pushing newly established connections
    /// to `out` and the ids of existing connections that now have events
    /// to `ready`. Connections not named in `ready` are left alone until
    /// their deadline.
    fn accept(
        &mut self,
        now_us: u64,
        out: &mut Vec<Box<dyn QuicTransport>>,
        ready: &mut Vec<u64>,
    ) -> Result<(), Error>;
    /// Send whatever the connections queued.
    fn flush(&mut self, now_us: u64) -> Result<(), Error>;
    /// Earliest packet-layer deadline (loss detection, pacing).
    fn next_timeout(&self) -> Option<u64>;
}

pub type RouterFactory = Arc<dyn Fn() -> Box<dyn Router> + Send + Sync>;
pub type UpstreamFactory = Arc<dyn Fn() -> Box<dyn UpstreamClient> + Send + Sync>;
pub type QuicFactory = Arc<dyn Fn(usize) -> Result<Box<dyn QuicAcceptor>, Error> + Send + Sync>;

/// The collaborators a server runs with. Cloned into every worker; the
/// factories build per-worker instances.
#[derive(Clone)]
pub struct Services {
    pub router: RouterFactory,
    pub upstream: Option<UpstreamFactory>,
    pub metrics: Arc<dyn MetricsSink>,
    pub tls: Option<Arc<dyn TlsProvider>>,
    pub quic: Option<QuicFactory>,
}

impl Services {
    pub fn new(router: RouterFactory) -> Self {
        Self { router, upstream: None, metrics: Arc::new(TracingSink), tls: None, quic: None }
    }

    /// Serve files under `root` and nothing else.
    pub fn static_files(root: impl AsRef<Path>) -> Self {
        let files = StaticFiles::new(root);
        Self::new(Arc::new(move || Box::new(files.clone()) as Box<dyn Router>))
    }

    pub fn with_upstream(mut self, upstream: UpstreamFactory) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_tls(mut self, tls: Arc<dyn TlsProvider>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_quic(mut self, quic: QuicFactory) -> Self {
        self.quic = Some(quic);
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("upstream", &self.upstream.is_some())
            .field("tls", &self.tls.is_some())
            .field("quic", &self.quic.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_request_keeps_headers() {
        let buf = b"acceptapplication/jsonx-idabc";
        let slices = [
            HeaderSlice { name: Slice::new(0, 6), value: Slice::new(6, 16) },
            HeaderSlice { name: Slice::new(22, 4), value: Slice::new(26, 3) },
        ];
        let req = Request {
            protocol: Protocol::Http2,
            stream_id: 7,
            method: Method::POST,
            path: b"/api",
            authority: Some(b"backend"),
            version: Version::Http11,
            headers: HeaderList::new(buf, &slices),
            body: b"{}",
        };
        let owned = ProxyRequest::from_request(&req);
        let view = owned.as_request(7);
        assert_eq!(view.header(b"x-id"), Some(&b"abc"[..]));
        assert_eq!(view.header(b"host"), Some(&b"backend"[..]));
        assert_eq!(view.body, b"{}");
        assert_eq!(view.path, b"/api");
    }

    #[test]
    fn default_sink_is_tracing() {
        let services = Services::static_files(".");
        services.metrics.record(&MetricsEvent::WorkerStarted { worker: 0 });
        assert!(services.upstream.is_none());
        assert!(format!("{services:?}").contains("tls: false"));
    }
}
