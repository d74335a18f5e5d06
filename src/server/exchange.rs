//! Request dispatch shared by the protocol sessions.
//!
//! A session hands a fully-parsed [`Request`] to [`dispatch`], which asks
//! the router, runs the pipeline over its answer and, for proxied
//! requests, makes the first upstream attempt. A retry that has to wait
//! comes back as [`Dispatch::Deferred`] and is parked by the session until
//! its `retry_at` deadline.

use tracing::{debug, warn};

use crate::arena::PagePool;
use crate::config::WorkerConfig;
use crate::http::header::{HeaderList, HeaderSlice, Slice};
use crate::http::{Method, Protocol, Request, ResponseDescriptor, RouteDecision, StatusCode, UpstreamTarget, Version};
use crate::pipeline::{Pipeline, PreparedResponse};
use crate::service::{MetricsEvent, MetricsSink, ProxyRequest, Router};
use crate::timer::Instant;

use super::keepalive::KeepAliveTuner;
use super::upstream::{Outcome, UpstreamRetry, failure_response};

/// Worker-owned state a session may use while handling one event.
pub struct WorkerCtx<'a> {
    pub config: &'a WorkerConfig,
    pub pool: &'a mut PagePool,
    pub router: &'a mut dyn Router,
    pub pipeline: &'a Pipeline,
    pub upstream: Option<&'a mut UpstreamRetry>,
    pub metrics: &'a dyn MetricsSink,
    pub keep_alive: &'a mut KeepAliveTuner,
    /// Microseconds since the worker started.
    pub now: Instant,
    /// Shutdown was requested; finish what is in flight, accept nothing new.
    pub draining: bool,
}

impl WorkerCtx<'_> {
    pub fn record(&self, event: MetricsEvent) {
        self.metrics.record(&event);
    }

    pub fn completed(&self, conn: u64, stream: u64, status: StatusCode, started: Instant) {
        self.record(MetricsEvent::RequestCompleted {
            conn,
            stream,
            status: status.0,
            latency_us: self.now.saturating_sub(started),
        });
    }
}

/// Request header fields decoded by HPACK or QPACK, owned until the
/// request completes.
#[derive(Debug, Default)]
pub struct FieldBlock {
    buf: Vec<u8>,
    slices: Vec<HeaderSlice>,
    method: Option<Method>,
    path: Option<Slice>,
    authority: Option<Slice>,
}

impl FieldBlock {
    pub fn push(&mut self, name: &[u8], value: &[u8]) {
        let at = self.buf.len();
        self.buf.extend_from_slice(value);
        let value_slice = Slice::new(at, value.len());
        match name {
            b":method" => self.method = Method::from_bytes(value),
            b":path" => self.path = Some(value_slice),
            b":authority" => self.authority = Some(value_slice),
            _ if name.first() == Some(&b':') => {}
            _ => {
                let name_at = self.buf.len();
                self.buf.extend_from_slice(name);
                self.slices.push(HeaderSlice { name: Slice::new(name_at, name.len()), value: value_slice });
            }
        }
    }

    /// `:method` and a non-empty `:path` are present.
    pub fn is_complete(&self) -> bool {
        self.method.is_some() && self.path.is_some_and(|p| p.len > 0)
    }

    pub fn request<'a>(&'a self, protocol: Protocol, stream_id: u64, body: &'a [u8]) -> Request<'a> {
        Request {
            protocol,
            stream_id,
            method: self.method.unwrap_or(Method::GET),
            path: self.path.map_or(&b"/"[..], |p| p.get(&self.buf)),
            authority: self.authority.map(|a| a.get(&self.buf)),
            version: Version::Http11,
            headers: HeaderList::new(&self.buf, &self.slices),
            body,
        }
    }
}

/// A proxied request waiting for its next attempt.
#[derive(Debug)]
pub struct Deferred {
    pub target: UpstreamTarget,
    pub request: ProxyRequest,
    /// Attempts made so far.
    pub attempt: u32,
    pub retry_at: Instant,
}

#[derive(Debug)]
pub enum Dispatch {
    Ready(PreparedResponse),
    Deferred(Deferred),
    /// Policy block: drop the exchange without a response.
    Terminate,
}

pub fn dispatch(ctx: &mut WorkerCtx<'_>, req: &Request<'_>) -> Dispatch {
    match ctx.router.route(req) {
        RouteDecision::Respond(resp) => Dispatch::Ready(ctx.pipeline.prepare(req, resp)),
        RouteDecision::Terminate => {
            debug!(stream = req.stream_id, "request terminated by policy");
            Dispatch::Terminate
        }
        RouteDecision::Proxy(target) => {
            if ctx.upstream.is_none() {
                warn!(authority = %target.authority, "proxy route without an upstream client");
                return Dispatch::Ready(ctx.pipeline.prepare(req, ResponseDescriptor::for_status(StatusCode::BAD_GATEWAY)));
            }
            let deferred = Deferred { target, request: ProxyRequest::from_request(req), attempt: 0, retry_at: ctx.now };
            retry(ctx, deferred, req.stream_id)
        }
    }
}

/// Make the next upstream attempt for a parked request.
pub fn retry(ctx: &mut WorkerCtx<'_>, mut deferred: Deferred, stream_id: u64) -> Dispatch {
    let resp = match ctx.upstream.as_deref_mut() {
        None => ResponseDescriptor::for_status(StatusCode::BAD_GATEWAY),
        Some(upstream) => {
            deferred.attempt += 1;
            match upstream.attempt(&deferred.target, &deferred.request, deferred.attempt) {
                Outcome::Response(resp) => resp,
                Outcome::Retry { after } => {
                    deferred.retry_at = ctx.now.saturating_add(after.as_micros() as u64);
                    return Dispatch::Deferred(deferred);
                }
                Outcome::Failed(e) => failure_response(e),
            }
        }
    };
    Dispatch::Ready(ctx.pipeline.prepare(&deferred.request.as_request(stream_id), resp))
}

/// Response for a failure the core detected itself (bad request, budget
/// exceeded), when there is no parsed request to answer.
pub fn error_response(pipeline: &Pipeline, protocol: Protocol, version: Version, status: StatusCode) -> PreparedResponse {
    let req = Request {
        protocol,
        stream_id: 0,
        method: Method::GET,
        path: b"/",
        authority: None,
        version,
        headers: HeaderList::new(&[], &[]),
        body: &[],
    };
    pipeline.prepare(&req, ResponseDescriptor::for_status(status))
}

/// Split `deferred` into those due at `now` and those still waiting.
pub fn take_due<K>(deferred: &mut Vec<(K, Deferred)>, now: Instant) -> Vec<(K, Deferred)> {
    let mut due = Vec::new();
    let mut i = 0;
    while i < deferred.len() {
        if deferred[i].1.retry_at <= now {
            due.push(deferred.swap_remove(i));
        } else {
            i += 1;
        }
    }
    due
}

/// Earliest retry deadline.
pub fn next_retry<K>(deferred: &[(K, Deferred)]) -> Option<Instant> {
    deferred.iter().map(|(_, d)| d.retry_at).min()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::UpstreamConfig;
    use crate::error::Error;
    use crate::service::{TracingSink, UpstreamClient};

    /// Owns everything a [`WorkerCtx`] borrows.
    pub(crate) struct Harness {
        pub config: WorkerConfig,
        pub pool: PagePool,
        pub router: Box<dyn Router>,
        pub pipeline: Pipeline,
        pub upstream: Option<UpstreamRetry>,
        pub tuner: KeepAliveTuner,
        pub now: Instant,
    }

    impl Harness {
        pub fn new(router: Box<dyn Router>) -> Self {
            let config = WorkerConfig::default();
            Self {
                pool: PagePool::new(16),
                pipeline: Pipeline::from_config(&config),
                tuner: KeepAliveTuner::new(&config.keep_alive, 0),
                config,
                router,
                upstream: None,
                now: 0,
            }
        }

        pub fn ctx(&mut self) -> WorkerCtx<'_> {
            WorkerCtx {
                config: &self.config,
                pool: &mut self.pool,
                router: self.router.as_mut(),
                pipeline: &self.pipeline,
                upstream: self.upstream.as_mut(),
                metrics: &TracingSink,
                keep_alive: &mut self.tuner,
                now: self.now,
                draining: false,
            }
        }
    }

    struct ProxyAll;

    impl Router for ProxyAll {
        fn route(&mut self, req: &Request<'_>) -> RouteDecision {
            let path = String::from_utf8_lossy(req.path).into_owned();
            RouteDecision::Proxy(UpstreamTarget { authority: "backend:80".to_string(), path })
        }
    }

    struct FlakyBackend {
        failures: u32,
    }

    impl UpstreamClient for FlakyBackend {
        fn call(&mut self, _: &UpstreamTarget, req: &ProxyRequest, _: Duration) -> Result<ResponseDescriptor, Error> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(Error::UpstreamTimeout);
            }
            Ok(ResponseDescriptor::text(StatusCode::OK, &String::from_utf8_lossy(&req.path)))
        }
    }

    fn get(path: &'static [u8]) -> Request<'static> {
        Request {
            protocol: Protocol::Http2,
            stream_id: 3,
            method: Method::GET,
            path,
            authority: None,
            version: Version::Http11,
            headers: HeaderList::new(&[], &[]),
            body: &[],
        }
    }

    #[test]
    fn field_block_separates_pseudo_headers() {
        let mut fields = FieldBlock::default();
        assert!(!fields.is_complete());
        for (name, value) in [
            (&b":method"[..], &b"POST"[..]),
            (b":scheme", b"https"),
            (b":path", b"/upload?x=1"),
            (b":authority", b"example.com"),
            (b"content-type", b"text/plain"),
        ] {
            fields.push(name, value);
        }
        assert!(fields.is_complete());
        let req = fields.request(Protocol::Http3, 4, b"abc");
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.path, b"/upload?x=1");
        assert_eq!(req.authority, Some(&b"example.com"[..]));
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.headers.get(b"content-type"), Some(&b"text/plain"[..]));
        assert_eq!(req.body, b"abc");
    }

    #[test]
    fn proxy_without_client_is_bad_gateway() {
        let mut h = Harness::new(Box::new(ProxyAll));
        match dispatch(&mut h.ctx(), &get(b"/x")) {
            Dispatch::Ready(resp) => assert_eq!(resp.status, StatusCode::BAD_GATEWAY),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn timed_out_attempt_is_parked_then_retried() {
        let mut h = Harness::new(Box::new(ProxyAll));
        let config = UpstreamConfig::default();
        h.upstream = Some(UpstreamRetry::new(Box::new(FlakyBackend { failures: 1 }), &config));
        h.now = 1_000;
        let deferred = match dispatch(&mut h.ctx(), &get(b"/slow")) {
            Dispatch::Deferred(d) => d,
            other => panic!("expected deferral, got {other:?}"),
        };
        assert_eq!(deferred.attempt, 1);
        assert!(deferred.retry_at >= 1_000 + 90_000);

        let mut parked = vec![(3u64, deferred)];
        assert!(take_due(&mut parked, 1_001).is_empty());
        let due = take_due(&mut parked, u64::MAX);
        assert!(parked.is_empty());
        let (stream, d) = due.into_iter().next().unwrap();
        match retry(&mut h.ctx(), d, stream) {
            Dispatch::Ready(resp) => {
                assert_eq!(resp.status, StatusCode::OK);
                assert_eq!(resp.length, Some(5));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_retries_are_gateway_timeout() {
        let mut h = Harness::new(Box::new(ProxyAll));
        let config = UpstreamConfig { max_attempts: 1, ..UpstreamConfig::default() };
        h.upstream = Some(UpstreamRetry::new(Box::new(FlakyBackend { failures: 5 }), &config));
        match dispatch(&mut h.ctx(), &get(b"/down")) {
            Dispatch::Ready(resp) => assert_eq!(resp.status, StatusCode::GATEWAY_TIMEOUT),
            other => panic!("unexpected {other:?}"),
        }
    }
}
