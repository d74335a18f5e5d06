//! Proxied requests with bounded retries.
//!
//! Every attempt gets its own timeout. A timed-out or unreachable backend
//! is retried after an exponential backoff with ±10 % jitter, up to the
//! configured attempt count; the last failure becomes a gateway response.
//! The worker never sleeps: a retry is parked on the timer wheel.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::error::Error;
use crate::http::{ResponseDescriptor, StatusCode, UpstreamTarget};
use crate::service::{ProxyRequest, UpstreamClient};

const JITTER: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(Duration::from_millis(config.base_backoff_ms), Duration::from_millis(config.max_backoff_ms))
    }

    /// Delay before retry number `retry` (1 = first retry).
    pub fn delay(&self, retry: u32, rng: &mut fastrand::Rng) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let nominal = self.base.saturating_mul(1u32 << exp).min(self.max);
        let spread = (rng.f64() * 2.0 - 1.0) * JITTER;
        nominal.mul_f64(1.0 + spread)
    }
}

/// What to do after one attempt.
#[derive(Debug)]
pub enum Outcome {
    Response(ResponseDescriptor),
    Retry { after: Duration },
    Failed(Error),
}

pub struct UpstreamRetry {
    client: Box<dyn UpstreamClient>,
    attempt_timeout: Duration,
    max_attempts: u32,
    backoff: Backoff,
    rng: fastrand::Rng,
}

impl UpstreamRetry {
    pub fn new(client: Box<dyn UpstreamClient>, config: &UpstreamConfig) -> Self {
        Self::with_rng(client, config, fastrand::Rng::new())
    }

    pub fn with_rng(client: Box<dyn UpstreamClient>, config: &UpstreamConfig, rng: fastrand::Rng) -> Self {
        Self {
            client,
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::from_config(config),
            rng,
        }
    }

    /// Run attempt number `attempt` (1-based).
    pub fn attempt(&mut self, target: &UpstreamTarget, req: &ProxyRequest, attempt: u32) -> Outcome {
        match self.client.call(target, req, self.attempt_timeout) {
            Ok(resp) => Outcome::Response(resp),
            Err(e @ (Error::UpstreamTimeout | Error::UpstreamUnavailable)) if attempt < self.max_attempts => {
                let after = self.backoff.delay(attempt, &mut self.rng);
                debug!(authority = %target.authority, attempt, error = %e, ?after, "upstream retry scheduled");
                Outcome::Retry { after }
            }
            Err(e) => {
                warn!(authority = %target.authority, attempt, error = %e, "upstream failed");
                Outcome::Failed(e)
            }
        }
    }
}

impl std::fmt::Debug for UpstreamRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamRetry")
            .field("attempt_timeout", &self.attempt_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Gateway response for a proxied request that could not be completed.
pub fn failure_response(error: Error) -> ResponseDescriptor {
    ResponseDescriptor::for_status(error.status().unwrap_or(StatusCode::BAD_GATEWAY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Protocol, Request, Version};
    use crate::http::header::HeaderList;

    struct Scripted {
        answers: Vec<Result<ResponseDescriptor, Error>>,
    }

    impl UpstreamClient for Scripted {
        fn call(&mut self, _: &UpstreamTarget, _: &ProxyRequest, _: Duration) -> Result<ResponseDescriptor, Error> {
            if self.answers.is_empty() {
                return Err(Error::UpstreamUnavailable);
            }
            self.answers.remove(0)
        }
    }

    fn request() -> ProxyRequest {
        ProxyRequest::from_request(&Request {
            protocol: Protocol::Http1,
            stream_id: 1,
            method: Method::GET,
            path: b"/",
            authority: None,
            version: Version::Http11,
            headers: HeaderList::new(b"", &[]),
            body: &[],
        })
    }

    fn target() -> UpstreamTarget {
        UpstreamTarget { authority: "backend:80".to_string(), path: "/".to_string() }
    }

    #[test]
    fn backoff_grows_and_caps_with_jitter() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000));
        let mut rng = fastrand::Rng::with_seed(7);
        for (retry, nominal) in [(1, 100.0), (2, 200.0), (3, 400.0), (4, 800.0), (5, 1_000.0), (30, 1_000.0)] {
            let d = backoff.delay(retry, &mut rng).as_secs_f64() * 1_000.0;
            assert!(d >= nominal * 0.9 - 1e-6 && d <= nominal * 1.1 + 1e-6, "retry {retry}: {d}");
        }
    }

    #[test]
    fn timeouts_retry_until_exhausted() {
        let config = UpstreamConfig { max_attempts: 3, ..UpstreamConfig::default() };
        let client = Scripted { answers: (0..3).map(|_| Err(Error::UpstreamTimeout)).collect() };
        let mut retry = UpstreamRetry::with_rng(Box::new(client), &config, fastrand::Rng::with_seed(1));
        let (t, req) = (target(), request());
        assert!(matches!(retry.attempt(&t, &req, 1), Outcome::Retry { .. }));
        assert!(matches!(retry.attempt(&t, &req, 2), Outcome::Retry { .. }));
        match retry.attempt(&t, &req, 3) {
            Outcome::Failed(e) => assert_eq!(failure_response(e).status, StatusCode::GATEWAY_TIMEOUT),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn success_after_retry() {
        let config = UpstreamConfig::default();
        let client = Scripted {
            answers: vec![Err(Error::UpstreamTimeout), Ok(ResponseDescriptor::text(StatusCode::OK, "hi"))],
        };
        let mut retry = UpstreamRetry::new(Box::new(client), &config);
        let (t, req) = (target(), request());
        assert!(matches!(retry.attempt(&t, &req, 1), Outcome::Retry { .. }));
        match retry.attempt(&t, &req, 2) {
            Outcome::Response(resp) => assert_eq!(resp.status, StatusCode::OK),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn other_errors_do_not_retry() {
        let client = Scripted { answers: vec![Err(Error::Crypto)] };
        let mut retry = UpstreamRetry::new(Box::new(client), &UpstreamConfig::default());
        assert!(matches!(retry.attempt(&target(), &request(), 1), Outcome::Failed(Error::Crypto)));
    }
}
