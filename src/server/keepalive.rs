//! Adaptive `Keep-Alive` tuning.
//!
//! Each worker counts new connections against requests served on reused
//! connections. Every period the reuse ratio picks a target (long-lived
//! when clients reuse heavily, short when they don't) and the advertised
//! `timeout`/`max` move towards it by an exponential moving average.

use crate::config::KeepAliveConfig;
use crate::timer::Instant;

const PERIOD_US: u64 = 5_000_000;
const ALPHA: f64 = 0.2;
const HIGH_RATIO: f64 = 1.5;
const LOW_RATIO: f64 = 0.5;
const LONG: (f64, f64) = (120.0, 500.0);
const SHORT: (f64, f64) = (10.0, 50.0);
const START: (f64, f64) = (30.0, 100.0);

#[derive(Debug, Clone)]
pub struct KeepAliveTuner {
    adaptive: bool,
    timeout_s: f64,
    max: f64,
    new_conns: u64,
    reused: u64,
    period_start: Instant,
}

impl KeepAliveTuner {
    pub fn new(config: &KeepAliveConfig, now: Instant) -> Self {
        let (timeout_s, max) = if config.adaptive {
            START
        } else {
            (config.timeout_s as f64, config.max_requests as f64)
        };
        Self { adaptive: config.adaptive, timeout_s, max, new_conns: 0, reused: 0, period_start: now }
    }

    pub fn on_connection(&mut self) {
        self.new_conns += 1;
    }

    /// A request arrived on a connection that already served one.
    pub fn on_reuse(&mut self) {
        self.reused += 1;
    }

    /// Re-evaluate once per period.
    pub fn tick(&mut self, now: Instant) {
        if !self.adaptive || now.saturating_sub(self.period_start) < PERIOD_US {
            return;
        }
        self.period_start = now;
        let (new, reused) = (std::mem::take(&mut self.new_conns), std::mem::take(&mut self.reused));
        if new == 0 && reused == 0 {
            return;
        }
        let ratio = if new == 0 { f64::INFINITY } else { reused as f64 / new as f64 };
        let (t, m) = if ratio > HIGH_RATIO {
            LONG
        } else if ratio < LOW_RATIO {
            SHORT
        } else {
            return;
        };
        self.timeout_s = (1.0 - ALPHA) * self.timeout_s + ALPHA * t;
        self.max = (1.0 - ALPHA) * self.max + ALPHA * m;
    }

    /// Current `(timeout seconds, max requests)` to advertise.
    pub fn current(&self) -> (u64, u32) {
        (self.timeout_s.round() as u64, self.max.round() as u32)
    }

    pub fn idle_timeout_us(&self) -> u64 {
        self.current().0.saturating_mul(1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptive() -> KeepAliveTuner {
        KeepAliveTuner::new(&KeepAliveConfig::default(), 0)
    }

    #[test]
    fn heavy_reuse_extends() {
        let mut tuner = adaptive();
        assert_eq!(tuner.current(), (30, 100));
        for _ in 0..10 {
            tuner.on_connection();
        }
        for _ in 0..40 {
            tuner.on_reuse();
        }
        tuner.tick(PERIOD_US);
        assert_eq!(tuner.current(), (48, 180));
    }

    #[test]
    fn light_reuse_shortens_and_converges() {
        let mut tuner = adaptive();
        for period in 1..=40 {
            tuner.on_connection();
            tuner.tick(period * PERIOD_US);
        }
        assert_eq!(tuner.current(), (10, 50));
    }

    #[test]
    fn waits_for_the_period() {
        let mut tuner = adaptive();
        tuner.on_connection();
        tuner.tick(PERIOD_US - 1);
        assert_eq!(tuner.current(), (30, 100));
    }

    #[test]
    fn middle_ratio_holds() {
        let mut tuner = adaptive();
        tuner.on_connection();
        tuner.on_reuse();
        tuner.tick(PERIOD_US);
        assert_eq!(tuner.current(), (30, 100));
    }

    #[test]
    fn fixed_when_not_adaptive() {
        let config = KeepAliveConfig { adaptive: false, timeout_s: 15, max_requests: 7 };
        let mut tuner = KeepAliveTuner::new(&config, 0);
        tuner.on_connection();
        tuner.tick(10 * PERIOD_US);
        assert_eq!(tuner.current(), (15, 7));
    }
}
