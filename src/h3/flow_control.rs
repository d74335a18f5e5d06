//! MAX_DATA / MAX_STREAM_DATA accounting for HTTP/3 streams.
//!
//! One [`StreamFlow`] tracks the connection and one tracks each stream. The
//! receive side enforces the limit we advertised (overrun is a fatal
//! FLOW_CONTROL_ERROR) and decides when to advertise more once the
//! application has consumed data. The send side never lets output exceed
//! what the peer allowed.

use crate::error::{Error, TransportError};

#[derive(Debug, Clone)]
pub struct StreamFlow {
    // Send side (limited by the peer's MAX_DATA / MAX_STREAM_DATA)
    send_max: u64,
    sent: u64,

    // Recv side (we advertise the limit)
    recv_max: u64,
    received: u64,
    consumed: u64,
    window: u64,
}

impl StreamFlow {
    /// `window` is our receive window, `peer_limit` the initial send limit.
    pub fn new(window: u64, peer_limit: u64) -> Self {
        Self { send_max: peer_limit, sent: 0, recv_max: window, received: 0, consumed: 0, window }
    }

    // --- Send side ---

    /// How many bytes can we send right now?
    pub fn send_capacity(&self) -> u64 {
        self.send_max.saturating_sub(self.sent)
    }

    /// Record bytes sent. Exceeding the peer's limit is a local bug and is
    /// refused rather than applied.
    pub fn on_send(&mut self, bytes: u64) -> Result<(), Error> {
        let sent = self.sent.checked_add(bytes).ok_or(Error::InvalidState)?;
        if sent > self.send_max {
            return Err(Error::InvalidState);
        }
        self.sent = sent;
        Ok(())
    }

    /// Peer raised its limit. Limits never shrink; a smaller value is ignored.
    pub fn on_max(&mut self, limit: u64) -> bool {
        if limit > self.send_max {
            self.send_max = limit;
            return true;
        }
        false
    }

    pub fn is_send_blocked(&self) -> bool {
        self.sent >= self.send_max
    }

    // --- Recv side ---

    /// Record bytes received. Going past what we advertised is fatal.
    pub fn on_recv(&mut self, bytes: u64) -> Result<(), Error> {
        let received = self
            .received
            .checked_add(bytes)
            .ok_or(Error::Transport(TransportError::FlowControlError))?;
        if received > self.recv_max {
            return Err(Error::Transport(TransportError::FlowControlError));
        }
        self.received = received;
        Ok(())
    }

    /// The application took `bytes` off the receive buffer.
    pub fn on_consumed(&mut self, bytes: u64) {
        self.consumed = (self.consumed + bytes).min(self.received);
    }

    /// New limit to advertise once less than half the window remains.
    pub fn should_update(&self) -> Option<u64> {
        let remaining = self.recv_max.saturating_sub(self.consumed);
        if remaining < self.window / 2 {
            let next = self.consumed + self.window;
            if next > self.recv_max {
                return Some(next);
            }
        }
        None
    }

    /// The limit from [`should_update`](Self::should_update) went out.
    pub fn update_sent(&mut self, limit: u64) {
        self.recv_max = self.recv_max.max(limit);
    }

    pub fn recv_limit(&self) -> u64 {
        self.recv_max
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_up_to_limit_then_blocked() {
        let mut f = StreamFlow::new(1000, 100);
        assert_eq!(f.send_capacity(), 100);
        f.on_send(60).unwrap();
        f.on_send(40).unwrap();
        assert!(f.is_send_blocked());
        assert_eq!(f.on_send(1), Err(Error::InvalidState));
        assert!(f.on_max(150));
        assert_eq!(f.send_capacity(), 50);
    }

    #[test]
    fn max_is_monotonic() {
        let mut f = StreamFlow::new(1000, 100);
        assert!(!f.on_max(50));
        assert_eq!(f.send_capacity(), 100);
    }

    #[test]
    fn recv_overrun_is_flow_control_error() {
        let mut f = StreamFlow::new(100, 0);
        f.on_recv(100).unwrap();
        assert_eq!(f.on_recv(1), Err(Error::Transport(TransportError::FlowControlError)));
        assert_eq!(f.on_recv(u64::MAX), Err(Error::Transport(TransportError::FlowControlError)));
    }

    #[test]
    fn update_after_half_consumed() {
        let mut f = StreamFlow::new(100, 0);
        f.on_recv(80).unwrap();
        assert_eq!(f.should_update(), None);
        f.on_consumed(60);
        assert_eq!(f.should_update(), Some(160));
        f.update_sent(160);
        assert_eq!(f.recv_limit(), 160);
        assert_eq!(f.should_update(), None);
        f.on_recv(80).unwrap();
    }

    #[test]
    fn consumed_never_exceeds_received() {
        let mut f = StreamFlow::new(100, 0);
        f.on_recv(10).unwrap();
        f.on_consumed(50);
        assert_eq!(f.should_update(), None);
    }
}
