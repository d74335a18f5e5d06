//! HTTP/2 flow control (RFC 9113 §5.2, §6.9).
//!
//! [`FlowController`] is a send window: the byte budget the peer granted us.
//! [`RecvWindow`] is the budget we granted the peer and decides when to
//! hand out more.

use crate::error::{Error, H2Error};

/// Largest legal window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// Initial stream and connection window (RFC 9113 §6.9.2).
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// Send window.
///
/// Only a SETTINGS_INITIAL_WINDOW_SIZE decrease may push it below zero; a
/// negative window just means nothing can be sent until updates arrive.
#[derive(Debug, Clone)]
pub struct FlowController {
    window: i64,
}

impl FlowController {
    pub fn new(initial_window: u32) -> Self {
        Self { window: initial_window as i64 }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> usize {
        self.window.max(0) as usize
    }

    /// Spend `n` bytes of window. Sending past the window is a local bug.
    pub fn consume(&mut self, n: usize) -> Result<(), Error> {
        if n as i64 > self.window {
            return Err(Error::InvalidState);
        }
        self.window -= n as i64;
        Ok(())
    }

    /// Apply a WINDOW_UPDATE increment.
    pub fn replenish(&mut self, increment: u32) -> Result<(), Error> {
        if increment == 0 {
            return Err(Error::Http2(H2Error::ProtocolError));
        }
        let window = self.window + increment as i64;
        if window > MAX_WINDOW_SIZE as i64 {
            return Err(Error::Http2(H2Error::FlowControlError));
        }
        self.window = window;
        Ok(())
    }

    /// Shift the window by the change in SETTINGS_INITIAL_WINDOW_SIZE.
    pub fn apply_initial_delta(&mut self, delta: i64) -> Result<(), Error> {
        let window = self.window + delta;
        if window > MAX_WINDOW_SIZE as i64 {
            return Err(Error::Http2(H2Error::FlowControlError));
        }
        self.window = window;
        Ok(())
    }
}

/// Receive window we advertised to the peer.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    /// Bytes the peer may still send.
    window: i64,
    /// Bytes the application consumed but we have not re-granted.
    pending: u32,
    target: u32,
}

impl RecvWindow {
    pub fn new(target: u32) -> Self {
        Self { window: target as i64, pending: 0, target }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    /// Account an inbound DATA frame (padding included). Overrunning what
    /// we granted is a FLOW_CONTROL_ERROR.
    pub fn on_data(&mut self, len: u32) -> Result<(), Error> {
        if len as i64 > self.window {
            return Err(Error::Http2(H2Error::FlowControlError));
        }
        self.window -= len as i64;
        Ok(())
    }

    /// The application consumed `n` bytes. Returns the WINDOW_UPDATE
    /// increment to send, once at least half the target is owed.
    pub fn release(&mut self, n: u32) -> Option<u32> {
        self.pending = self.pending.saturating_add(n);
        if self.pending >= self.target / 2 && self.pending > 0 {
            let increment = self.pending.min(MAX_WINDOW_SIZE - self.window.max(0) as u32);
            self.pending = 0;
            if increment == 0 {
                return None;
            }
            self.window += increment as i64;
            return Some(increment);
        }
        None
    }

    /// We changed our SETTINGS_INITIAL_WINDOW_SIZE.
    pub fn retarget(&mut self, target: u32) {
        self.window += target as i64 - self.target as i64;
        self.target = target;
    }
}
