//! HTTP/2 stream state machine (RFC 9113 §5.1).
//!
//! Only the server-side subset of the graph exists (no push, so no
//! reserved states):
//!
//! ```text
//! idle --HEADERS--> open --END_STREAM recv--> half-closed(remote) --END_STREAM sent--> closed
//!                    \--END_STREAM sent--> half-closed(local) --END_STREAM recv--> closed
//! any --RST_STREAM--> closed
//! ```
//!
//! Every transition is checked. An illegal one leaves the state untouched
//! and returns a stream error.

use crate::error::{Error, StreamFault};

use super::flow_control::{FlowController, RecvWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H2StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug)]
pub struct H2Stream {
    pub id: u32,
    pub state: H2StreamState,
    pub send_window: FlowController,
    pub recv_window: RecvWindow,
    /// Decoded request fields, ready for `recv_headers`.
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub headers_ready: bool,
    /// Received body bytes not yet read by the application.
    pub body: Vec<u8>,
    /// Response HEADERS went out without END_STREAM; DATA is still owed.
    pub body_open: bool,
    pub response_started: bool,
}

impl H2Stream {
    pub fn new(id: u32, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            state: H2StreamState::Idle,
            send_window: FlowController::new(send_window),
            recv_window: RecvWindow::new(recv_window),
            headers: Vec::new(),
            headers_ready: false,
            body: Vec::new(),
            body_open: false,
            response_started: false,
        }
    }

    fn illegal(&self) -> Error {
        Error::stream(self.id as u64, StreamFault::IllegalState)
    }

    /// Request HEADERS arrived.
    pub fn recv_headers(&mut self, end_stream: bool) -> Result<(), Error> {
        match self.state {
            H2StreamState::Idle => self.state = H2StreamState::Open,
            // Trailers
            H2StreamState::Open | H2StreamState::HalfClosedLocal if end_stream => {}
            _ => return Err(self.illegal()),
        }
        if end_stream {
            self.recv_end_stream()?;
        }
        Ok(())
    }

    /// DATA is only legal while the peer's side is open.
    pub fn recv_data(&mut self, end_stream: bool) -> Result<(), Error> {
        if !self.can_recv() {
            return Err(self.illegal());
        }
        if end_stream {
            self.recv_end_stream()?;
        }
        Ok(())
    }

    pub fn recv_end_stream(&mut self) -> Result<(), Error> {
        self.state = match self.state {
            H2StreamState::Open => H2StreamState::HalfClosedRemote,
            H2StreamState::HalfClosedLocal => H2StreamState::Closed,
            _ => return Err(self.illegal()),
        };
        Ok(())
    }

    /// Our END_STREAM went out.
    pub fn send_end_stream(&mut self) -> Result<(), Error> {
        self.state = match self.state {
            H2StreamState::Open => H2StreamState::HalfClosedLocal,
            H2StreamState::HalfClosedRemote => H2StreamState::Closed,
            _ => return Err(self.illegal()),
        };
        Ok(())
    }

    pub fn can_recv(&self) -> bool {
        matches!(self.state, H2StreamState::Open | H2StreamState::HalfClosedLocal)
    }

    pub fn can_send(&self) -> bool {
        matches!(self.state, H2StreamState::Open | H2StreamState::HalfClosedRemote)
    }

    /// RST_STREAM, sent or received. Legal from every state but idle.
    pub fn reset(&mut self) -> Result<(), Error> {
        if self.state == H2StreamState::Idle {
            return Err(self.illegal());
        }
        self.state = H2StreamState::Closed;
        Ok(())
    }

    pub fn has_output(&self) -> bool {
        self.body_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> H2Stream {
        H2Stream::new(1, 65_535, 65_535)
    }

    #[test]
    fn request_then_response() {
        let mut s = stream();
        s.recv_headers(false).unwrap();
        assert_eq!(s.state, H2StreamState::Open);
        s.recv_data(true).unwrap();
        assert_eq!(s.state, H2StreamState::HalfClosedRemote);
        assert!(s.can_send());
        assert!(!s.can_recv());
        s.send_end_stream().unwrap();
        assert_eq!(s.state, H2StreamState::Closed);
    }

    #[test]
    fn response_before_request_body_ends() {
        let mut s = stream();
        s.recv_headers(false).unwrap();
        s.send_end_stream().unwrap();
        assert_eq!(s.state, H2StreamState::HalfClosedLocal);
        s.recv_data(false).unwrap();
        s.recv_headers(true).unwrap();
        assert_eq!(s.state, H2StreamState::Closed);
    }

    #[test]
    fn data_after_close_rejected_and_not_applied() {
        let mut s = stream();
        s.recv_headers(true).unwrap();
        s.send_end_stream().unwrap();
        let err = s.recv_data(false).unwrap_err();
        assert_eq!(err, Error::stream(1, StreamFault::IllegalState));
        assert_eq!(s.state, H2StreamState::Closed);
    }

    #[test]
    fn data_on_idle_rejected() {
        let mut s = stream();
        assert!(s.recv_data(false).is_err());
        assert_eq!(s.state, H2StreamState::Idle);
        assert!(s.reset().is_err());
    }

    #[test]
    fn second_headers_without_end_stream_rejected() {
        let mut s = stream();
        s.recv_headers(false).unwrap();
        assert!(s.recv_headers(false).is_err());
        assert_eq!(s.state, H2StreamState::Open);
    }

    #[test]
    fn double_end_stream_rejected() {
        let mut s = stream();
        s.recv_headers(false).unwrap();
        s.send_end_stream().unwrap();
        assert!(s.send_end_stream().is_err());
        assert_eq!(s.state, H2StreamState::HalfClosedLocal);
    }

    #[test]
    fn reset_closes_from_any_active_state() {
        let mut s = stream();
        s.recv_headers(false).unwrap();
        s.reset().unwrap();
        assert_eq!(s.state, H2StreamState::Closed);
        assert!(!s.can_send());
    }
}
