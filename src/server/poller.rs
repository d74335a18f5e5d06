//! Edge-triggered readiness notification over `mio`.

use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token, Waker};

use crate::error::Error;

/// Readiness events taken per wait.
pub const EVENT_BATCH: usize = 256;

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or full hang-up; the connection cannot make progress.
    pub failed: bool,
}

pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> Result<Self, Error> {
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(EVENT_BATCH) })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn waker(&self, token: Token) -> Result<Waker, Error> {
        Ok(Waker::new(self.poll.registry(), token)?)
    }

    /// Wait for up to [`EVENT_BATCH`] events. An interrupted wait returns
    /// an empty batch; any other failure is fatal to the worker.
    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Readiness>) -> Result<(), Error> {
        out.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        out.extend(self.events.iter().map(|ev| Readiness {
            token: ev.token(),
            readable: ev.is_readable() || ev.is_read_closed(),
            writable: ev.is_writable(),
            failed: ev.is_error() || (ev.is_read_closed() && ev.is_write_closed()),
        }));
        Ok(())
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("capacity", &self.events.capacity()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Interest;
    use mio::net::{TcpListener, TcpStream};

    #[test]
    fn reports_listener_readiness() {
        let mut poller = Poller::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        poller.registry().register(&mut listener, Token(7), Interest::READABLE).unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let mut batch = Vec::new();
        for _ in 0..50 {
            poller.wait(Some(Duration::from_millis(20)), &mut batch).unwrap();
            if !batch.is_empty() {
                break;
            }
        }
        assert!(batch.iter().any(|r| r.token == Token(7) && r.readable));
    }

    #[test]
    fn waker_interrupts_wait() {
        let mut poller = Poller::new().unwrap();
        let waker = poller.waker(Token(1)).unwrap();
        waker.wake().unwrap();
        let mut batch = Vec::new();
        poller.wait(Some(Duration::from_secs(5)), &mut batch).unwrap();
        assert_eq!(batch.first().map(|r| r.token), Some(Token(1)));
    }
}
