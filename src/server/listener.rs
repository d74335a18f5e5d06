//! Listening sockets and the paths accepted sockets take to a worker.
//!
//! With `reuse_port` every worker binds its own `SO_REUSEPORT` listener and
//! the kernel spreads connections. With `handoff` one acceptor thread owns
//! the listeners and passes each accepted socket to exactly one worker,
//! round-robin, over a channel plus a `mio::Waker`.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Interest, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::Error;

use super::poller::Poller;

const BACKLOG: i32 = 1024;
const ACCEPT_TICK: Duration = Duration::from_millis(100);

/// Bind a non-blocking TCP listener.
pub fn bind_tcp(addr: SocketAddr, reuse_port: bool) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        set_reuse_port(&socket)?;
    }
    if let SocketAddr::V6(v6) = addr {
        socket.set_only_v6(!v6.ip().is_unspecified())?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_socket: &Socket) -> io::Result<()> {
    warn!("SO_REUSEPORT not available on this platform");
    Ok(())
}

/// Bind one listener per address for each of `workers` workers. A port 0
/// address is resolved by the first bind so every worker shares the port.
pub fn bind_reuse_port(addrs: &[SocketAddr], workers: usize) -> Result<Vec<Vec<TcpListener>>, Error> {
    let mut resolved = addrs.to_vec();
    let mut per_worker = Vec::with_capacity(workers);
    for worker in 0..workers {
        let mut listeners = Vec::with_capacity(resolved.len());
        for addr in resolved.iter_mut() {
            let std = bind_tcp(*addr, true)?;
            *addr = std.local_addr()?;
            if worker == 0 {
                info!(addr = %addr, "listener bound");
            }
            listeners.push(TcpListener::from_std(std));
        }
        per_worker.push(listeners);
    }
    Ok(per_worker)
}

/// Worker end of the handoff channel.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<TcpStream>,
}

impl Inbox {
    /// Next socket handed to this worker, if any.
    pub fn try_recv(&self) -> Option<TcpStream> {
        self.rx.try_recv().ok()
    }
}

struct Outbox {
    tx: mpsc::Sender<TcpStream>,
    waker: Arc<Waker>,
}

/// Single accept thread distributing sockets round-robin.
pub struct Acceptor {
    poller: Poller,
    listeners: Vec<TcpListener>,
    workers: Vec<Outbox>,
    next: usize,
    shutdown: Arc<AtomicBool>,
}

impl Acceptor {
    pub fn new(addrs: &[SocketAddr], shutdown: Arc<AtomicBool>) -> Result<Self, Error> {
        let poller = Poller::new()?;
        let mut listeners = Vec::with_capacity(addrs.len());
        for (i, &addr) in addrs.iter().enumerate() {
            let mut listener = TcpListener::from_std(bind_tcp(addr, false)?);
            poller.registry().register(&mut listener, Token(i), Interest::READABLE)?;
            info!(addr = %listener.local_addr()?, "listener bound");
            listeners.push(listener);
        }
        Ok(Self { poller, listeners, workers: Vec::new(), next: 0, shutdown })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(|l| l.local_addr().ok()).collect()
    }

    /// Attach a worker; its waker fires whenever a socket is queued for it.
    pub fn add_worker(&mut self, waker: Arc<Waker>) -> Inbox {
        let (tx, rx) = mpsc::channel();
        self.workers.push(Outbox { tx, waker });
        Inbox { rx }
    }

    /// Accept until shutdown.
    pub fn run(mut self) -> Result<(), Error> {
        let mut batch = Vec::new();
        while !self.shutdown.load(Ordering::Relaxed) {
            self.poller.wait(Some(ACCEPT_TICK), &mut batch)?;
            for ready in &batch {
                self.drain(ready.token.0);
            }
        }
        debug!("acceptor stopped");
        Ok(())
    }

    fn drain(&mut self, index: usize) {
        let Some(listener) = self.listeners.get(index) else { return };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let stream = into_std(stream);
                    if self.workers.is_empty() {
                        return;
                    }
                    let target = self.next % self.workers.len();
                    self.next = self.next.wrapping_add(1);
                    let outbox = &self.workers[target];
                    if outbox.tx.send(stream).is_err() {
                        warn!(worker = target, %peer, "worker gone; dropping connection");
                        continue;
                    }
                    if let Err(e) = outbox.waker.wake() {
                        warn!(worker = target, error = %e, "worker wake failed");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }
}

/// Hand a mio socket across threads as a plain std socket.
fn into_std(stream: mio::net::TcpStream) -> TcpStream {
    let fd: std::os::fd::OwnedFd = stream.into();
    TcpStream::from(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_port_workers_share_a_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listeners = bind_reuse_port(&[addr], 2).unwrap();
        let a = listeners[0][0].local_addr().unwrap();
        let b = listeners[1][0].local_addr().unwrap();
        assert_ne!(a.port(), 0);
        assert_eq!(a, b);
    }

    #[test]
    fn handoff_round_robin() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut acceptor = Acceptor::new(&["127.0.0.1:0".parse().unwrap()], shutdown.clone()).unwrap();
        let addr = acceptor.local_addrs()[0];
        let p0 = Poller::new().unwrap();
        let p1 = Poller::new().unwrap();
        let in0 = acceptor.add_worker(Arc::new(p0.waker(Token(0)).unwrap()));
        let in1 = acceptor.add_worker(Arc::new(p1.waker(Token(0)).unwrap()));
        let thread = std::thread::spawn(move || acceptor.run());

        let _c1 = std::net::TcpStream::connect(addr).unwrap();
        let _c2 = std::net::TcpStream::connect(addr).unwrap();
        let mut got = [None, None];
        for _ in 0..200 {
            if got[0].is_none() {
                got[0] = in0.try_recv();
            }
            if got[1].is_none() {
                got[1] = in1.try_recv();
            }
            if got.iter().all(Option::is_some) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, Ordering::Relaxed);
        thread.join().unwrap().unwrap();
        assert!(got.iter().all(Option::is_some));
    }
}
