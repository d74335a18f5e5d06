//! Worker threads: one readiness loop each, sharing nothing mutable.
//!
//! A worker owns its poller, page pool, timer wheel, keep-alive tuner and
//! every connection it accepted. Sockets arrive from the worker's own
//! `SO_REUSEPORT` listeners or from the acceptor thread's handoff channel.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token, Waker};
use tracing::{debug, info, trace, warn};

use crate::arena::PagePool;
use crate::config::WorkerConfig;
use crate::error::{Error, H3Error};
use crate::pipeline::Pipeline;
use crate::service::{MetricsEvent, MetricsSink, QuicAcceptor, QuicTransport, Router, Services, TlsProvider};
use crate::timer::{DEFAULT_SLOTS, DEFAULT_TICK_US, Instant, TimerId, TimerWheel};

use super::connection::Connection;
use super::exchange::WorkerCtx;
use super::h3_session::H3Session;
use super::keepalive::KeepAliveTuner;
use super::listener::Inbox;
use super::poller::{EVENT_BATCH, Poller, Readiness};
use super::upstream::UpstreamRetry;

const WAKE: Token = Token(usize::MAX);
const QUIC: Token = Token(usize::MAX - 1);
/// Listener `i` uses `Token(LISTENER_BASE - i)`.
const LISTENER_BASE: usize = usize::MAX - 2;
const MAX_LISTENERS: usize = 64;

/// Longest single wait, so a shutdown request is noticed promptly.
const MAX_WAIT: Duration = Duration::from_millis(250);

/// A worker before its thread starts. Everything here is `Send`; the
/// per-thread collaborators are built inside [`run`](Self::run).
pub struct Worker {
    index: usize,
    config: Arc<WorkerConfig>,
    services: Services,
    poller: Poller,
    waker: Arc<Waker>,
    listeners: Vec<TcpListener>,
    inbox: Option<Inbox>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        index: usize,
        config: Arc<WorkerConfig>,
        services: Services,
        mut listeners: Vec<TcpListener>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let poller = Poller::new()?;
        let waker = Arc::new(poller.waker(WAKE)?);
        if listeners.len() > MAX_LISTENERS {
            warn!(worker = index, count = listeners.len(), "too many listeners; extra ones ignored");
            listeners.truncate(MAX_LISTENERS);
        }
        for (i, listener) in listeners.iter_mut().enumerate() {
            poller.registry().register(listener, Token(LISTENER_BASE - i), Interest::READABLE)?;
        }
        Ok(Self { index, config, services, poller, waker, listeners, inbox: None, shutdown })
    }

    /// Waker that interrupts this worker's wait.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Receive sockets from the acceptor thread.
    pub fn set_inbox(&mut self, inbox: Inbox) {
        self.inbox = Some(inbox);
    }

    /// Run until shutdown is requested and every connection has drained.
    pub fn run(self) -> Result<(), Error> {
        let mut reactor = Reactor::new(self)?;
        reactor.shared.metrics.record(&MetricsEvent::WorkerStarted { worker: reactor.index });
        let result = reactor.event_loop();
        if let Err(e) = &result {
            warn!(worker = reactor.index, error = %e, "worker loop failed");
        }
        reactor.close_all();
        reactor.shared.metrics.record(&MetricsEvent::WorkerStopped { worker: reactor.index });
        result
    }
}

/// Collaborators every connection handler borrows through [`WorkerCtx`].
struct Shared {
    config: Arc<WorkerConfig>,
    pool: PagePool,
    router: Box<dyn Router>,
    pipeline: Pipeline,
    upstream: Option<UpstreamRetry>,
    metrics: Arc<dyn MetricsSink>,
    tuner: KeepAliveTuner,
    draining: bool,
}

impl Shared {
    fn ctx(&mut self, now: Instant) -> WorkerCtx<'_> {
        WorkerCtx {
            config: &self.config,
            pool: &mut self.pool,
            router: self.router.as_mut(),
            pipeline: &self.pipeline,
            upstream: self.upstream.as_mut(),
            metrics: self.metrics.as_ref(),
            keep_alive: &mut self.tuner,
            now,
            draining: self.draining,
        }
    }
}

struct Slot {
    conn: Connection,
    timer: Option<(TimerId, Instant)>,
}

struct QuicSlot {
    session: H3Session,
    timer: Option<(TimerId, Instant)>,
}

/// What a fired timer belongs to.
#[derive(Debug, Clone, Copy)]
enum Due {
    Tcp(usize),
    Quic(u64),
}

struct Reactor {
    index: usize,
    epoch: std::time::Instant,
    poller: Poller,
    listeners: Vec<TcpListener>,
    inbox: Option<Inbox>,
    quic: Option<Box<dyn QuicAcceptor>>,
    tls: Option<Arc<dyn TlsProvider>>,
    shutdown: Arc<AtomicBool>,
    shared: Shared,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    live: usize,
    timers: TimerWheel<Due>,
    h3: HashMap<u64, QuicSlot>,
    /// Sessions with transport events to process on this iteration.
    quic_ready: Vec<u64>,
    next_id: u64,
    drain_deadline: Option<Instant>,
}

impl Reactor {
    fn new(worker: Worker) -> Result<Self, Error> {
        let Worker { index, config, services, poller, listeners, inbox, shutdown, .. } = worker;
        let epoch = std::time::Instant::now();
        let mut quic = match (&services.quic, config.quic_listen) {
            (Some(factory), Some(_)) => Some(factory(index)?),
            _ => None,
        };
        if let Some(acceptor) = quic.as_mut() {
            poller.registry().register(acceptor.socket(), QUIC, Interest::READABLE)?;
        }
        let shared = Shared {
            pool: PagePool::new(config.limits.max_connections_per_worker.saturating_mul(2).saturating_add(2)),
            router: (services.router)(),
            pipeline: Pipeline::from_config(&config),
            upstream: services.upstream.as_ref().map(|factory| UpstreamRetry::new(factory(), &config.upstream)),
            metrics: services.metrics.clone(),
            tuner: KeepAliveTuner::new(&config.keep_alive, 0),
            draining: false,
            config,
        };
        Ok(Self {
            index,
            epoch,
            poller,
            listeners,
            inbox,
            quic,
            tls: services.tls.clone(),
            shutdown,
            shared,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            timers: TimerWheel::new(DEFAULT_TICK_US, DEFAULT_SLOTS, 0),
            h3: HashMap::new(),
            quic_ready: Vec::new(),
            next_id: (index as u64) << 48,
            drain_deadline: None,
        })
    }

    fn now(&self) -> Instant {
        self.epoch.elapsed().as_micros() as u64
    }

    fn event_loop(&mut self) -> Result<(), Error> {
        let mut batch: Vec<Readiness> = Vec::with_capacity(EVENT_BATCH);
        let mut fired = Vec::new();
        loop {
            let now = self.now();
            if !self.shared.draining && self.shutdown.load(Ordering::Relaxed) {
                self.begin_drain(now);
            }
            if self.shared.draining {
                if self.live == 0 && self.h3.is_empty() {
                    debug!(worker = self.index, "drained");
                    return Ok(());
                }
                if self.drain_deadline.is_some_and(|d| now >= d) {
                    info!(worker = self.index, open = self.live + self.h3.len(), "drain deadline passed; closing");
                    return Ok(());
                }
            }

            let timeout = self.poll_timeout(now);
            self.poller.wait(Some(timeout), &mut batch)?;
            let now = self.now();
            for ready in &batch {
                match ready.token {
                    WAKE => self.accept_handed(now),
                    QUIC => self.accept_quic(now),
                    Token(t) if t > LISTENER_BASE - MAX_LISTENERS && t <= LISTENER_BASE => {
                        self.accept(LISTENER_BASE - t, now)
                    }
                    Token(key) => self.on_ready(key, *ready, now),
                }
            }

            self.timers.advance(now, &mut fired);
            for due in fired.drain(..) {
                match due {
                    Due::Tcp(key) => self.on_timer(key, now),
                    Due::Quic(id) => self.on_quic_timer(id, now),
                }
            }
            self.service_quic(now);
            self.shared.tuner.tick(now);
        }
    }

    fn poll_timeout(&self, now: Instant) -> Duration {
        let deadlines = [self.timers.next_deadline(), self.quic.as_ref().and_then(|q| q.next_timeout())];
        match deadlines.into_iter().flatten().min() {
            Some(at) => Duration::from_micros(at.saturating_sub(now)).min(MAX_WAIT),
            None => MAX_WAIT,
        }
    }

    fn begin_drain(&mut self, now: Instant) {
        info!(worker = self.index, connections = self.live, "draining");
        self.shared.draining = true;
        let idle = self.shared.config.limits.idle_timeout_ms.saturating_mul(1_000);
        self.drain_deadline = Some(now.saturating_add(idle));
        for listener in &mut self.listeners {
            if let Err(e) = self.poller.registry().deregister(listener) {
                debug!(error = %e, "listener deregister failed");
            }
        }
        self.listeners.clear();
        let keys: Vec<usize> = (0..self.slots.len()).filter(|&k| self.slots[k].is_some()).collect();
        for key in keys {
            if let Some(slot) = self.slots[key].as_mut() {
                slot.conn.begin_drain();
            }
            self.drive(key, now);
        }
        for (id, slot) in &mut self.h3 {
            slot.session.begin_drain();
            self.quic_ready.push(*id);
        }
    }

    fn accept(&mut self, index: usize, now: Instant) {
        loop {
            let Some(listener) = self.listeners.get(index) else { return };
            match listener.accept() {
                Ok((stream, peer)) => {
                    trace!(worker = self.index, %peer, "accepted");
                    self.open(stream, now);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(worker = self.index, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn accept_handed(&mut self, now: Instant) {
        while let Some(stream) = self.inbox.as_ref().and_then(Inbox::try_recv) {
            if let Err(e) = stream.set_nonblocking(true) {
                debug!(error = %e, "handed socket unusable");
                continue;
            }
            self.open(TcpStream::from_std(stream), now);
        }
    }

    fn open(&mut self, stream: TcpStream, now: Instant) {
        if self.shared.draining || self.live >= self.shared.config.limits.max_connections_per_worker {
            debug!(worker = self.index, live = self.live, "connection refused at capacity");
            return;
        }
        let tls = match &self.tls {
            Some(provider) => match provider.accept() {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(error = %e, "tls session setup failed");
                    return;
                }
            },
            None => None,
        };
        let id = self.next_id;
        self.next_id += 1;
        let mut ctx = self.shared.ctx(now);
        let mut conn = match Connection::open(id, stream, tls, &mut ctx) {
            Ok(conn) => conn,
            Err(e) => {
                debug!(conn = id, error = %e, "no arena for connection");
                return;
            }
        };
        let key = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });
        let interest = Interest::READABLE | Interest::WRITABLE;
        if let Err(e) = self.poller.registry().register(conn.socket_mut(), Token(key), interest) {
            warn!(conn = id, error = %e, "register failed");
            conn.close(&mut ctx);
            self.free.push(key);
            return;
        }
        self.slots[key] = Some(Slot { conn, timer: None });
        self.live += 1;
        self.drive(key, now);
    }

    fn on_ready(&mut self, key: usize, ready: Readiness, now: Instant) {
        if ready.failed {
            self.drive(key, now);
            self.close(key, now);
            return;
        }
        self.drive(key, now);
    }

    fn on_timer(&mut self, key: usize, now: Instant) {
        let Some(slot) = self.slots.get_mut(key).and_then(Option::as_mut) else { return };
        slot.timer = None;
        let alive = slot.conn.on_timer(&mut self.shared.ctx(now));
        self.after(key, alive, now);
    }

    fn drive(&mut self, key: usize, now: Instant) {
        let Some(slot) = self.slots.get_mut(key).and_then(Option::as_mut) else { return };
        let alive = slot.conn.drive(&mut self.shared.ctx(now));
        self.after(key, alive, now);
    }

    /// Close a finished connection or re-arm its timer.
    fn after(&mut self, key: usize, alive: bool, now: Instant) {
        if !alive {
            self.close(key, now);
            return;
        }
        let Some(slot) = self.slots.get_mut(key).and_then(Option::as_mut) else { return };
        let deadline = slot.conn.deadline(&self.shared.config.limits, self.shared.tuner.idle_timeout_us());
        match (slot.timer, deadline) {
            (Some((_, armed)), Some(at)) if armed == at => {}
            (old, new) => {
                if let Some((id, _)) = old {
                    self.timers.cancel(id);
                }
                slot.timer = new.map(|at| (self.timers.schedule(at, Due::Tcp(key)), at));
            }
        }
    }

    fn close(&mut self, key: usize, now: Instant) {
        let Some(mut slot) = self.slots.get_mut(key).and_then(Option::take) else { return };
        if let Some((id, _)) = slot.timer {
            self.timers.cancel(id);
        }
        if let Err(e) = self.poller.registry().deregister(slot.conn.socket_mut()) {
            trace!(error = %e, "deregister failed");
        }
        slot.conn.close(&mut self.shared.ctx(now));
        self.free.push(key);
        self.live -= 1;
    }

    fn accept_quic(&mut self, now: Instant) {
        let Some(acceptor) = self.quic.as_mut() else { return };
        let mut fresh: Vec<Box<dyn QuicTransport>> = Vec::new();
        if let Err(e) = acceptor.accept(now, &mut fresh, &mut self.quic_ready) {
            warn!(worker = self.index, error = %e, "quic receive failed");
        }
        for transport in fresh {
            if self.shared.draining {
                let mut transport = transport;
                transport.close(H3Error::NoError.to_code());
                continue;
            }
            match H3Session::open(transport, &mut self.shared.ctx(now)) {
                Ok(session) => {
                    let id = session.id();
                    self.quic_ready.push(id);
                    self.h3.insert(id, QuicSlot { session, timer: None });
                }
                Err(e) => debug!(error = %e, "quic connection refused"),
            }
        }
    }

    fn on_quic_timer(&mut self, id: u64, now: Instant) {
        let Some(slot) = self.h3.get_mut(&id) else { return };
        slot.timer = None;
        let alive = slot.session.on_timer(&mut self.shared.ctx(now));
        self.after_quic(id, alive, now);
    }

    /// Run the HTTP/3 sessions the acceptor flagged, then let the packet
    /// layer send.
    fn service_quic(&mut self, now: Instant) {
        if self.quic.is_none() {
            return;
        }
        let mut ready = std::mem::take(&mut self.quic_ready);
        ready.sort_unstable();
        ready.dedup();
        for id in ready.drain(..) {
            let Some(slot) = self.h3.get_mut(&id) else { continue };
            let alive = slot.session.poll(&mut self.shared.ctx(now));
            self.after_quic(id, alive, now);
        }
        self.quic_ready = ready;
        if let Some(acceptor) = self.quic.as_mut()
            && let Err(e) = acceptor.flush(now)
        {
            warn!(worker = self.index, error = %e, "quic send failed");
        }
    }

    /// Close a finished session or re-arm its timer.
    fn after_quic(&mut self, id: u64, alive: bool, now: Instant) {
        if !alive {
            let Some(slot) = self.h3.remove(&id) else { return };
            if let Some((timer, _)) = slot.timer {
                self.timers.cancel(timer);
            }
            trace!(conn = id, "h3 session finished");
            slot.session.close(&mut self.shared.ctx(now));
            return;
        }
        let Some(slot) = self.h3.get_mut(&id) else { return };
        match (slot.timer, slot.session.next_deadline()) {
            (Some((_, armed)), Some(at)) if armed == at => {}
            (old, new) => {
                if let Some((timer, _)) = old {
                    self.timers.cancel(timer);
                }
                slot.timer = new.map(|at| (self.timers.schedule(at, Due::Quic(id)), at));
            }
        }
    }

    fn close_all(&mut self) {
        let now = self.now();
        for key in 0..self.slots.len() {
            self.close(key, now);
        }
        for (_, slot) in std::mem::take(&mut self.h3) {
            slot.session.close(&mut self.shared.ctx(now));
        }
    }
}
