//! One accepted TCP connection.
//!
//! Owns the socket, the connection's arena (read buffer in the header page,
//! staging area in the body page) and, when TLS is configured, the record
//! layer. The first bytes (or the negotiated ALPN) pick HTTP/1.1 or HTTP/2
//! exactly once; after that every readiness event runs the same
//! read → parse → produce → write loop until the socket would block.

use std::io::{self, Read, Write};

use mio::net::TcpStream;
use tracing::{debug, trace};

use crate::arena::{ConnArena, PageKind, SLOT_SIZE, Span};
use crate::config::Limits;
use crate::error::Error;
use crate::h2::H2Config;
use crate::mux::{Selection, select_protocol};
use crate::service::{MetricsEvent, Negotiated, TlsSession, Transport};
use crate::timer::Instant;

use super::exchange::WorkerCtx;
use super::h2_session::H2Session;
use super::http1_session::Http1Session;

const TLS_READ_CHUNK: usize = 16 * 1024;

/// A connection's arena-resident buffers.
#[derive(Debug)]
pub(super) struct ConnBufs {
    pub arena: ConnArena,
    /// Received plaintext; `filled` bytes are valid.
    pub read: Span,
    pub filled: usize,
    /// Outgoing plaintext between `start` and `end`.
    staging: Span,
    start: usize,
    end: usize,
    /// Bytes that bypassed staging (`sendfile`).
    direct_out: u64,
}

impl ConnBufs {
    pub fn input(&self) -> &[u8] {
        self.arena.bytes(&self.read).get(..self.filled).unwrap_or_default()
    }

    fn read_room(&mut self) -> &mut [u8] {
        let filled = self.filled;
        self.arena.bytes_mut(&self.read).get_mut(filled..).unwrap_or_default()
    }

    pub fn staged(&self) -> &[u8] {
        self.arena.bytes(&self.staging).get(self.start..self.end).unwrap_or_default()
    }

    /// Free space after the staged bytes.
    pub fn stage_room(&mut self) -> &mut [u8] {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
        let end = self.end;
        self.arena.bytes_mut(&self.staging).get_mut(end..).unwrap_or_default()
    }

    /// Mark `n` bytes written into [`stage_room`](Self::stage_room) as staged.
    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.staging.len());
    }

    /// Copy as much of `data` as fits; returns the bytes taken.
    pub fn stage(&mut self, data: &[u8]) -> usize {
        let room = self.stage_room();
        let n = room.len().min(data.len());
        room[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }

    fn consume_staged(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn note_direct(&mut self, n: usize) {
        self.direct_out += n as u64;
    }
}

struct TlsState {
    session: Box<dyn TlsSession>,
    cipher_in: Vec<u8>,
    plain_in: Vec<u8>,
    cipher_out: Vec<u8>,
    out_pos: usize,
    negotiated: Option<Negotiated>,
}

impl TlsState {
    fn pending_out(&self) -> usize {
        self.cipher_out.len() - self.out_pos
    }
}

#[derive(Debug)]
enum Proto {
    Undetermined,
    Http1(Http1Session),
    Http2(Box<H2Session>),
}

pub struct Connection {
    id: u64,
    socket: TcpStream,
    bufs: ConnBufs,
    tls: Option<TlsState>,
    proto: Proto,
    max_header_bytes: usize,
    bytes_in: u64,
    bytes_out: u64,
    last_active: Instant,
    eof: bool,
    /// Fatal: close without flushing further.
    failed: bool,
}

impl Connection {
    /// Set up a freshly accepted socket. Fails when the page pool or the
    /// arena budget cannot hold the connection's buffers.
    pub fn open(
        id: u64,
        socket: TcpStream,
        tls: Option<Box<dyn TlsSession>>,
        ctx: &mut WorkerCtx<'_>,
    ) -> Result<Self, Error> {
        let limits = &ctx.config.limits;
        let mut arena = ConnArena::new(limits.arena_budget);
        let read_len = limits.max_header_bytes.min(limits.arena_budget / 2).max(SLOT_SIZE);
        let staging_len = (limits.arena_budget / 4).clamp(SLOT_SIZE, 4 * SLOT_SIZE);
        let read = match arena.alloc(ctx.pool, PageKind::Header, read_len) {
            Ok(span) => span,
            Err(e) => {
                arena.release_all(ctx.pool);
                return Err(e);
            }
        };
        let staging = match arena.alloc(ctx.pool, PageKind::Body, staging_len) {
            Ok(span) => span,
            Err(e) => {
                arena.release_all(ctx.pool);
                return Err(e);
            }
        };
        ctx.record(MetricsEvent::ConnectionOpened { conn: id, transport: Transport::Tcp });
        ctx.keep_alive.on_connection();
        Ok(Self {
            id,
            socket,
            bufs: ConnBufs { arena, read, filled: 0, staging, start: 0, end: 0, direct_out: 0 },
            tls: tls.map(|session| TlsState {
                session,
                cipher_in: Vec::new(),
                plain_in: Vec::new(),
                cipher_out: Vec::new(),
                out_pos: 0,
                negotiated: None,
            }),
            proto: Proto::Undetermined,
            max_header_bytes: limits.max_header_bytes.min(read_len),
            bytes_in: 0,
            bytes_out: 0,
            last_active: ctx.now,
            eof: false,
            failed: false,
        })
    }

    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Run the read/parse/produce/write loop until nothing moves. Returns
    /// `false` once the connection should be closed.
    pub fn drive(&mut self, ctx: &mut WorkerCtx<'_>) -> bool {
        if let Err(e) = self.pump(ctx) {
            match e {
                Error::Io(kind) if matches!(kind, io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe) => {
                    trace!(conn = self.id, "peer reset")
                }
                e => debug!(conn = self.id, error = %e, "connection failed"),
            }
            self.failed = true;
        }
        !self.is_done()
    }

    fn pump(&mut self, ctx: &mut WorkerCtx<'_>) -> Result<(), Error> {
        loop {
            let mut progressed = false;
            if self.can_read(ctx.config.limits.write_buffer_limit) {
                progressed |= self.read_socket()?;
            }
            self.process_input(ctx);
            progressed |= self.produce(ctx)?;
            progressed |= self.flush()?;
            if self.failed || !progressed {
                return Ok(());
            }
            self.last_active = ctx.now;
        }
    }

    fn outstanding(&self) -> usize {
        let tls = self.tls.as_ref().map_or(0, TlsState::pending_out);
        let h2 = match &self.proto {
            Proto::Http2(s) => s.buffered(),
            _ => 0,
        };
        self.bufs.staged().len() + tls + h2
    }

    fn can_read(&self, write_limit: usize) -> bool {
        if self.eof || self.failed || self.outstanding() >= write_limit {
            return false;
        }
        match &self.proto {
            Proto::Undetermined => true,
            Proto::Http1(s) => s.wants_read(),
            Proto::Http2(s) => s.wants_read(write_limit),
        }
    }

    fn read_socket(&mut self) -> Result<bool, Error> {
        if self.tls.is_some() {
            return self.read_tls();
        }
        let mut progressed = false;
        loop {
            let room = self.bufs.read_room();
            if room.is_empty() {
                return Ok(progressed);
            }
            match self.socket.read(room) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(progressed);
                }
                Ok(n) => {
                    self.bufs.filled += n;
                    self.bytes_in += n as u64;
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progressed),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_tls(&mut self) -> Result<bool, Error> {
        let Some(tls) = self.tls.as_mut() else { return Ok(false) };
        let mut progressed = false;
        loop {
            if !tls.plain_in.is_empty() {
                let room = self.bufs.read_room();
                let n = room.len().min(tls.plain_in.len());
                room[..n].copy_from_slice(&tls.plain_in[..n]);
                tls.plain_in.drain(..n);
                self.bufs.filled += n;
                progressed |= n > 0;
                if !tls.plain_in.is_empty() {
                    return Ok(progressed);
                }
            }
            let at = tls.cipher_in.len();
            tls.cipher_in.resize(at + TLS_READ_CHUNK, 0);
            let read = self.socket.read(&mut tls.cipher_in[at..]);
            let n = match read {
                Ok(0) => {
                    tls.cipher_in.truncate(at);
                    self.eof = true;
                    return Ok(progressed);
                }
                Ok(n) => n,
                Err(e) => {
                    tls.cipher_in.truncate(at);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return Ok(progressed),
                        io::ErrorKind::Interrupted => continue,
                        _ => return Err(e.into()),
                    }
                }
            };
            tls.cipher_in.truncate(at + n);
            self.bytes_in += n as u64;
            progressed = true;
            let used = tls.session.decrypt(&tls.cipher_in, &mut tls.plain_in)?;
            tls.cipher_in.drain(..used);
            tls.session.handshake_output(&mut tls.cipher_out);
            if tls.negotiated.is_none() {
                tls.negotiated = tls.session.negotiate();
            }
        }
    }

    fn process_input(&mut self, ctx: &mut WorkerCtx<'_>) {
        if matches!(self.proto, Proto::Undetermined) && !self.select(ctx) {
            return;
        }
        match &mut self.proto {
            Proto::Undetermined => {}
            Proto::Http1(s) => s.on_input(&mut self.bufs, ctx),
            Proto::Http2(s) => {
                if self.bufs.filled > 0 {
                    s.on_input(&mut self.bufs, ctx);
                }
            }
        }
    }

    /// Pick the protocol handler. Returns whether one is in place.
    fn select(&mut self, ctx: &mut WorkerCtx<'_>) -> bool {
        let alpn = match &self.tls {
            Some(tls) => match &tls.negotiated {
                Some(negotiated) => negotiated.protocol.as_deref(),
                None => return false,
            },
            None => None,
        };
        let selection = match select_protocol(alpn, self.bufs.input()) {
            Ok(Selection::NeedMore) => return false,
            Ok(selection) => selection,
            Err(e) => {
                ctx.record(MetricsEvent::ProtocolError { conn: self.id, error: e });
                self.failed = true;
                return false;
            }
        };
        self.proto = match selection {
            Selection::Http2 => Proto::Http2(Box::new(H2Session::new(
                self.id,
                H2Config::from_limits(&ctx.config.limits),
                ctx.now,
            ))),
            _ => Proto::Http1(Http1Session::new(self.id, self.max_header_bytes, ctx.config.limits.pipeline_depth)),
        };
        if let Some(protocol) = selection.protocol() {
            ctx.record(MetricsEvent::ProtocolSelected { conn: self.id, protocol });
        }
        if ctx.draining {
            self.begin_drain();
        }
        true
    }

    fn produce(&mut self, ctx: &mut WorkerCtx<'_>) -> Result<bool, Error> {
        let direct = if self.tls.is_none() { Some(&self.socket) } else { None };
        let progressed = match &mut self.proto {
            Proto::Undetermined => false,
            Proto::Http1(s) => s.produce(&mut self.bufs, ctx, direct)?,
            Proto::Http2(s) => s.produce(&mut self.bufs, ctx)?,
        };
        if let Some(tls) = self.tls.as_mut() {
            let staged = self.bufs.staged();
            if !staged.is_empty() && tls.pending_out() < ctx.config.limits.write_buffer_limit {
                let n = staged.len();
                tls.session.encrypt(staged, &mut tls.cipher_out)?;
                self.bufs.consume_staged(n);
            }
        }
        Ok(progressed)
    }

    fn flush(&mut self) -> Result<bool, Error> {
        let mut progressed = false;
        loop {
            let pending: &[u8] = match &self.tls {
                Some(tls) => &tls.cipher_out[tls.out_pos..],
                None => self.bufs.staged(),
            };
            if pending.is_empty() {
                return Ok(progressed);
            }
            match self.socket.write(pending) {
                Ok(0) => return Err(Error::Io(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.bytes_out += n as u64;
                    progressed = true;
                    match self.tls.as_mut() {
                        Some(tls) => {
                            tls.out_pos += n;
                            if tls.out_pos == tls.cipher_out.len() {
                                tls.cipher_out.clear();
                                tls.out_pos = 0;
                            }
                        }
                        None => self.bufs.consume_staged(n),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progressed),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn flushed(&self) -> bool {
        self.outstanding() == 0
    }

    fn is_done(&self) -> bool {
        if self.failed {
            return true;
        }
        match &self.proto {
            Proto::Undetermined => self.eof,
            Proto::Http1(s) => (s.is_finished() || (self.eof && s.has_no_output())) && self.flushed(),
            Proto::Http2(s) => (s.is_finished() || (self.eof && s.is_idle() && !s.wants_output())) && self.flushed(),
        }
    }

    /// Stop taking new requests; finish the ones in flight.
    pub fn begin_drain(&mut self) {
        match &mut self.proto {
            Proto::Undetermined => self.failed = true,
            Proto::Http1(s) => s.begin_drain(),
            Proto::Http2(s) => s.begin_drain(),
        }
    }

    /// Idle/header deadline for this connection. `keep_alive_us` is the
    /// current keep-alive timeout between requests.
    fn idle_deadline(&self, limits: &Limits, keep_alive_us: u64) -> Option<Instant> {
        let header = limits.header_timeout_ms.saturating_mul(1_000);
        let idle = limits.idle_timeout_ms.saturating_mul(1_000);
        let after = match &self.proto {
            Proto::Undetermined => header,
            Proto::Http1(s) if s.is_idle() && self.bufs.filled == 0 => {
                if s.served() > 0 { keep_alive_us } else { header }
            }
            Proto::Http1(s) if s.is_reading_request() => header,
            Proto::Http1(_) => idle,
            Proto::Http2(_) => return None,
        };
        Some(self.last_active.saturating_add(after))
    }

    /// Earliest time the worker must call [`on_timer`](Self::on_timer).
    pub fn deadline(&self, limits: &Limits, keep_alive_us: u64) -> Option<Instant> {
        let session = match &self.proto {
            Proto::Http1(s) => s.next_deadline(),
            Proto::Http2(s) => s.next_deadline(),
            Proto::Undetermined => None,
        };
        match (self.idle_deadline(limits, keep_alive_us), session) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Timer expiry. Returns `false` once the connection should be closed.
    pub fn on_timer(&mut self, ctx: &mut WorkerCtx<'_>) -> bool {
        let keep_alive_us = ctx.keep_alive.idle_timeout_us();
        if let Some(deadline) = self.idle_deadline(&ctx.config.limits, keep_alive_us)
            && ctx.now >= deadline
        {
            debug!(conn = self.id, "connection idle timeout");
            self.failed = true;
            return false;
        }
        match &mut self.proto {
            Proto::Http1(s) => s.on_timer(ctx),
            Proto::Http2(s) => s.on_timer(&mut self.bufs, ctx),
            Proto::Undetermined => {}
        }
        self.drive(ctx)
    }

    /// Release arena pages and report the close.
    pub fn close(mut self, ctx: &mut WorkerCtx<'_>) {
        match &mut self.proto {
            Proto::Http1(s) => s.release(&mut self.bufs),
            Proto::Http2(s) => s.release(&mut self.bufs),
            Proto::Undetermined => {}
        }
        self.bufs.arena.release_all(ctx.pool);
        ctx.record(MetricsEvent::ConnectionClosed {
            conn: self.id,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out + self.bufs.direct_out,
        });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("proto", &self.proto)
            .field("tls", &self.tls.is_some())
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}
