//! HTTP/3 over one QUIC connection. The packet layer stays behind
//! [`QuicTransport`]; this side feeds its events into [`H3Connection`] and
//! turns the connection's transmit instructions back into transport calls.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::arena::{ConnArena, PageKind, SLOT_SIZE, Span};
use crate::error::{Error, H3Error};
use crate::h3::frame::DATA_HEADER_MAX;
use crate::h3::{H3Config, H3Connection, H3Event, Transmit};
use crate::http::{Protocol, StatusCode};
use crate::mux::select_for_quic;
use crate::pipeline::{BodySource, PreparedResponse};
use crate::service::{MetricsEvent, QuicEvent, QuicTransport, Transport};
use crate::timer::Instant;

use super::exchange::{self, Deferred, Dispatch, FieldBlock, WorkerCtx};

#[derive(Debug)]
struct Exchange {
    fields: FieldBlock,
    body: Option<Span>,
    rejected: bool,
    started: Instant,
}

#[derive(Debug)]
struct Sending {
    body: BodySource,
    status: StatusCode,
    started: Instant,
}

pub(super) struct H3Session {
    id: u64,
    transport: Box<dyn QuicTransport>,
    conn: H3Connection,
    arena: ConnArena,
    staging: Span,
    exchanges: HashMap<u64, Exchange>,
    sending: HashMap<u64, Sending>,
    deferred: Vec<((u64, Instant), Deferred)>,
    bytes_in: u64,
    bytes_out: u64,
    closed: bool,
}

impl H3Session {
    /// Accept a QUIC connection whose handshake agreed on `h3`.
    pub fn open(mut transport: Box<dyn QuicTransport>, ctx: &mut WorkerCtx<'_>) -> Result<Self, Error> {
        let id = transport.id();
        if let Err(e) = select_for_quic(transport.alpn().unwrap_or_default()) {
            ctx.record(MetricsEvent::ProtocolError { conn: id, error: e });
            transport.close(H3Error::VersionFallback.to_code());
            return Err(e);
        }
        let limits = &ctx.config.limits;
        let mut arena = ConnArena::new(limits.arena_budget);
        let staging = match arena.alloc(ctx.pool, PageKind::Body, (limits.arena_budget / 4).clamp(SLOT_SIZE, 4 * SLOT_SIZE)) {
            Ok(span) => span,
            Err(e) => {
                arena.release_all(ctx.pool);
                transport.close(H3Error::ExcessiveLoad.to_code());
                return Err(e);
            }
        };
        ctx.record(MetricsEvent::ConnectionOpened { conn: id, transport: Transport::Quic });
        ctx.record(MetricsEvent::ProtocolSelected { conn: id, protocol: Protocol::Http3 });
        let mut session = Self {
            id,
            transport,
            conn: H3Connection::new(H3Config::from_limits(limits)),
            arena,
            staging,
            exchanges: HashMap::new(),
            sending: HashMap::new(),
            deferred: Vec::new(),
            bytes_in: 0,
            bytes_out: 0,
            closed: false,
        };
        if ctx.draining {
            session.begin_drain();
        }
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Process transport events and flush. Returns `false` once the
    /// session is over.
    pub fn poll(&mut self, ctx: &mut WorkerCtx<'_>) -> bool {
        if let Err(e) = self.pump(ctx) {
            self.fail(e, ctx);
        }
        !self.is_done()
    }

    pub fn on_timer(&mut self, ctx: &mut WorkerCtx<'_>) -> bool {
        if let Err(e) = self.conn.handle_timeout(ctx.now) {
            self.fail(e, ctx);
            return false;
        }
        for ((id, started), d) in exchange::take_due(&mut self.deferred, ctx.now) {
            match exchange::retry(ctx, d, id) {
                Dispatch::Ready(resp) => self.respond(id, resp, started, ctx),
                Dispatch::Deferred(d) => self.deferred.push(((id, started), d)),
                Dispatch::Terminate => self.cancel(id, ctx),
            }
        }
        self.poll(ctx)
    }

    fn fail(&mut self, e: Error, ctx: &WorkerCtx<'_>) {
        if self.closed {
            return;
        }
        ctx.record(MetricsEvent::ProtocolError { conn: self.id, error: e });
        self.transport.close(e.h3_code());
        self.closed = true;
    }

    fn pump(&mut self, ctx: &mut WorkerCtx<'_>) -> Result<(), Error> {
        while let Some(event) = self.transport.poll_event() {
            match event {
                QuicEvent::KeysInstalled(phase) => self.conn.install_keys(phase)?,
                QuicEvent::Crypto { phase, data } => {
                    self.bytes_in += data.len() as u64;
                    self.conn.recv_crypto(phase, &data)?;
                }
                QuicEvent::Stream { stream_id, data, fin } => {
                    self.bytes_in += data.len() as u64;
                    self.conn.recv_stream(stream_id, &data, fin, ctx.now)?;
                }
                QuicEvent::Reset { stream_id, code } => self.conn.recv_reset(stream_id, code)?,
                QuicEvent::MaxData(limit) => self.conn.on_max_data(limit),
                QuicEvent::MaxStreamData { stream_id, limit } => self.conn.on_max_stream_data(stream_id, limit),
                QuicEvent::Closed => {
                    debug!(conn = self.id, "quic connection closed by transport");
                    self.closed = true;
                    return Ok(());
                }
            }
            self.drain_events(ctx);
        }
        while let Some((phase, data)) = self.conn.poll_crypto() {
            self.transport.send_crypto(phase, &data)?;
        }
        self.drain_events(ctx);
        self.transmit(ctx)
    }

    fn drain_events(&mut self, ctx: &mut WorkerCtx<'_>) {
        while let Some(event) = self.conn.poll_event() {
            match event {
                H3Event::Connected => trace!(conn = self.id, "h3 peer settings received"),
                H3Event::Headers(id) => self.on_headers(id, ctx),
                H3Event::Data(id) => self.on_data(id, ctx),
                H3Event::Finished(id) => {
                    self.on_data(id, ctx);
                    self.on_finished(id, ctx);
                }
                H3Event::Reset { stream_id, code } => {
                    if let Some(span) = self.exchanges.remove(&stream_id).and_then(|ex| ex.body) {
                        self.arena.release(span);
                    }
                    self.sending.remove(&stream_id);
                    self.deferred.retain(|((id, _), _)| *id != stream_id);
                    ctx.record(MetricsEvent::StreamReset { conn: self.id, stream: stream_id, code });
                }
                H3Event::GoAway(id) => debug!(conn = self.id, last_stream_id = id, "peer sent goaway"),
            }
        }
    }

    fn on_headers(&mut self, id: u64, ctx: &mut WorkerCtx<'_>) {
        let mut ex = Exchange { fields: FieldBlock::default(), body: None, rejected: false, started: ctx.now };
        if let Err(e) = self.conn.recv_headers(id, |name, value| ex.fields.push(name, value)) {
            debug!(conn = self.id, stream = id, error = %e, "h3 headers unavailable");
            return;
        }
        if !ex.fields.is_complete() {
            debug!(conn = self.id, stream = id, "request without :method or :path");
            self.reset(id, H3Error::MessageError);
            return;
        }
        self.exchanges.insert(id, ex);
    }

    fn on_data(&mut self, id: u64, ctx: &mut WorkerCtx<'_>) {
        let Some(ex) = self.exchanges.get_mut(&id) else { return };
        if ex.rejected {
            // Keep flow control moving; the bytes are discarded.
            let scratch = self.arena.bytes_mut(&self.staging);
            while let Ok((n, false)) = self.conn.recv_body(id, scratch) {
                if n == 0 {
                    break;
                }
            }
            return;
        }
        loop {
            let span = match ex.body.take() {
                Some(span) => Ok(span),
                None => self.arena.alloc(ctx.pool, PageKind::Body, 0),
            };
            let arena = &mut self.arena;
            let grown = span.and_then(|mut span| {
                let at = span.len();
                let target = if at < span.capacity() { span.capacity() } else { at + SLOT_SIZE };
                match arena.grow(&mut span, target) {
                    Ok(()) => Ok((span, at)),
                    Err(e) => {
                        ex.body = Some(span);
                        Err(e)
                    }
                }
            });
            let (mut span, at) = match grown {
                Ok(grown) => grown,
                Err(e) => {
                    self.reject(id, e, ctx);
                    return;
                }
            };
            let (n, done) = self.conn.recv_body(id, &mut self.arena.bytes_mut(&span)[at..]).unwrap_or((0, true));
            self.arena.truncate(&mut span, at + n);
            ex.body = Some(span);
            if n == 0 || done {
                return;
            }
        }
    }

    fn reject(&mut self, id: u64, e: Error, ctx: &mut WorkerCtx<'_>) {
        let Some(ex) = self.exchanges.get_mut(&id) else { return };
        warn!(conn = self.id, stream = id, error = %e, "request body exceeds arena budget");
        ex.rejected = true;
        if let Some(span) = ex.body.take() {
            self.arena.release(span);
        }
        let status = e.status().unwrap_or(StatusCode::PAYLOAD_TOO_LARGE);
        let started = ex.started;
        if self.conn.send_response(id, status, &[(&b"content-length"[..], &b"0"[..])], true).is_ok() {
            ctx.completed(self.id, id, status, started);
        }
    }

    fn on_finished(&mut self, id: u64, ctx: &mut WorkerCtx<'_>) {
        let Some(ex) = self.exchanges.remove(&id) else { return };
        if ex.rejected {
            return;
        }
        let decision = {
            let body = ex.body.as_ref().map_or(&[][..], |span| self.arena.bytes(span));
            exchange::dispatch(ctx, &ex.fields.request(Protocol::Http3, id, body))
        };
        if let Some(span) = ex.body {
            self.arena.release(span);
        }
        match decision {
            Dispatch::Ready(resp) => self.respond(id, resp, ex.started, ctx),
            Dispatch::Deferred(d) => self.deferred.push(((id, ex.started), d)),
            Dispatch::Terminate => self.cancel(id, ctx),
        }
    }

    fn respond(&mut self, id: u64, resp: PreparedResponse, started: Instant, ctx: &mut WorkerCtx<'_>) {
        let has_body = resp.has_body();
        let sent = self.conn.send_response(id, resp.status, &resp.header_pairs(), !has_body);
        if let Err(e) = sent {
            debug!(conn = self.id, stream = id, error = %e, "response for a closed stream");
            return;
        }
        if has_body {
            self.sending.insert(id, Sending { body: resp.body, status: resp.status, started });
        } else {
            ctx.completed(self.id, id, resp.status, started);
        }
    }

    fn reset(&mut self, id: u64, code: H3Error) {
        if let Err(e) = self.conn.reset_stream(id, code.to_code()) {
            debug!(conn = self.id, stream = id, ?code, error = %e, "stream reset not sent");
        }
    }

    fn cancel(&mut self, id: u64, ctx: &WorkerCtx<'_>) {
        let code = H3Error::RequestCancelled.to_code();
        if self.conn.reset_stream(id, code).is_ok() {
            ctx.record(MetricsEvent::StreamReset { conn: self.id, stream: id, code });
        }
    }

    /// Hand control output and HEADERS to the transport, then body bytes
    /// as the connection grants write opportunities.
    fn transmit(&mut self, ctx: &mut WorkerCtx<'_>) -> Result<(), Error> {
        loop {
            let buf = self.arena.bytes_mut(&self.staging);
            if let Some(transmit) = self.conn.poll_transmit(buf) {
                match transmit {
                    Transmit::Stream { stream_id, len, fin } => {
                        self.bytes_out += len as u64;
                        self.transport.send_stream(stream_id, &buf[..len], fin)?;
                    }
                    Transmit::Reset { stream_id, code } => self.transport.reset_stream(stream_id, code)?,
                    Transmit::MaxData(limit) => self.transport.send_max_data(limit)?,
                    Transmit::MaxStreamData { stream_id, limit } => {
                        self.transport.send_max_stream_data(stream_id, limit)?
                    }
                }
                continue;
            }
            let room = buf.len();
            if room <= DATA_HEADER_MAX {
                return Ok(());
            }
            let Some((id, grant)) = self.conn.next_data(room - DATA_HEADER_MAX) else { return Ok(()) };
            self.frame_body(id, grant, ctx)?;
        }
    }

    /// Read up to `grant` body bytes of stream `id` into the staging page
    /// behind room for the DATA header, frame them there and send.
    fn frame_body(&mut self, id: u64, grant: usize, ctx: &mut WorkerCtx<'_>) -> Result<(), Error> {
        let Some(sending) = self.sending.get_mut(&id) else {
            debug!(conn = self.id, stream = id, "data grant for a stream without a body");
            self.reset(id, H3Error::InternalError);
            return Ok(());
        };
        let page = self.arena.bytes_mut(&self.staging);
        let n = match sending.body.read(&mut page[DATA_HEADER_MAX..DATA_HEADER_MAX + grant]) {
            Ok(n) => n,
            Err(e) => {
                warn!(conn = self.id, stream = id, error = %e, "response body read failed");
                self.sending.remove(&id);
                self.reset(id, H3Error::InternalError);
                return Ok(());
            }
        };
        let fin = n == 0 || sending.body.remaining() == Some(0);
        let range = match self.conn.send_data(id, page, n, fin) {
            Ok(range) => range,
            Err(e) => {
                debug!(conn = self.id, stream = id, error = %e, "data frame refused");
                self.sending.remove(&id);
                self.reset(id, H3Error::InternalError);
                return Ok(());
            }
        };
        self.bytes_out += range.len() as u64;
        self.transport.send_stream(id, &page[range], fin)?;
        if fin && let Some(done) = self.sending.remove(&id) {
            ctx.completed(self.id, id, done.status, done.started);
        }
        Ok(())
    }

    /// GOAWAY: accepted requests finish, newer ones are refused.
    pub fn begin_drain(&mut self) {
        if let Err(e) = self.conn.send_goaway() {
            debug!(conn = self.id, error = %e, "goaway not sent");
        }
    }

    fn is_done(&self) -> bool {
        self.closed || self.conn.is_drained()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.conn.next_timeout(), exchange::next_retry(&self.deferred)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn close(mut self, ctx: &mut WorkerCtx<'_>) {
        if !self.closed {
            self.transport.close(H3Error::NoError.to_code());
        }
        for (_, ex) in self.exchanges.drain() {
            if let Some(span) = ex.body {
                self.arena.release(span);
            }
        }
        self.arena.release_all(ctx.pool);
        ctx.record(MetricsEvent::ConnectionClosed { conn: self.id, bytes_in: self.bytes_in, bytes_out: self.bytes_out });
    }
}

impl std::fmt::Debug for H3Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H3Session")
            .field("id", &self.id)
            .field("conn", &self.conn)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
