//! HTTP/2 on one TCP connection: drives the sans-IO [`H2Connection`] with
//! bytes from the read buffer. Response bodies are read straight into the
//! staging page and framed there.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::arena::{PageKind, SLOT_SIZE, Span};
use crate::error::{Error, H2Error};
use crate::h2::frame::FRAME_HEADER_LEN;
use crate::h2::{H2Config, H2Connection, H2Event};
use crate::http::{Protocol, StatusCode};
use crate::pipeline::{BodySource, PreparedResponse};
use crate::service::MetricsEvent;
use crate::timer::Instant;

use super::connection::ConnBufs;
use super::exchange::{self, Deferred, Dispatch, FieldBlock, WorkerCtx};

#[derive(Debug)]
struct Exchange {
    fields: FieldBlock,
    body: Option<Span>,
    /// Answered early (body over budget); nothing more is read.
    rejected: bool,
    started: Instant,
}

#[derive(Debug)]
struct Sending {
    body: BodySource,
    status: StatusCode,
    started: Instant,
}

#[derive(Debug)]
pub(super) struct H2Session {
    conn_id: u64,
    conn: H2Connection,
    exchanges: HashMap<u32, Exchange>,
    sending: HashMap<u32, Sending>,
    deferred: Vec<((u32, Instant), Deferred)>,
    reported: bool,
}

impl H2Session {
    pub fn new(conn_id: u64, config: H2Config, now: Instant) -> Self {
        Self {
            conn_id,
            conn: H2Connection::new(config, now),
            exchanges: HashMap::new(),
            sending: HashMap::new(),
            deferred: Vec::new(),
            reported: false,
        }
    }

    /// Feed everything in the read buffer to the connection.
    pub fn on_input(&mut self, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        let fed = self.conn.feed_data(bufs.input(), ctx.now);
        bufs.filled = 0;
        if let Err(e) = fed {
            self.report(e, ctx);
        }
        self.drain_events(bufs, ctx);
    }

    pub fn on_timer(&mut self, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        self.conn.handle_timeout(ctx.now);
        for ((id, started), d) in exchange::take_due(&mut self.deferred, ctx.now) {
            match exchange::retry(ctx, d, id as u64) {
                Dispatch::Ready(resp) => self.respond(id, resp, started, ctx),
                Dispatch::Deferred(d) => self.deferred.push(((id, started), d)),
                Dispatch::Terminate => self.cancel(id, ctx),
            }
        }
        self.drain_events(bufs, ctx);
    }

    fn report(&mut self, e: Error, ctx: &WorkerCtx<'_>) {
        if !self.reported {
            self.reported = true;
            ctx.record(MetricsEvent::ProtocolError { conn: self.conn_id, error: e });
        }
    }

    fn drain_events(&mut self, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        while let Some(event) = self.conn.poll_event() {
            match event {
                H2Event::Connected => trace!(conn = self.conn_id, "h2 settings exchanged"),
                H2Event::Headers(id) => self.on_headers(id, ctx),
                H2Event::Data(id) => self.on_data(id, bufs, ctx),
                H2Event::Finished(id) => {
                    self.on_data(id, bufs, ctx);
                    self.on_finished(id, bufs, ctx);
                }
                H2Event::Reset { stream_id, code } => {
                    if let Some(span) = self.exchanges.remove(&stream_id).and_then(|ex| ex.body) {
                        bufs.arena.release(span);
                    }
                    self.sending.remove(&stream_id);
                    self.deferred.retain(|((id, _), _)| *id != stream_id);
                    ctx.record(MetricsEvent::StreamReset {
                        conn: self.conn_id,
                        stream: stream_id as u64,
                        code: code as u64,
                    });
                }
                H2Event::GoAway { last_stream_id, code } => {
                    debug!(conn = self.conn_id, last_stream_id, code, "peer sent goaway")
                }
                H2Event::Timeout => debug!(conn = self.conn_id, "h2 connection timed out"),
            }
        }
        if let Some(e) = self.conn.error()
            && e != Error::TimedOut
        {
            self.report(e, ctx);
        }
    }

    fn on_headers(&mut self, id: u32, ctx: &mut WorkerCtx<'_>) {
        let mut ex = Exchange { fields: FieldBlock::default(), body: None, rejected: false, started: ctx.now };
        if let Err(e) = self.conn.recv_headers(id, |name, value| ex.fields.push(name, value)) {
            debug!(conn = self.conn_id, stream = id, error = %e, "h2 headers unavailable");
            return;
        }
        if !ex.fields.is_complete() {
            debug!(conn = self.conn_id, stream = id, "request without :method or :path");
            self.reset(id, H2Error::ProtocolError);
            return;
        }
        self.exchanges.insert(id, ex);
    }

    /// Move received body bytes into the stream's arena span.
    fn on_data(&mut self, id: u32, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        let Some(ex) = self.exchanges.get_mut(&id) else { return };
        if ex.rejected {
            return;
        }
        loop {
            let span = match ex.body.take() {
                Some(span) => Ok(span),
                None => bufs.arena.alloc(ctx.pool, PageKind::Body, 0),
            };
            let grown = span.and_then(|mut span| {
                let at = span.len();
                let target = if at < span.capacity() { span.capacity() } else { at + SLOT_SIZE };
                match bufs.arena.grow(&mut span, target) {
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
                    self.reject(id, e, bufs, ctx);
                    return;
                }
            };
            let received = self.conn.recv_body(id, &mut bufs.arena.bytes_mut(&span)[at..]);
            let (n, done) = match received {
                Ok(r) => r,
                Err(_) => (0, true),
            };
            bufs.arena.truncate(&mut span, at + n);
            ex.body = Some(span);
            if n == 0 || done {
                return;
            }
        }
    }

    fn reject(&mut self, id: u32, e: Error, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        let Some(ex) = self.exchanges.get_mut(&id) else { return };
        warn!(conn = self.conn_id, stream = id, error = %e, "request body exceeds arena budget");
        ex.rejected = true;
        if let Some(span) = ex.body.take() {
            bufs.arena.release(span);
        }
        let status = e.status().unwrap_or(StatusCode::PAYLOAD_TOO_LARGE);
        let started = ex.started;
        if self.conn.send_headers(id, status, &[(&b"content-length"[..], &b"0"[..])], true).is_ok() {
            ctx.completed(self.conn_id, id as u64, status, started);
        }
        self.reset(id, H2Error::NoError);
    }

    fn on_finished(&mut self, id: u32, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        let Some(ex) = self.exchanges.remove(&id) else { return };
        if ex.rejected {
            return;
        }
        let decision = {
            let body = ex.body.as_ref().map_or(&[][..], |span| bufs.arena.bytes(span));
            exchange::dispatch(ctx, &ex.fields.request(Protocol::Http2, id as u64, body))
        };
        if let Some(span) = ex.body {
            bufs.arena.release(span);
        }
        match decision {
            Dispatch::Ready(resp) => self.respond(id, resp, ex.started, ctx),
            Dispatch::Deferred(d) => self.deferred.push(((id, ex.started), d)),
            Dispatch::Terminate => self.cancel(id, ctx),
        }
    }

    fn respond(&mut self, id: u32, resp: PreparedResponse, started: Instant, ctx: &mut WorkerCtx<'_>) {
        let has_body = resp.has_body();
        let sent = self.conn.send_headers(id, resp.status, &resp.header_pairs(), !has_body);
        if let Err(e) = sent {
            debug!(conn = self.conn_id, stream = id, error = %e, "response for a closed stream");
            return;
        }
        if has_body {
            self.sending.insert(id, Sending { body: resp.body, status: resp.status, started });
        } else {
            ctx.completed(self.conn_id, id as u64, resp.status, started);
        }
    }

    fn reset(&mut self, id: u32, code: H2Error) {
        if let Err(e) = self.conn.send_rst_stream(id, code) {
            debug!(conn = self.conn_id, stream = id, ?code, error = %e, "stream reset not sent");
        }
    }

    fn cancel(&mut self, id: u32, ctx: &WorkerCtx<'_>) {
        if self.conn.send_rst_stream(id, H2Error::Cancel).is_ok() {
            ctx.record(MetricsEvent::StreamReset {
                conn: self.conn_id,
                stream: id as u64,
                code: H2Error::Cancel.to_code() as u64,
            });
        }
    }

    /// Move control frames and HEADERS into staging, then hand out DATA
    /// write opportunities until staging or the send windows run out.
    pub fn produce(&mut self, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) -> Result<bool, Error> {
        let mut progressed = false;
        loop {
            while let Some(out) = self.conn.poll_output(bufs.stage_room()) {
                let n = out.len();
                bufs.commit(n);
                progressed = true;
            }
            let room = bufs.stage_room().len();
            if room <= FRAME_HEADER_LEN {
                break;
            }
            let Some((id, grant)) = self.conn.next_data(room - FRAME_HEADER_LEN) else { break };
            self.frame_body(id, grant, bufs, ctx);
            progressed = true;
        }
        Ok(progressed)
    }

    /// Read up to `grant` body bytes of stream `id` into staging, leaving
    /// room for the DATA header, and frame them in place.
    fn frame_body(&mut self, id: u32, grant: usize, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        let Some(sending) = self.sending.get_mut(&id) else {
            debug!(conn = self.conn_id, stream = id, "data grant for a stream without a body");
            self.reset(id, H2Error::InternalError);
            return;
        };
        let room = bufs.stage_room();
        let read = sending.body.read(&mut room[FRAME_HEADER_LEN..FRAME_HEADER_LEN + grant]);
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                warn!(conn = self.conn_id, stream = id, error = %e, "response body read failed");
                self.sending.remove(&id);
                self.reset(id, H2Error::InternalError);
                return;
            }
        };
        let fin = n == 0 || sending.body.remaining() == Some(0);
        match self.conn.send_data(id, room, n, fin) {
            Ok(len) => bufs.commit(len),
            Err(e) => {
                debug!(conn = self.conn_id, stream = id, error = %e, "data frame refused");
                self.sending.remove(&id);
                self.reset(id, H2Error::InternalError);
                return;
            }
        }
        if fin && let Some(done) = self.sending.remove(&id) {
            ctx.completed(self.conn_id, id as u64, done.status, done.started);
        }
    }

    /// GOAWAY(NO_ERROR): open streams finish, new ones are refused.
    pub fn begin_drain(&mut self) {
        if let Err(e) = self.conn.send_goaway(H2Error::NoError) {
            debug!(conn = self.conn_id, error = %e, "goaway not sent");
        }
    }

    pub fn wants_read(&self, limit: usize) -> bool {
        !self.conn.is_closed() && self.conn.buffered() < limit
    }

    pub fn buffered(&self) -> usize {
        self.conn.buffered()
    }

    pub fn is_finished(&self) -> bool {
        self.conn.is_drained() || (self.conn.is_closed() && !self.conn.wants_write())
    }

    /// Nothing owed can still go out without more input from the peer: no
    /// retry is parked and every open body is blocked on flow control.
    /// Streams still receiving a request body do not count.
    pub fn is_idle(&self) -> bool {
        self.deferred.is_empty() && !self.conn.has_data_ready()
    }

    pub fn wants_output(&self) -> bool {
        self.conn.wants_write()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.conn.next_timeout(), exchange::next_retry(&self.deferred)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn release(&mut self, bufs: &mut ConnBufs) {
        for (_, ex) in self.exchanges.drain() {
            if let Some(span) = ex.body {
                bufs.arena.release(span);
            }
        }
    }
}
