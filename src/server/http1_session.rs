//! HTTP/1.1 on one TCP connection: pipelined requests in, responses out
//! strictly in request order.

use std::ops::Range;

use mio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::arena::{PageKind, Span};
use crate::error::Error;
use crate::http::header::HeaderList;
use crate::http::{Protocol, Request, StatusCode, Version};
use crate::http1::{BodyFraming, CONTINUE_RESPONSE, Http1Codec, Http1Item, RequestHead, ResponseQueue};
use crate::pipeline::{BodySource, ConnectionDirective, Http1Framer, PreparedResponse, send_file};
use crate::timer::Instant;

use super::connection::ConnBufs;
use super::exchange::{self, Deferred, Dispatch, WorkerCtx};

#[derive(Debug, Clone, Copy)]
struct Meta {
    version: Version,
    keep_alive: bool,
    started: Instant,
}

#[derive(Debug)]
enum Reply {
    Response(PreparedResponse, Meta),
    /// Policy block: close without answering.
    Drop,
}

#[derive(Debug)]
struct Pending {
    head: RequestHead,
    /// Offset of the head in the read buffer.
    head_start: usize,
    body: Option<Span>,
    /// Already answered with an error; the rest of the body is discarded.
    rejected: bool,
    meta: Meta,
}

#[derive(Debug)]
struct Outgoing {
    head: Vec<u8>,
    head_pos: usize,
    framer: Http1Framer,
    body: BodySource,
    seq: u64,
    status: StatusCode,
    started: Instant,
    close_after: bool,
}

#[derive(Debug)]
pub(super) struct Http1Session {
    conn: u64,
    codec: Http1Codec,
    queue: ResponseQueue<Reply>,
    pending: Option<Pending>,
    deferred: Vec<((u64, Meta), Deferred)>,
    out: Option<Outgoing>,
    served: u32,
    closing: bool,
}

impl Http1Session {
    pub fn new(conn: u64, max_header_bytes: usize, pipeline_depth: usize) -> Self {
        Self {
            conn,
            codec: Http1Codec::new(max_header_bytes, pipeline_depth),
            queue: ResponseQueue::default(),
            pending: None,
            deferred: Vec::new(),
            out: None,
            served: 0,
            closing: false,
        }
    }

    /// Parse whatever the read buffer holds, then drop consumed bytes.
    pub fn on_input(&mut self, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        loop {
            let head_start = self.codec.consumed();
            let item = match self.codec.next(bufs.input()) {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    self.reject_malformed(e, bufs, ctx);
                    break;
                }
            };
            match item {
                Http1Item::Head(head) => self.on_head(head, head_start, bufs, ctx),
                Http1Item::Body(range) => self.on_body(range, bufs, ctx),
                Http1Item::End(seq) => self.on_end(seq, bufs, ctx),
            }
        }
        self.reclaim(bufs);
    }

    fn on_head(&mut self, head: RequestHead, head_start: usize, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        trace!(conn = self.conn, seq = head.seq, method = head.head.method.as_str(), "http1 request head");
        if head.seq > 1 {
            ctx.keep_alive.on_reuse();
        }
        self.queue.push(head.seq);
        if head.head.expect_continue
            && !matches!(head.head.framing, BodyFraming::None)
            && self.queue.len() == 1
            && self.out.is_none()
            && bufs.staged().is_empty()
        {
            bufs.stage(CONTINUE_RESPONSE);
        }
        let meta = Meta { version: head.head.version, keep_alive: head.keep_alive(), started: ctx.now };
        self.pending = Some(Pending { head, head_start, body: None, rejected: false, meta });
    }

    fn on_body(&mut self, range: Range<usize>, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        let Some(p) = self.pending.as_mut() else { return };
        if p.rejected {
            return;
        }
        let ConnBufs { arena, read, .. } = bufs;
        let span = match p.body.take() {
            Some(span) => Ok(span),
            None => arena.alloc(ctx.pool, PageKind::Body, 0),
        };
        let appended = span.and_then(|mut span| {
            let res = arena.append(&mut span, read, range);
            p.body = Some(span);
            res
        });
        let Err(e) = appended else { return };
        warn!(conn = self.conn, seq = p.head.seq, error = %e, "request body exceeds arena budget");
        if let Some(span) = p.body.take() {
            bufs.arena.release(span);
        }
        p.rejected = true;
        let status = e.status().unwrap_or(StatusCode::PAYLOAD_TOO_LARGE);
        let resp = exchange::error_response(ctx.pipeline, Protocol::Http1, p.meta.version, status);
        let meta = Meta { keep_alive: false, ..p.meta };
        let seq = p.head.seq;
        self.complete(seq, Reply::Response(resp, meta));
        self.codec.close_after_current();
    }

    fn on_end(&mut self, seq: u64, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        let Some(p) = self.pending.take() else { return };
        if p.rejected {
            return;
        }
        let Pending { head, body, meta, .. } = p;
        let decision = {
            let buf = bufs.arena.bytes(&bufs.read);
            let headers = HeaderList::new(buf, &head.head.headers);
            let req = Request {
                protocol: Protocol::Http1,
                stream_id: seq,
                method: head.head.method,
                path: head.head.path.get(buf),
                authority: headers.get(b"host"),
                version: head.head.version,
                headers,
                body: body.as_ref().map_or(&[][..], |span| bufs.arena.bytes(span)),
            };
            exchange::dispatch(ctx, &req)
        };
        if let Some(span) = body {
            bufs.arena.release(span);
        }
        match decision {
            Dispatch::Ready(resp) => self.complete(seq, Reply::Response(resp, meta)),
            Dispatch::Deferred(d) => self.deferred.push(((seq, meta), d)),
            Dispatch::Terminate => {
                self.complete(seq, Reply::Drop);
                self.codec.close_after_current();
            }
        }
    }

    fn reject_malformed(&mut self, e: Error, bufs: &mut ConnBufs, ctx: &mut WorkerCtx<'_>) {
        let (Some(status), Error::Stream { stream_id: seq, .. }) = (e.status(), e) else {
            debug!(conn = self.conn, error = %e, "http1 input rejected");
            self.closing = true;
            return;
        };
        debug!(conn = self.conn, seq, error = %e, "malformed http1 request");
        let version = match self.pending.take() {
            Some(p) if p.head.seq == seq => {
                if let Some(span) = p.body {
                    bufs.arena.release(span);
                }
                if p.rejected {
                    return;
                }
                p.meta.version
            }
            Some(p) => {
                if let Some(span) = p.body {
                    bufs.arena.release(span);
                }
                self.queue.push(seq);
                Version::Http11
            }
            None => {
                self.queue.push(seq);
                Version::Http11
            }
        };
        let resp = exchange::error_response(ctx.pipeline, Protocol::Http1, version, status);
        self.complete(seq, Reply::Response(resp, Meta { version, keep_alive: false, started: ctx.now }));
    }

    fn complete(&mut self, seq: u64, reply: Reply) {
        if let Err(e) = self.queue.complete(seq, reply) {
            warn!(conn = self.conn, seq, error = %e, "response for unknown request");
        }
    }

    /// Drop consumed input. A head whose body is still arriving is kept at
    /// the front of the buffer, ahead of the unparsed bytes.
    fn reclaim(&mut self, bufs: &mut ConnBufs) {
        let consumed = self.codec.consumed();
        let filled = bufs.filled;
        let Some(p) = self.pending.as_mut() else {
            if consumed > 0 {
                bufs.arena.bytes_mut(&bufs.read).copy_within(consumed..filled, 0);
                bufs.filled = filled - consumed;
                self.codec.compact(consumed);
            }
            return;
        };
        let head_len = p.head.head.len;
        let shift = p.head_start;
        if consumed == shift + head_len && shift == 0 {
            return;
        }
        let buf = bufs.arena.bytes_mut(&bufs.read);
        buf.copy_within(shift..shift + head_len, 0);
        buf.copy_within(consumed..filled, head_len);
        bufs.filled = filled - (consumed - head_len);
        self.codec.compact(consumed - head_len);
        let head = &mut p.head.head;
        head.path = head.path.shifted(shift);
        for h in head.headers.iter_mut() {
            h.name = h.name.shifted(shift);
            h.value = h.value.shifted(shift);
        }
        p.head_start = 0;
    }

    /// Retry parked proxy requests whose backoff expired.
    pub fn on_timer(&mut self, ctx: &mut WorkerCtx<'_>) {
        for ((seq, meta), d) in exchange::take_due(&mut self.deferred, ctx.now) {
            match exchange::retry(ctx, d, seq) {
                Dispatch::Ready(resp) => self.complete(seq, Reply::Response(resp, meta)),
                Dispatch::Deferred(d) => self.deferred.push(((seq, meta), d)),
                Dispatch::Terminate => self.complete(seq, Reply::Drop),
            }
        }
    }

    /// Move response bytes into staging, or straight to the socket with
    /// `sendfile` when `direct` is given. Returns whether anything moved.
    pub fn produce(
        &mut self,
        bufs: &mut ConnBufs,
        ctx: &mut WorkerCtx<'_>,
        direct: Option<&TcpStream>,
    ) -> Result<bool, Error> {
        let mut progressed = false;
        loop {
            if self.out.is_none() {
                match self.queue.pop_ready() {
                    None => return Ok(progressed),
                    Some((seq, Reply::Drop)) => {
                        debug!(conn = self.conn, seq, "closing on policy");
                        self.closing = true;
                        return Ok(progressed);
                    }
                    Some((seq, Reply::Response(resp, meta))) => self.start(seq, resp, meta, ctx),
                }
            }
            let Some(out) = self.out.as_mut() else { return Ok(progressed) };

            if out.head_pos < out.head.len() {
                let n = bufs.stage(&out.head[out.head_pos..]);
                if n == 0 {
                    return Ok(progressed);
                }
                out.head_pos += n;
                progressed = true;
                continue;
            }

            if !out.framer.is_done() {
                if let Some(socket) = direct
                    && out.framer.remaining().is_some()
                    && let BodySource::File(region) = &mut out.body
                {
                    if !bufs.staged().is_empty() {
                        return Ok(progressed);
                    }
                    match send_file(socket, region) {
                        Ok(n) => {
                            out.framer.advance(n as u64);
                            bufs.note_direct(n);
                            progressed = true;
                            continue;
                        }
                        Err(Error::WouldBlock) => return Ok(progressed),
                        Err(e) => return Err(e),
                    }
                }
                let n = out.framer.fill(&mut out.body, bufs.stage_room())?;
                if n == 0 && !out.framer.is_done() {
                    return Ok(progressed);
                }
                bufs.commit(n);
                progressed = true;
                continue;
            }

            self.finish(ctx);
            progressed = true;
        }
    }

    fn start(&mut self, seq: u64, resp: PreparedResponse, meta: Meta, ctx: &mut WorkerCtx<'_>) {
        let (timeout_s, max) = ctx.keep_alive.current();
        let served = self.served + 1;
        let keep = meta.keep_alive && !ctx.draining && served < max;
        let directive =
            if keep { ConnectionDirective::KeepAlive { timeout_s, max: max - served } } else { ConnectionDirective::Close };
        let mut head = Vec::with_capacity(256);
        let framer = Http1Framer::encode_head(&mut head, meta.version, &resp, directive);
        let close_after = !keep || framer.requires_close();
        if close_after {
            self.codec.close_after_current();
        }
        self.out = Some(Outgoing {
            head,
            head_pos: 0,
            framer,
            body: resp.body,
            seq,
            status: resp.status,
            started: meta.started,
            close_after,
        });
    }

    fn finish(&mut self, ctx: &mut WorkerCtx<'_>) {
        let Some(out) = self.out.take() else { return };
        self.codec.response_done();
        self.served += 1;
        ctx.completed(self.conn, out.seq, out.status, out.started);
        if out.close_after {
            self.closing = true;
        }
    }

    /// Stop taking requests; finish the ones already read.
    pub fn begin_drain(&mut self) {
        self.codec.close_after_current();
        if self.is_idle() {
            self.closing = true;
        }
    }

    pub fn wants_read(&self) -> bool {
        !self.closing && !self.codec.is_closed()
    }

    /// Nothing is left to answer; the connection may close once flushed.
    pub fn is_finished(&self) -> bool {
        if self.closing {
            return self.out.is_none();
        }
        self.codec.is_closed() && self.is_quiet()
    }

    /// Between requests, with nothing partially read.
    pub fn is_idle(&self) -> bool {
        self.codec.is_idle() && self.is_quiet()
    }

    /// Waiting on the client for the rest of a request.
    pub fn is_reading_request(&self) -> bool {
        !self.codec.is_idle() || self.pending.is_some()
    }

    /// Nothing to write and nothing waiting on a response.
    pub fn has_no_output(&self) -> bool {
        self.queue.is_empty() && self.out.is_none()
    }

    fn is_quiet(&self) -> bool {
        self.queue.is_empty() && self.out.is_none() && self.pending.is_none() && self.deferred.is_empty()
    }

    pub fn served(&self) -> u32 {
        self.served
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        exchange::next_retry(&self.deferred)
    }

    /// Return arena spans still held.
    pub fn release(&mut self, bufs: &mut ConnBufs) {
        if let Some(span) = self.pending.take().and_then(|p| p.body) {
            bufs.arena.release(span);
        }
    }
}
