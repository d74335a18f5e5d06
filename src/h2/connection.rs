//! Server side of an HTTP/2 connection (RFC 9113).
//!
//! Pure codec: `feed_data()` → `poll_event()` → application calls →
//! `poll_output()`. Nothing here touches a socket.
//!
//! HEADERS frames go straight onto the connection output in the order they
//! were HPACK-encoded, so the peer's decoder sees table updates in sequence.
//! DATA is never buffered here: `next_data` grants a stream a write
//! opportunity (weighted-deficit order, bounded by the connection and
//! stream send windows) and the caller frames the payload in its own
//! buffer with `send_data`.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace, warn};

use crate::config::Limits;
use crate::error::{Error, H2Error, StreamFault};
use crate::hpack::{HpackDecoder, HpackEncoder};
use crate::http::StatusCode;
use crate::timer::Instant;

use super::flow_control::{DEFAULT_INITIAL_WINDOW_SIZE, FlowController, MAX_WINDOW_SIZE, RecvWindow};
use super::frame::*;
use super::priority::{DEFAULT_WEIGHT, PriorityScheduler};
use super::stream::{H2Stream, H2StreamState};

/// HTTP/2 connection preface (RFC 9113 §3.4).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Events produced by the HTTP/2 connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H2Event {
    /// Peer SETTINGS received and acknowledged.
    Connected,
    /// Request headers decoded; read them with `recv_headers`.
    Headers(u32),
    /// Request body bytes available.
    Data(u32),
    /// END_STREAM received.
    Finished(u32),
    /// Stream reset, by us (`code` is what we sent) or by the peer.
    Reset { stream_id: u32, code: u32 },
    /// Peer sent GOAWAY.
    GoAway { last_stream_id: u32, code: u32 },
    /// Idle or preface timeout fired; GOAWAY was queued.
    Timeout,
}

#[derive(Debug, Clone)]
pub struct H2Config {
    pub max_concurrent_streams: u32,
    /// Our SETTINGS_INITIAL_WINDOW_SIZE; also the connection receive window.
    pub initial_window_size: u32,
    pub header_table_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    pub idle_timeout_us: u64,
    /// Deadline for the preface and first SETTINGS.
    pub header_timeout_us: u64,
}

impl Default for H2Config {
    fn default() -> Self {
        Self::from_limits(&Limits::default())
    }
}

impl H2Config {
    pub fn from_limits(limits: &Limits) -> Self {
        Self {
            max_concurrent_streams: limits.max_streams,
            initial_window_size: limits.initial_window_size.min(MAX_WINDOW_SIZE),
            header_table_size: limits.header_table_size,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: limits.max_header_bytes as u32,
            idle_timeout_us: limits.idle_timeout_ms.saturating_mul(1_000),
            header_timeout_us: limits.header_timeout_ms.saturating_mul(1_000),
        }
    }
}

/// SETTINGS values (RFC 9113 §6.5.2). `Default` is the protocol's initial state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for H2Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl H2Settings {
    /// What a server advertises for `config`.
    pub fn server(config: &H2Config) -> Self {
        Self {
            header_table_size: config.header_table_size,
            enable_push: false,
            max_concurrent_streams: config.max_concurrent_streams,
            initial_window_size: config.initial_window_size,
            max_frame_size: config.max_frame_size,
            max_header_list_size: config.max_header_list_size,
        }
    }

    /// SETTINGS payload carrying every parameter.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        put_setting(out, SETTINGS_HEADER_TABLE_SIZE, self.header_table_size)?;
        put_setting(out, SETTINGS_ENABLE_PUSH, self.enable_push as u32)?;
        put_setting(out, SETTINGS_MAX_CONCURRENT_STREAMS, self.max_concurrent_streams)?;
        put_setting(out, SETTINGS_INITIAL_WINDOW_SIZE, self.initial_window_size)?;
        put_setting(out, SETTINGS_MAX_FRAME_SIZE, self.max_frame_size)?;
        put_setting(out, SETTINGS_MAX_HEADER_LIST_SIZE, self.max_header_list_size)
    }

    /// Apply one parameter with §6.5.2 validation. Unknown ids are ignored.
    pub fn apply(&mut self, id: u16, value: u32) -> Result<(), Error> {
        match id {
            SETTINGS_HEADER_TABLE_SIZE => self.header_table_size = value,
            SETTINGS_ENABLE_PUSH => {
                if value > 1 {
                    return Err(Error::Http2(H2Error::ProtocolError));
                }
                self.enable_push = value == 1;
            }
            SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = value,
            SETTINGS_INITIAL_WINDOW_SIZE => {
                if value > MAX_WINDOW_SIZE {
                    return Err(Error::Http2(H2Error::FlowControlError));
                }
                self.initial_window_size = value;
            }
            SETTINGS_MAX_FRAME_SIZE => {
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&value) {
                    return Err(Error::Http2(H2Error::ProtocolError));
                }
                self.max_frame_size = value;
            }
            SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size = value,
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Waiting for the client preface.
    Preface,
    /// Preface seen; the next frame must be SETTINGS.
    Settings,
    Open,
    /// GOAWAY with an error, or a timeout. Output drains, input is refused.
    Closed,
}

/// Header block collected across HEADERS + CONTINUATION.
#[derive(Debug)]
struct PartialBlock {
    stream_id: u32,
    end_stream: bool,
    priority: Option<H2Priority>,
    block: Vec<u8>,
}

pub struct H2Connection {
    config: H2Config,
    state: ConnState,
    peer_settings: H2Settings,
    settings_acked: bool,

    streams: HashMap<u32, H2Stream>,
    scheduler: PriorityScheduler,
    /// Highest client stream id seen.
    last_peer_stream_id: u32,
    partial: Option<PartialBlock>,

    encoder: HpackEncoder,
    decoder: HpackDecoder,

    recv_buf: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,

    conn_send: FlowController,
    conn_recv: RecvWindow,

    events: VecDeque<H2Event>,
    goaway_sent: Option<u32>,
    goaway_received: bool,
    failed: Option<Error>,

    created_at: Instant,
    last_activity: Instant,
}

impl std::fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connection")
            .field("state", &self.state)
            .field("streams", &self.streams.len())
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}

impl H2Connection {
    /// A server connection. Our SETTINGS (and a connection WINDOW_UPDATE
    /// when the configured window exceeds the protocol default) are queued
    /// immediately, as the server preface requires.
    pub fn new(config: H2Config, now: Instant) -> Self {
        let mut conn = Self {
            state: ConnState::Preface,
            peer_settings: H2Settings::default(),
            settings_acked: false,
            streams: HashMap::new(),
            scheduler: PriorityScheduler::new(config.max_frame_size),
            last_peer_stream_id: 0,
            partial: None,
            encoder: HpackEncoder::default(),
            decoder: HpackDecoder::new(config.header_table_size as usize),
            recv_buf: Vec::new(),
            out: Vec::new(),
            out_pos: 0,
            conn_send: FlowController::new(DEFAULT_INITIAL_WINDOW_SIZE),
            conn_recv: RecvWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            events: VecDeque::new(),
            goaway_sent: None,
            goaway_received: false,
            failed: None,
            created_at: now,
            last_activity: now,
            config,
        };
        conn.queue_preface();
        conn
    }

    fn queue_preface(&mut self) {
        let mut params = Vec::with_capacity(36);
        let local = H2Settings::server(&self.config);
        // Writing into a Vec cannot fail.
        let _ = local.encode(&mut params);
        let _ = put_frame(&H2Frame::Settings { ack: false, params: &params }, &mut self.out);
        let target = self.config.initial_window_size;
        if target > DEFAULT_INITIAL_WINDOW_SIZE {
            self.conn_recv.retarget(target);
            let increment = target - DEFAULT_INITIAL_WINDOW_SIZE;
            let _ = put_frame(&H2Frame::WindowUpdate { stream_id: 0, increment }, &mut self.out);
        }
    }

    pub fn peer_settings(&self) -> &H2Settings {
        &self.peer_settings
    }

    /// Whether the peer acknowledged our SETTINGS.
    pub fn settings_acked(&self) -> bool {
        self.settings_acked
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnState::Open
    }

    /// The connection error that closed this connection, if any.
    pub fn error(&self) -> Option<Error> {
        self.failed
    }

    /// No more input will be processed.
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed || (self.goaway_received && self.streams.is_empty())
    }

    /// GOAWAY went out and every accepted stream has completed.
    pub fn is_drained(&self) -> bool {
        (self.goaway_sent.is_some() || self.state == ConnState::Closed)
            && self.streams.is_empty()
            && !self.wants_write()
    }

    /// Whether `poll_output` has something to return.
    pub fn wants_write(&self) -> bool {
        self.out_pos < self.out.len() || (self.state != ConnState::Closed && self.scheduler.has_ready())
    }

    /// Some stream has a response body and send window to write it.
    pub fn has_data_ready(&self) -> bool {
        self.state != ConnState::Closed && self.scheduler.has_ready()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Framed output not yet taken by `poll_output`.
    pub fn buffered(&self) -> usize {
        self.out.len() - self.out_pos
    }

    pub fn stream_weight(&self, stream_id: u32) -> Option<u16> {
        self.scheduler.weight(stream_id as u64)
    }

    pub fn stream_parent(&self, stream_id: u32) -> Option<u32> {
        self.scheduler.parent(stream_id as u64).map(|p| p as u32)
    }

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------

    /// Feed received bytes. An `Err` is a connection error: GOAWAY has
    /// been queued and the caller should flush output, then close.
    pub fn feed_data(&mut self, data: &[u8], now: Instant) -> Result<(), Error> {
        if self.state == ConnState::Closed {
            return Err(Error::Closed);
        }
        self.last_activity = now;
        self.recv_buf.extend_from_slice(data);
        self.process().map_err(|e| self.fail(e))
    }

    fn process(&mut self) -> Result<(), Error> {
        if self.state == ConnState::Preface {
            let n = self.recv_buf.len().min(CONNECTION_PREFACE.len());
            if self.recv_buf[..n] != CONNECTION_PREFACE[..n] {
                return Err(Error::MalformedPreface);
            }
            if n < CONNECTION_PREFACE.len() {
                return Ok(());
            }
            self.recv_buf.drain(..n);
            self.state = ConnState::Settings;
        }

        let buf = std::mem::take(&mut self.recv_buf);
        let mut pos = 0;
        let result = loop {
            if self.state == ConnState::Closed {
                break Ok(());
            }
            let (frame, used) = match decode_frame(&buf[pos..], self.config.max_frame_size) {
                Ok(decoded) => decoded,
                Err(Error::BufferTooSmall { .. }) => break Ok(()),
                Err(e) => break Err(e),
            };
            pos += used;
            match self.on_frame(frame) {
                Ok(()) => {}
                Err(Error::Stream { stream_id, fault }) => {
                    let code = Error::stream(stream_id, fault).h2_code();
                    self.reset_with(stream_id as u32, code);
                }
                Err(e) => break Err(e),
            }
        };
        let mut buf = buf;
        buf.drain(..pos);
        self.recv_buf = buf;
        result
    }

    fn on_frame(&mut self, frame: H2Frame<'_>) -> Result<(), Error> {
        if let Some(partial) = &self.partial {
            let continues = matches!(frame, H2Frame::Continuation { stream_id, .. } if stream_id == partial.stream_id);
            if !continues {
                return Err(Error::Http2(H2Error::ProtocolError));
            }
        }
        if self.state == ConnState::Settings && !matches!(frame, H2Frame::Settings { ack: false, .. }) {
            return Err(Error::Http2(H2Error::ProtocolError));
        }
        match frame {
            H2Frame::Data { stream_id, payload, end_stream, flow_len } => {
                self.on_data(stream_id, payload, end_stream, flow_len)
            }
            H2Frame::Headers { stream_id, fragment, end_stream, end_headers, priority } => {
                if stream_id % 2 == 0 {
                    return Err(Error::Http2(H2Error::ProtocolError));
                }
                let block = PartialBlock { stream_id, end_stream, priority, block: fragment.to_vec() };
                self.collect_block(block, end_headers)
            }
            H2Frame::Continuation { fragment, end_headers, .. } => {
                let mut block = self.partial.take().ok_or(Error::Http2(H2Error::ProtocolError))?;
                block.block.extend_from_slice(fragment);
                self.collect_block(block, end_headers)
            }
            H2Frame::Priority { stream_id, priority } => self.on_priority(stream_id, priority),
            H2Frame::RstStream { stream_id, error_code } => self.on_rst_stream(stream_id, error_code),
            H2Frame::Settings { ack, params } => self.on_settings(ack, params),
            H2Frame::PushPromise { .. } => Err(Error::Http2(H2Error::ProtocolError)),
            H2Frame::Ping { data, ack } => {
                if !ack {
                    put_frame(&H2Frame::Ping { data, ack: true }, &mut self.out)?;
                }
                Ok(())
            }
            H2Frame::GoAway { last_stream_id, error_code, .. } => {
                debug!(last_stream_id, code = error_code, "h2 goaway received");
                self.goaway_received = true;
                self.events.push_back(H2Event::GoAway { last_stream_id, code: error_code });
                Ok(())
            }
            H2Frame::WindowUpdate { stream_id, increment } => self.on_window_update(stream_id, increment),
            H2Frame::Unknown { .. } => Ok(()),
        }
    }

    fn collect_block(&mut self, block: PartialBlock, end_headers: bool) -> Result<(), Error> {
        // Compressed blocks larger than this cannot decode within the list limit.
        let limit = (self.config.max_header_list_size as usize).saturating_mul(4).saturating_add(1024);
        if block.block.len() > limit {
            return Err(Error::Http2(H2Error::EnhanceYourCalm));
        }
        if end_headers {
            self.finish_block(block)
        } else {
            self.partial = Some(block);
            Ok(())
        }
    }

    fn finish_block(&mut self, block: PartialBlock) -> Result<(), Error> {
        let id = block.stream_id;

        if self.streams.contains_key(&id) {
            // Trailers. Decoded only to keep the table in step.
            self.decoder.decode(&block.block, |_, _| {})?;
            let stream = self.streams.get_mut(&id).ok_or(Error::InvalidState)?;
            stream.recv_headers(block.end_stream)?;
            self.events.push_back(H2Event::Finished(id));
            self.remove_if_closed(id);
            return Ok(());
        }
        if id <= self.last_peer_stream_id {
            return Err(Error::Http2(H2Error::StreamClosed));
        }
        self.last_peer_stream_id = id;

        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let list_size = self.decoder.decode(&block.block, |n, v| fields.push((n.to_vec(), v.to_vec())))?;

        if self.goaway_sent.is_some_and(|last| id > last) {
            trace!(stream_id = id, "h2 stream ignored after goaway");
            return Ok(());
        }
        if self.streams.len() >= self.config.max_concurrent_streams as usize {
            return Err(Error::stream(id as u64, StreamFault::Refused));
        }
        if block.priority.is_some_and(|p| p.dependency == id) {
            return Err(Error::stream(id as u64, StreamFault::Malformed));
        }
        if list_size > self.config.max_header_list_size as usize {
            return Err(Error::stream(id as u64, StreamFault::HeaderTooLarge));
        }
        validate_request(&fields).map_err(|fault| Error::stream(id as u64, fault))?;

        let mut stream = H2Stream::new(id, self.peer_settings.initial_window_size, self.config.initial_window_size);
        stream.recv_headers(block.end_stream)?;
        stream.headers = fields;
        stream.headers_ready = true;
        self.streams.insert(id, stream);
        match block.priority {
            Some(p) => self.scheduler.update(id as u64, p.dependency as u64, p.effective_weight(), p.exclusive),
            None if self.scheduler.contains(id as u64) => {}
            None => self.scheduler.insert(id as u64, 0, DEFAULT_WEIGHT, false),
        }
        trace!(stream_id = id, "h2 stream opened");
        self.events.push_back(H2Event::Headers(id));
        if block.end_stream {
            self.events.push_back(H2Event::Finished(id));
        }
        Ok(())
    }

    fn on_data(&mut self, id: u32, payload: &[u8], end_stream: bool, flow_len: u32) -> Result<(), Error> {
        self.conn_recv.on_data(flow_len)?;
        let padding = flow_len - payload.len() as u32;

        let Some(stream) = self.streams.get_mut(&id) else {
            if id > self.last_peer_stream_id {
                return Err(Error::Http2(H2Error::ProtocolError));
            }
            self.release_conn(flow_len);
            return Err(Error::stream(id as u64, StreamFault::IllegalState));
        };
        stream.recv_window.on_data(flow_len)?;
        if let Err(e) = stream.recv_data(end_stream) {
            self.release_conn(flow_len);
            return Err(e);
        }
        stream.body.extend_from_slice(payload);
        let stream_update = if padding > 0 { stream.recv_window.release(padding) } else { None };
        if let Some(increment) = stream_update {
            put_frame(&H2Frame::WindowUpdate { stream_id: id, increment }, &mut self.out)?;
        }
        if padding > 0 {
            self.release_conn(padding);
        }
        if !payload.is_empty() {
            self.events.push_back(H2Event::Data(id));
        }
        if end_stream {
            self.events.push_back(H2Event::Finished(id));
            self.remove_if_closed(id);
        }
        Ok(())
    }

    fn on_priority(&mut self, id: u32, priority: H2Priority) -> Result<(), Error> {
        if priority.dependency == id {
            return Err(Error::stream(id as u64, StreamFault::Malformed));
        }
        let known = self.scheduler.contains(id as u64);
        // Idle streams may be prioritised ahead of time, within reason.
        if !known && self.scheduler.len() >= 2 * self.config.max_concurrent_streams as usize {
            return Ok(());
        }
        self.scheduler.update(id as u64, priority.dependency as u64, priority.effective_weight(), priority.exclusive);
        Ok(())
    }

    fn on_rst_stream(&mut self, id: u32, code: u32) -> Result<(), Error> {
        let Some(mut stream) = self.remove_stream(id) else {
            if id > self.last_peer_stream_id {
                return Err(Error::Http2(H2Error::ProtocolError));
            }
            return Ok(());
        };
        let _ = stream.reset();
        debug!(stream_id = id, code, "h2 stream reset by peer");
        self.events.push_back(H2Event::Reset { stream_id: id, code });
        Ok(())
    }

    fn on_settings(&mut self, ack: bool, params: &[u8]) -> Result<(), Error> {
        if ack {
            self.settings_acked = true;
            return Ok(());
        }
        let mut peer = self.peer_settings.clone();
        decode_settings_params(params, |id, value| peer.apply(id, value))?;

        let delta = peer.initial_window_size as i64 - self.peer_settings.initial_window_size as i64;
        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.send_window.apply_initial_delta(delta)?;
            }
        }
        self.encoder.set_max_table_size(peer.header_table_size as usize);
        self.peer_settings = peer;
        put_frame(&H2Frame::Settings { ack: true, params: &[] }, &mut self.out)?;

        if self.state == ConnState::Settings {
            self.state = ConnState::Open;
            debug!("h2 connection established");
            self.events.push_back(H2Event::Connected);
        }
        if delta > 0 {
            self.rearm_all();
        }
        Ok(())
    }

    fn on_window_update(&mut self, id: u32, increment: u32) -> Result<(), Error> {
        if id == 0 {
            self.conn_send.replenish(increment)?;
            self.rearm_all();
            return Ok(());
        }
        match self.streams.get_mut(&id) {
            Some(stream) => {
                stream.send_window.replenish(increment)?;
                if stream.has_output() {
                    self.scheduler.set_ready(id as u64, true);
                }
                Ok(())
            }
            None if id > self.last_peer_stream_id => Err(Error::Http2(H2Error::ProtocolError)),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Application side
    // ------------------------------------------------------------------

    pub fn poll_event(&mut self) -> Option<H2Event> {
        self.events.pop_front()
    }

    /// Emit the decoded request headers of `stream_id`, pseudo-headers first.
    pub fn recv_headers<F: FnMut(&[u8], &[u8])>(&self, stream_id: u32, mut emit: F) -> Result<(), Error> {
        let stream = self.streams.get(&stream_id).ok_or(Error::InvalidState)?;
        if !stream.headers_ready {
            return Err(Error::WouldBlock);
        }
        for (name, value) in &stream.headers {
            emit(name, value);
        }
        Ok(())
    }

    /// Copy request body bytes into `buf`. Returns `(len, fin)`. Consumed
    /// bytes are re-granted to the peer with WINDOW_UPDATE.
    pub fn recv_body(&mut self, stream_id: u32, buf: &mut [u8]) -> Result<(usize, bool), Error> {
        let stream = self.streams.get_mut(&stream_id).ok_or(Error::InvalidState)?;
        let finished = !stream.can_recv();
        if stream.body.is_empty() {
            return if finished { Ok((0, true)) } else { Err(Error::WouldBlock) };
        }
        let n = stream.body.len().min(buf.len());
        buf[..n].copy_from_slice(&stream.body[..n]);
        stream.body.drain(..n);
        let done = finished && stream.body.is_empty();
        if !finished && let Some(increment) = stream.recv_window.release(n as u32) {
            put_frame(&H2Frame::WindowUpdate { stream_id, increment }, &mut self.out)?;
        }
        self.release_conn(n as u32);
        Ok((n, done))
    }

    /// Queue the response HEADERS (with CONTINUATION when the block exceeds
    /// the peer's frame size).
    pub fn send_headers(
        &mut self,
        stream_id: u32,
        status: StatusCode,
        headers: &[(&[u8], &[u8])],
        end_stream: bool,
    ) -> Result<(), Error> {
        self.check_open()?;
        let stream = self.streams.get_mut(&stream_id).ok_or(Error::InvalidState)?;
        if stream.response_started || !stream.can_send() {
            return Err(Error::stream(stream_id as u64, StreamFault::IllegalState));
        }
        let status = status.to_bytes();
        let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(headers.len() + 1);
        fields.push((&b":status"[..], &status[..]));
        fields.extend_from_slice(headers);

        let mut block = Vec::new();
        self.encoder.encode(&fields, &mut block)?;
        stream.response_started = true;
        if end_stream {
            stream.send_end_stream()?;
        } else {
            stream.body_open = true;
        }

        let max = self.peer_settings.max_frame_size as usize;
        let mut chunks = block.chunks(max.max(1)).peekable();
        let first = chunks.next().unwrap_or(&[]);
        put_frame(
            &H2Frame::Headers {
                stream_id,
                fragment: first,
                end_stream,
                end_headers: chunks.peek().is_none(),
                priority: None,
            },
            &mut self.out,
        )?;
        while let Some(fragment) = chunks.next() {
            let end_headers = chunks.peek().is_none();
            put_frame(&H2Frame::Continuation { stream_id, fragment, end_headers }, &mut self.out)?;
        }
        trace!(stream_id, bytes = block.len(), "h2 response headers queued");
        if end_stream {
            self.remove_if_closed(stream_id);
        } else {
            self.scheduler.set_ready(stream_id as u64, true);
        }
        Ok(())
    }

    /// Pick the stream that may write body bytes next, in scheduler order.
    /// Returns the stream and how many payload bytes it may put in one DATA
    /// frame (at most `max`). Queued control output must be taken with
    /// `poll_output` first so HEADERS precede their DATA.
    pub fn next_data(&mut self, max: usize) -> Option<(u32, usize)> {
        if self.state == ConnState::Closed || self.out_pos < self.out.len() {
            return None;
        }
        while let Some(id) = self.scheduler.next() {
            let sid = id as u32;
            let Some(stream) = self.streams.get(&sid) else {
                self.scheduler.remove(id);
                continue;
            };
            if !stream.has_output() {
                self.scheduler.set_ready(id, false);
                continue;
            }
            let grant = max
                .min(self.peer_settings.max_frame_size as usize)
                .min(stream.send_window.available())
                .min(self.conn_send.available());
            if grant == 0 {
                // Withheld until WINDOW_UPDATE re-arms it.
                self.scheduler.set_ready(id, false);
                continue;
            }
            return Some((sid, grant));
        }
        None
    }

    /// Frame `len` payload bytes already sitting at `frame[FRAME_HEADER_LEN..]`
    /// by writing the DATA header in front of them. Returns the frame length.
    /// An empty frame carrying END_STREAM needs no window.
    pub fn send_data(&mut self, stream_id: u32, frame: &mut [u8], len: usize, end_stream: bool) -> Result<usize, Error> {
        self.check_open()?;
        let total = FRAME_HEADER_LEN + len;
        if frame.len() < total {
            return Err(Error::BufferTooSmall { needed: total });
        }
        if len > self.peer_settings.max_frame_size as usize || len > self.conn_send.available() {
            return Err(Error::WouldBlock);
        }
        let stream = self.streams.get_mut(&stream_id).ok_or(Error::InvalidState)?;
        if !stream.body_open || !stream.can_send() {
            return Err(Error::InvalidState);
        }
        stream.send_window.consume(len).map_err(|_| Error::WouldBlock)?;
        self.conn_send.consume(len)?;
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        write_frame_header(&mut frame[..FRAME_HEADER_LEN], FRAME_DATA, flags, stream_id, len)?;
        self.scheduler.charge(stream_id as u64, len.max(1));
        if end_stream {
            stream.body_open = false;
            stream.send_end_stream()?;
            trace!(stream_id, "h2 response complete");
            self.scheduler.set_ready(stream_id as u64, false);
            self.remove_if_closed(stream_id);
        }
        Ok(total)
    }

    /// Abort a stream with RST_STREAM.
    pub fn send_rst_stream(&mut self, stream_id: u32, code: H2Error) -> Result<(), Error> {
        if !self.streams.contains_key(&stream_id) {
            return Err(Error::InvalidState);
        }
        self.reset_with(stream_id, code);
        Ok(())
    }

    /// Announce shutdown. With `NoError` accepted streams run to completion
    /// and newer ones are ignored; any other code closes the connection.
    pub fn send_goaway(&mut self, code: H2Error) -> Result<(), Error> {
        if self.state == ConnState::Closed {
            return Err(Error::Closed);
        }
        let last_stream_id = self.last_peer_stream_id;
        put_frame(&H2Frame::GoAway { last_stream_id, error_code: code.to_code(), debug: &[] }, &mut self.out)?;
        self.goaway_sent = Some(last_stream_id);
        debug!(last_stream_id, ?code, "h2 goaway queued");
        if code != H2Error::NoError {
            self.state = ConnState::Closed;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Copy queued control frames and HEADERS into `buf`.
    pub fn poll_output<'a>(&mut self, buf: &'a mut [u8]) -> Option<&'a [u8]> {
        let avail = self.out.len() - self.out_pos;
        if avail == 0 || buf.is_empty() {
            return None;
        }
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        if self.out_pos == self.out.len() {
            self.out.clear();
            self.out_pos = 0;
        }
        Some(&buf[..n])
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    /// Earliest deadline `handle_timeout` cares about.
    pub fn next_timeout(&self) -> Option<Instant> {
        if self.state == ConnState::Closed {
            return None;
        }
        let idle = (self.streams.is_empty() && self.config.idle_timeout_us > 0)
            .then(|| self.last_activity.saturating_add(self.config.idle_timeout_us));
        let handshake = (self.state != ConnState::Open && self.config.header_timeout_us > 0)
            .then(|| self.created_at.saturating_add(self.config.header_timeout_us));
        match (idle, handshake) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Close the connection if the preface deadline or the idle timeout
    /// (no open streams) has passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        let Some(deadline) = self.next_timeout() else { return };
        if now < deadline {
            return;
        }
        debug!(established = self.state == ConnState::Open, "h2 connection timed out");
        let _ = self.send_goaway(H2Error::NoError);
        self.state = ConnState::Closed;
        self.failed.get_or_insert(Error::TimedOut);
        self.events.push_back(H2Event::Timeout);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_open(&self) -> Result<(), Error> {
        match self.state {
            ConnState::Closed => Err(Error::Closed),
            _ => Ok(()),
        }
    }

    /// Record a connection error and queue GOAWAY carrying its code.
    fn fail(&mut self, e: Error) -> Error {
        if self.failed.is_none() && self.state != ConnState::Closed {
            let code = e.h2_code();
            warn!(error = %e, ?code, "h2 connection error");
            let frame = H2Frame::GoAway { last_stream_id: self.last_peer_stream_id, error_code: code.to_code(), debug: &[] };
            let _ = put_frame(&frame, &mut self.out);
            self.goaway_sent = Some(self.last_peer_stream_id);
            self.failed = Some(e);
        }
        self.state = ConnState::Closed;
        e
    }

    fn reset_with(&mut self, stream_id: u32, code: H2Error) {
        if let Some(mut stream) = self.remove_stream(stream_id) {
            let _ = stream.reset();
        }
        debug!(stream_id, ?code, "h2 stream reset");
        let _ = put_frame(&H2Frame::RstStream { stream_id, error_code: code.to_code() }, &mut self.out);
        self.events.push_back(H2Event::Reset { stream_id, code: code.to_code() });
    }

    fn release_conn(&mut self, n: u32) {
        if let Some(increment) = self.conn_recv.release(n) {
            let _ = put_frame(&H2Frame::WindowUpdate { stream_id: 0, increment }, &mut self.out);
        }
    }

    fn rearm_all(&mut self) {
        for (&id, stream) in &self.streams {
            if stream.has_output() {
                self.scheduler.set_ready(id as u64, true);
            }
        }
    }

    fn remove_if_closed(&mut self, stream_id: u32) {
        let closed = self
            .streams
            .get(&stream_id)
            .is_some_and(|s| s.state == H2StreamState::Closed && !s.has_output());
        if closed {
            self.remove_stream(stream_id);
        }
    }

    /// Forget a stream; unread body bytes go back to the connection window.
    fn remove_stream(&mut self, stream_id: u32) -> Option<H2Stream> {
        let stream = self.streams.remove(&stream_id)?;
        self.scheduler.remove(stream_id as u64);
        if !stream.body.is_empty() {
            self.release_conn(stream.body.len() as u32);
        }
        Some(stream)
    }
}

/// RFC 9113 §8.3.1 checks that make a request malformed.
fn validate_request(fields: &[(Vec<u8>, Vec<u8>)]) -> Result<(), StreamFault> {
    let mut method = None;
    let mut path = false;
    let mut regular_seen = false;
    for (name, value) in fields {
        if name.iter().any(u8::is_ascii_uppercase) {
            return Err(StreamFault::Malformed);
        }
        if name.first() == Some(&b':') {
            if regular_seen {
                return Err(StreamFault::Malformed);
            }
            match name.as_slice() {
                b":method" => method = Some(value.as_slice()),
                b":path" => path = !value.is_empty(),
                b":scheme" | b":authority" | b":protocol" => {}
                _ => return Err(StreamFault::Malformed),
            }
        } else {
            regular_seen = true;
            if name.as_slice() == b"connection" {
                return Err(StreamFault::Malformed);
            }
        }
    }
    match method {
        Some(b"CONNECT") => Ok(()),
        Some(_) if path => Ok(()),
        _ => Err(StreamFault::Malformed),
    }
}
