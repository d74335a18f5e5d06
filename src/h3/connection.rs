//! Server side of an HTTP/3 connection.
//!
//! [`H3Connection`] is sans-IO. The QUIC transport hands it reassembled
//! stream bytes ([`recv_stream`](H3Connection::recv_stream)), CRYPTO data
//! and peer limit updates; the connection answers with [`H3Event`]s for the
//! application and [`Transmit`] instructions for the transport.
//!
//! Ordering rules enforced here:
//! - request streams are refused until 1-RTT keys are installed;
//! - the peer's control stream must open with SETTINGS;
//! - QPACK encoder-stream instructions are applied in arrival order, and a
//!   header section waiting on them blocks only its own stream;
//! - nothing the peer sends may exceed MAX_DATA / MAX_STREAM_DATA, and
//!   nothing we send exceeds the peer's limits.
//!
//! Response bodies are not buffered: [`next_data`](H3Connection::next_data)
//! grants a stream a write opportunity and the caller frames the payload in
//! its own page with [`send_data`](H3Connection::send_data).

use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use tracing::{debug, trace, warn};

use crate::buf::BufExt;
use crate::config::Limits;
use crate::error::{Error, H3Error, StreamFault, TransportError};
use crate::h2::priority::PriorityScheduler;
use crate::http::StatusCode;
use crate::http::header::PRIORITY;
use crate::timer::Instant;
use crate::varint::{decode_varint, varint_len};

use super::flow_control::StreamFlow;
use super::frame::{DATA_HEADER_MAX, H3_FRAME_DATA, H3Frame, decode_h3_frame, put_h3_frame, write_data_header};
use super::qpack::{FieldSection, QpackDecoder, QpackEncoder};
use super::{
    DEFAULT_URGENCY, H3_STREAM_TYPE_CONTROL, H3_STREAM_TYPE_PUSH, H3_STREAM_TYPE_QPACK_DECODER,
    H3_STREAM_TYPE_QPACK_ENCODER, H3Settings, KeyPhase, is_client_initiated, is_unidirectional,
    parse_urgency, urgency_weight,
};

/// Server-initiated unidirectional stream ids: control, QPACK encoder, QPACK decoder.
const LOCAL_UNI_IDS: [u64; 3] = [3, 7, 11];
const CONTROL: usize = 0;
const ENCODER: usize = 1;
const DECODER: usize = 2;

#[derive(Debug, Clone)]
pub struct H3Config {
    /// Concurrent request streams; more are reset with H3_REQUEST_REJECTED.
    pub max_streams: usize,
    pub qpack_max_table_capacity: usize,
    pub qpack_blocked_streams: usize,
    /// How long a header section may wait on encoder-stream inserts.
    pub blocked_lifetime_us: u64,
    pub max_field_section_size: u64,
    /// Connection receive window we advertise (MAX_DATA).
    pub max_data: u64,
    /// Per-stream receive window we advertise (MAX_STREAM_DATA).
    pub max_stream_data: u64,
    /// Peer's initial_max_data transport parameter.
    pub peer_max_data: u64,
    /// Peer's initial_max_stream_data for streams we send on.
    pub peer_max_stream_data: u64,
}

impl Default for H3Config {
    fn default() -> Self {
        Self::from_limits(&Limits::default())
    }
}

impl H3Config {
    pub fn from_limits(limits: &Limits) -> Self {
        Self {
            max_streams: limits.max_streams as usize,
            qpack_max_table_capacity: limits.qpack_table_capacity as usize,
            qpack_blocked_streams: limits.qpack_blocked_streams as usize,
            blocked_lifetime_us: limits.qpack_blocked_lifetime_ms.saturating_mul(1_000),
            max_field_section_size: limits.max_header_bytes as u64,
            max_data: limits.max_data,
            max_stream_data: limits.max_stream_data,
            peer_max_data: limits.max_data,
            peer_max_stream_data: limits.max_stream_data,
        }
    }
}

/// Events for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H3Event {
    /// The peer's SETTINGS arrived.
    Connected,
    /// Request headers decoded; read them with `recv_headers`.
    Headers(u64),
    /// Request body bytes available.
    Data(u64),
    /// Request fully received.
    Finished(u64),
    /// Stream reset, by us (`code` is what we sent) or by the peer.
    Reset { stream_id: u64, code: u64 },
    /// Peer is going away.
    GoAway(u64),
}

/// Instruction for the QUIC transport produced by [`H3Connection::poll_transmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    /// STREAM frame carrying the first `len` bytes of the caller's buffer.
    Stream { stream_id: u64, len: usize, fin: bool },
    /// RESET_STREAM with an HTTP/3 application error code.
    Reset { stream_id: u64, code: u64 },
    MaxData(u64),
    MaxStreamData { stream_id: u64, limit: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    /// Waiting for the request HEADERS frame.
    Headers,
    /// Header section parked on the QPACK decoder.
    Blocked { trailers: bool },
    Body,
    /// Trailers decoded; only FIN may follow.
    Done,
}

#[derive(Debug)]
struct RequestStream {
    state: RecvState,
    /// Bytes not yet parsed into frames.
    recv_buf: Vec<u8>,
    /// Field section waiting for encoder-stream inserts.
    blocked_block: Vec<u8>,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    body: Vec<u8>,
    fin_received: bool,
    finished_reported: bool,
    flow: StreamFlow,
    /// Response HEADERS not yet handed to the transport.
    out: Vec<u8>,
    response_started: bool,
    /// FIN goes out with the last byte of `out`.
    fin_queued: bool,
    /// HEADERS were sent without FIN; body bytes are still owed.
    body_open: bool,
}

impl RequestStream {
    fn new(flow: StreamFlow) -> Self {
        Self {
            state: RecvState::Headers,
            recv_buf: Vec::new(),
            blocked_block: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
            fin_received: false,
            finished_reported: false,
            flow,
            out: Vec::new(),
            response_started: false,
            fin_queued: false,
            body_open: false,
        }
    }

    /// Ready for a DATA write opportunity.
    fn wants_data(&self) -> bool {
        self.body_open && self.out.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UniKind {
    Control,
    Encoder,
    Decoder,
    /// Unknown type; bytes are discarded (RFC 9114 §6.2).
    Ignored,
}

#[derive(Debug)]
struct PeerUni {
    kind: Option<UniKind>,
    buf: Vec<u8>,
    flow: StreamFlow,
}

#[derive(Debug)]
struct LocalUni {
    id: u64,
    out: Vec<u8>,
    flow: StreamFlow,
}

pub struct H3Connection {
    config: H3Config,
    phase: KeyPhase,
    crypto_in: VecDeque<(KeyPhase, Vec<u8>)>,
    conn_flow: StreamFlow,

    requests: HashMap<u64, RequestStream>,
    /// Streams with response HEADERS waiting in `out`.
    headers_pending: VecDeque<u64>,
    /// Lowest client bidirectional stream id not seen yet.
    next_request_id: u64,
    scheduler: PriorityScheduler,

    peer_uni: HashMap<u64, PeerUni>,
    peer_control: Option<u64>,
    peer_encoder: Option<u64>,
    peer_decoder: Option<u64>,
    peer_settings: Option<H3Settings>,
    /// Empty until 1-RTT keys are installed.
    local: Vec<LocalUni>,

    encoder: QpackEncoder,
    decoder: QpackDecoder,

    events: VecDeque<H3Event>,
    resets: VecDeque<(u64, u64)>,
    /// Streams that may need a MAX_STREAM_DATA.
    stream_updates: VecDeque<u64>,
    goaway_sent: Option<u64>,
    failed: Option<Error>,
}

impl std::fmt::Debug for H3Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H3Connection")
            .field("phase", &self.phase)
            .field("requests", &self.requests.len())
            .finish_non_exhaustive()
    }
}

impl H3Connection {
    /// A server connection with Initial keys installed.
    pub fn new(config: H3Config) -> Self {
        Self {
            conn_flow: StreamFlow::new(config.max_data, config.peer_max_data),
            encoder: QpackEncoder::new(config.qpack_max_table_capacity),
            decoder: QpackDecoder::new(config.qpack_max_table_capacity, config.qpack_blocked_streams),
            config,
            phase: KeyPhase::Initial,
            crypto_in: VecDeque::new(),
            requests: HashMap::new(),
            headers_pending: VecDeque::new(),
            next_request_id: 0,
            scheduler: PriorityScheduler::default(),
            peer_uni: HashMap::new(),
            peer_control: None,
            peer_encoder: None,
            peer_decoder: None,
            peer_settings: None,
            local: Vec::new(),
            events: VecDeque::new(),
            resets: VecDeque::new(),
            stream_updates: VecDeque::new(),
            goaway_sent: None,
            failed: None,
        }
    }

    pub fn phase(&self) -> KeyPhase {
        self.phase
    }

    pub fn peer_settings(&self) -> Option<&H3Settings> {
        self.peer_settings.as_ref()
    }

    /// The connection error that closed this connection, if any.
    pub fn error(&self) -> Option<Error> {
        self.failed
    }

    pub fn stream_count(&self) -> usize {
        self.requests.len()
    }

    /// Whether the stream's header section is waiting on QPACK inserts.
    pub fn is_blocked(&self, stream_id: u64) -> bool {
        self.requests
            .get(&stream_id)
            .is_some_and(|s| matches!(s.state, RecvState::Blocked { .. }))
    }

    pub fn stream_weight(&self, stream_id: u64) -> Option<u16> {
        self.scheduler.weight(stream_id)
    }

    /// GOAWAY went out and every accepted request has completed.
    pub fn is_drained(&self) -> bool {
        self.goaway_sent.is_some() && self.requests.is_empty()
    }

    // ------------------------------------------------------------------
    // Transport input
    // ------------------------------------------------------------------

    /// The crypto collaborator derived keys for `phase`. Phases only move
    /// forward; reaching 1-RTT opens our control and QPACK streams.
    pub fn install_keys(&mut self, phase: KeyPhase) -> Result<(), Error> {
        self.check_open()?;
        if phase < self.phase {
            return Err(Error::InvalidState);
        }
        if phase == self.phase {
            return Ok(());
        }
        debug!(?phase, "h3 keys installed");
        self.phase = phase;
        if phase == KeyPhase::OneRtt {
            self.open_local_streams()?;
        }
        Ok(())
    }

    /// CRYPTO frame data at `phase`, queued for the TLS collaborator.
    pub fn recv_crypto(&mut self, phase: KeyPhase, data: &[u8]) -> Result<(), Error> {
        self.check_open()?;
        if phase > self.phase {
            return Err(self.fail(Error::Transport(TransportError::ProtocolViolation)));
        }
        self.crypto_in.push_back((phase, data.to_vec()));
        Ok(())
    }

    /// Next CRYPTO payload for the TLS collaborator.
    pub fn poll_crypto(&mut self) -> Option<(KeyPhase, Vec<u8>)> {
        self.crypto_in.pop_front()
    }

    /// Ordered bytes for `stream_id`. An `Err` is a connection error: the
    /// transport closes with [`Error::h3_code`].
    pub fn recv_stream(&mut self, stream_id: u64, data: &[u8], fin: bool, now: Instant) -> Result<(), Error> {
        self.check_open()?;
        if self.phase < KeyPhase::OneRtt {
            return Err(self.fail(Error::Transport(TransportError::ProtocolViolation)));
        }
        let result = self.recv_stream_inner(stream_id, data, fin, now);
        self.flush_qpack();
        result.map_err(|e| self.fail(e))
    }

    /// Peer reset a request stream.
    pub fn recv_reset(&mut self, stream_id: u64, code: u64) -> Result<(), Error> {
        self.check_open()?;
        if Some(stream_id) == self.peer_control
            || Some(stream_id) == self.peer_encoder
            || Some(stream_id) == self.peer_decoder
        {
            return Err(self.fail(Error::Http3(H3Error::ClosedCriticalStream)));
        }
        if let Some(stream) = self.remove_request(stream_id) {
            if matches!(stream.state, RecvState::Blocked { .. }) {
                self.decoder.cancel_stream(stream_id).map_err(|e| self.fail(e))?;
                self.flush_qpack();
            }
            debug!(stream_id, code, "h3 stream reset by peer");
            self.events.push_back(H3Event::Reset { stream_id, code });
        }
        Ok(())
    }

    /// Peer raised MAX_DATA.
    pub fn on_max_data(&mut self, limit: u64) {
        if self.conn_flow.on_max(limit) {
            for (&id, stream) in &self.requests {
                if stream.wants_data() {
                    self.scheduler.set_ready(id, true);
                }
            }
        }
    }

    /// Peer raised MAX_STREAM_DATA for one of the streams we send on.
    pub fn on_max_stream_data(&mut self, stream_id: u64, limit: u64) {
        if let Some(stream) = self.requests.get_mut(&stream_id) {
            if stream.flow.on_max(limit) && stream.wants_data() {
                self.scheduler.set_ready(stream_id, true);
            }
        } else if let Some(uni) = self.local.iter_mut().find(|u| u.id == stream_id) {
            uni.flow.on_max(limit);
        }
    }

    // ------------------------------------------------------------------
    // Application side
    // ------------------------------------------------------------------

    pub fn poll_event(&mut self) -> Option<H3Event> {
        self.events.pop_front()
    }

    /// Emit the decoded request headers of `stream_id`.
    pub fn recv_headers<F: FnMut(&[u8], &[u8])>(&self, stream_id: u64, mut emit: F) -> Result<(), Error> {
        let stream = self.requests.get(&stream_id).ok_or(Error::InvalidState)?;
        match stream.state {
            RecvState::Headers | RecvState::Blocked { trailers: false } => Err(Error::WouldBlock),
            _ => {
                for (name, value) in &stream.headers {
                    emit(name, value);
                }
                Ok(())
            }
        }
    }

    /// Copy request body bytes into `buf`. Returns `(len, fin)`.
    pub fn recv_body(&mut self, stream_id: u64, buf: &mut [u8]) -> Result<(usize, bool), Error> {
        let stream = self.requests.get_mut(&stream_id).ok_or(Error::InvalidState)?;
        let finished = stream.fin_received && stream.recv_buf.is_empty() && stream.state != RecvState::Headers;
        if stream.body.is_empty() {
            return if finished { Ok((0, true)) } else { Err(Error::WouldBlock) };
        }
        let n = stream.body.len().min(buf.len());
        buf[..n].copy_from_slice(&stream.body[..n]);
        stream.body.drain(..n);
        stream.flow.on_consumed(n as u64);
        self.conn_flow.on_consumed(n as u64);
        if stream.flow.should_update().is_some() {
            self.stream_updates.push_back(stream_id);
        }
        Ok((n, finished && stream.body.is_empty()))
    }

    /// Queue the response HEADERS for `stream_id`.
    pub fn send_response(
        &mut self,
        stream_id: u64,
        status: StatusCode,
        headers: &[(&[u8], &[u8])],
        fin: bool,
    ) -> Result<(), Error> {
        self.check_open()?;
        let stream = self.requests.get_mut(&stream_id).ok_or(Error::InvalidState)?;
        if stream.response_started {
            return Err(Error::InvalidState);
        }
        let status = status.to_bytes();
        let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(headers.len() + 1);
        fields.push((&b":status"[..], &status[..]));
        fields.extend_from_slice(headers);

        let mut block = Vec::new();
        self.encoder.encode_field_section(stream_id, &fields, &mut block)?;
        put_h3_frame(&H3Frame::Headers(&block), &mut stream.out)?;
        stream.response_started = true;
        stream.fin_queued = fin;
        stream.body_open = !fin;
        self.headers_pending.push_back(stream_id);
        self.flush_qpack();
        trace!(stream_id, bytes = block.len(), "h3 response headers queued");
        Ok(())
    }

    /// Pick the stream that may write body bytes next, in scheduler order.
    /// Returns the stream and how many payload bytes (at most `max`) one
    /// DATA frame may carry within the stream and connection limits.
    pub fn next_data(&mut self, max: usize) -> Option<(u64, usize)> {
        if self.failed.is_some() {
            return None;
        }
        while let Some(stream_id) = self.scheduler.next() {
            let Some(stream) = self.requests.get(&stream_id) else {
                self.scheduler.remove(stream_id);
                continue;
            };
            if !stream.wants_data() {
                self.scheduler.set_ready(stream_id, false);
                continue;
            }
            let cap = capacity(&stream.flow).min(capacity(&self.conn_flow));
            // Leave room for the frame header; the payload varint is never
            // longer than the varint of `cap`.
            let grant = max.min(cap.saturating_sub(varint_len(H3_FRAME_DATA) + varint_len(cap as u64)));
            if grant == 0 {
                // Blocked on flow control; MAX_DATA / MAX_STREAM_DATA re-arms it.
                self.scheduler.set_ready(stream_id, false);
                continue;
            }
            return Some((stream_id, grant));
        }
        None
    }

    /// Frame `len` payload bytes already sitting at `buf[DATA_HEADER_MAX..]`
    /// by writing the DATA header in front of them. Returns the range of
    /// `buf` to hand to the transport; with `len == 0` only FIN goes out.
    pub fn send_data(&mut self, stream_id: u64, buf: &mut [u8], len: usize, fin: bool) -> Result<Range<usize>, Error> {
        self.check_open()?;
        if buf.len() < DATA_HEADER_MAX + len {
            return Err(Error::BufferTooSmall { needed: DATA_HEADER_MAX + len });
        }
        let stream = self.requests.get_mut(&stream_id).ok_or(Error::InvalidState)?;
        if !stream.wants_data() || (len == 0 && !fin) {
            return Err(Error::InvalidState);
        }
        let start = if len == 0 { DATA_HEADER_MAX } else { write_data_header(buf, len as u64)? };
        let wire = (DATA_HEADER_MAX + len - start) as u64;
        if wire > stream.flow.send_capacity() || wire > self.conn_flow.send_capacity() {
            return Err(Error::WouldBlock);
        }
        stream.flow.on_send(wire)?;
        self.conn_flow.on_send(wire)?;
        self.scheduler.charge(stream_id, len.max(1));
        if fin {
            trace!(stream_id, "h3 response complete");
            self.remove_request(stream_id);
        }
        Ok(start..DATA_HEADER_MAX + len)
    }

    /// Stop accepting new requests. Streams already accepted run to completion.
    pub fn send_goaway(&mut self) -> Result<(), Error> {
        self.check_open()?;
        let id = match self.goaway_sent {
            Some(prev) => prev.min(self.next_request_id),
            None => self.next_request_id,
        };
        let control = self.local.get_mut(CONTROL).ok_or(Error::InvalidState)?;
        put_h3_frame(&H3Frame::GoAway(id), &mut control.out)?;
        self.goaway_sent = Some(id);
        debug!(last_stream_id = id, "h3 goaway queued");
        Ok(())
    }

    /// Reset a request stream with an HTTP/3 error code.
    pub fn reset_stream(&mut self, stream_id: u64, code: u64) -> Result<(), Error> {
        let Some(stream) = self.remove_request(stream_id) else {
            return Err(Error::InvalidState);
        };
        if matches!(stream.state, RecvState::Blocked { .. }) {
            self.decoder.cancel_stream(stream_id)?;
            self.flush_qpack();
        }
        self.queue_reset(stream_id, code);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Next thing for the transport to send. Stream payload is written to
    /// the front of `buf`.
    ///
    /// Order: stream resets, flow-control updates, our control and QPACK
    /// streams, then response HEADERS. Body bytes go through `next_data`.
    pub fn poll_transmit(&mut self, buf: &mut [u8]) -> Option<Transmit> {
        if let Some((stream_id, code)) = self.resets.pop_front() {
            return Some(Transmit::Reset { stream_id, code });
        }
        if let Some(limit) = self.conn_flow.should_update() {
            self.conn_flow.update_sent(limit);
            return Some(Transmit::MaxData(limit));
        }
        while let Some(stream_id) = self.stream_updates.pop_front() {
            let flow = match self.requests.get_mut(&stream_id) {
                Some(s) => Some(&mut s.flow),
                None => self.peer_uni.get_mut(&stream_id).map(|u| &mut u.flow),
            };
            if let Some(flow) = flow
                && let Some(limit) = flow.should_update()
            {
                flow.update_sent(limit);
                return Some(Transmit::MaxStreamData { stream_id, limit });
            }
        }
        if buf.is_empty() {
            return None;
        }

        for uni in &mut self.local {
            let n = uni
                .out
                .len()
                .min(buf.len())
                .min(capacity(&uni.flow))
                .min(capacity(&self.conn_flow));
            if n == 0 {
                continue;
            }
            buf[..n].copy_from_slice(&uni.out[..n]);
            uni.out.drain(..n);
            let _ = uni.flow.on_send(n as u64);
            let _ = self.conn_flow.on_send(n as u64);
            return Some(Transmit::Stream { stream_id: uni.id, len: n, fin: false });
        }

        for _ in 0..self.headers_pending.len() {
            let Some(stream_id) = self.headers_pending.pop_front() else { break };
            let Some(stream) = self.requests.get_mut(&stream_id) else { continue };
            let n = stream
                .out
                .len()
                .min(buf.len())
                .min(capacity(&stream.flow))
                .min(capacity(&self.conn_flow));
            if n == 0 {
                // Blocked on flow control; retried on the next call.
                self.headers_pending.push_back(stream_id);
                continue;
            }
            buf[..n].copy_from_slice(&stream.out[..n]);
            stream.out.drain(..n);
            let _ = stream.flow.on_send(n as u64);
            let _ = self.conn_flow.on_send(n as u64);
            let done = stream.out.is_empty();
            let fin = done && stream.fin_queued;
            if !done {
                self.headers_pending.push_front(stream_id);
            } else if fin {
                trace!(stream_id, "h3 response complete");
                self.remove_request(stream_id);
            } else if stream.body_open {
                self.scheduler.set_ready(stream_id, true);
            }
            return Some(Transmit::Stream { stream_id, len: n, fin });
        }
        None
    }

    /// Expire header sections blocked longer than the configured lifetime.
    /// Their streams are reset with H3_REQUEST_REJECTED.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        self.check_open()?;
        let mut expired = Vec::new();
        self.decoder
            .expire_blocked(now, self.config.blocked_lifetime_us, &mut expired)
            .map_err(|e| self.fail(e))?;
        for stream_id in expired {
            warn!(stream_id, "qpack-blocked stream expired");
            self.remove_request(stream_id);
            self.queue_reset(stream_id, Error::stream(stream_id, StreamFault::BlockedTooLong).h3_code());
        }
        self.flush_qpack();
        Ok(())
    }

    /// Earliest deadline `handle_timeout` cares about.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.decoder.next_expiry(self.config.blocked_lifetime_us)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_open(&self) -> Result<(), Error> {
        match self.failed {
            Some(_) => Err(Error::Closed),
            None => Ok(()),
        }
    }

    fn fail(&mut self, e: Error) -> Error {
        if self.failed.is_none() {
            warn!(error = %e, code = e.h3_code(), "h3 connection error");
            self.failed = Some(e);
        }
        e
    }

    fn open_local_streams(&mut self) -> Result<(), Error> {
        let settings = H3Settings {
            max_field_section_size: Some(self.config.max_field_section_size),
            qpack_max_table_capacity: Some(self.config.qpack_max_table_capacity as u64),
            qpack_blocked_streams: Some(self.config.qpack_blocked_streams as u64),
        };
        let kinds = [H3_STREAM_TYPE_CONTROL, H3_STREAM_TYPE_QPACK_ENCODER, H3_STREAM_TYPE_QPACK_DECODER];
        for (id, kind) in LOCAL_UNI_IDS.into_iter().zip(kinds) {
            let mut out = Vec::new();
            out.buf_put_varint(kind)?;
            if kind == H3_STREAM_TYPE_CONTROL {
                put_h3_frame(&H3Frame::Settings(settings.clone()), &mut out)?;
            }
            let flow = StreamFlow::new(0, self.config.peer_max_stream_data);
            self.local.push(LocalUni { id, out, flow });
        }
        Ok(())
    }

    /// Move pending QPACK instructions onto our encoder and decoder streams.
    fn flush_qpack(&mut self) {
        if self.local.len() <= DECODER {
            return;
        }
        let enc = self.encoder.take_instructions();
        self.local[ENCODER].out.extend_from_slice(&enc);
        let dec = self.decoder.take_instructions();
        self.local[DECODER].out.extend_from_slice(&dec);
    }

    fn queue_reset(&mut self, stream_id: u64, code: u64) {
        debug!(stream_id, code, "h3 stream reset");
        self.resets.push_back((stream_id, code));
        self.events.push_back(H3Event::Reset { stream_id, code });
    }

    /// Forget a request stream and release what it held against the
    /// connection window.
    fn remove_request(&mut self, stream_id: u64) -> Option<RequestStream> {
        let stream = self.requests.remove(&stream_id)?;
        self.scheduler.remove(stream_id);
        self.conn_flow.on_consumed((stream.body.len() + stream.recv_buf.len()) as u64);
        Some(stream)
    }

    fn recv_stream_inner(&mut self, stream_id: u64, data: &[u8], fin: bool, now: Instant) -> Result<(), Error> {
        if !is_client_initiated(stream_id) {
            return Err(Error::Transport(TransportError::StreamStateError));
        }
        self.conn_flow.on_recv(data.len() as u64)?;
        if is_unidirectional(stream_id) {
            return self.recv_uni(stream_id, data, fin, now);
        }
        self.recv_request(stream_id, data, fin, now)
    }

    fn recv_request(&mut self, stream_id: u64, data: &[u8], fin: bool, now: Instant) -> Result<(), Error> {
        let len = data.len() as u64;
        if !self.requests.contains_key(&stream_id) {
            if stream_id < self.next_request_id {
                // Closed or refused earlier; the bytes only count against the connection.
                self.conn_flow.on_consumed(len);
                return Ok(());
            }
            self.next_request_id = stream_id + 4;
            let refused = self.requests.len() >= self.config.max_streams
                || self.goaway_sent.is_some_and(|last| stream_id >= last);
            if refused {
                self.conn_flow.on_consumed(len);
                self.queue_reset(stream_id, Error::stream(stream_id, StreamFault::Refused).h3_code());
                return Ok(());
            }
            trace!(stream_id, "h3 request stream opened");
            let flow = StreamFlow::new(self.config.max_stream_data, self.config.peer_max_stream_data);
            self.requests.insert(stream_id, RequestStream::new(flow));
            self.scheduler.insert(stream_id, 0, urgency_weight(DEFAULT_URGENCY), false);
        }

        let stream = self.requests.get_mut(&stream_id).ok_or(Error::InvalidState)?;
        stream.flow.on_recv(len)?;
        stream.recv_buf.extend_from_slice(data);
        stream.fin_received |= fin;

        match self.process_request(stream_id, now) {
            Err(e @ Error::Stream { .. }) => self.reset_stream(stream_id, e.h3_code()),
            other => other,
        }
    }

    /// Parse whatever complete frames the stream has buffered.
    fn process_request(&mut self, stream_id: u64, now: Instant) -> Result<(), Error> {
        let Some(stream) = self.requests.get_mut(&stream_id) else {
            return Ok(());
        };
        let buf = std::mem::take(&mut stream.recv_buf);
        let mut pos = 0;
        let result = self.process_frames(stream_id, &buf, &mut pos, now);
        let Some(stream) = self.requests.get_mut(&stream_id) else {
            return result;
        };
        stream.recv_buf = buf;
        stream.recv_buf.drain(..pos);
        result?;

        if stream.fin_received && !stream.finished_reported {
            match stream.state {
                RecvState::Blocked { .. } => {}
                _ if !stream.recv_buf.is_empty() => return Err(Error::Http3(H3Error::FrameError)),
                RecvState::Headers => return Err(Error::stream(stream_id, StreamFault::Malformed)),
                RecvState::Body | RecvState::Done => {
                    stream.finished_reported = true;
                    self.events.push_back(H3Event::Finished(stream_id));
                }
            }
        }
        Ok(())
    }

    fn process_frames(&mut self, stream_id: u64, buf: &[u8], pos: &mut usize, now: Instant) -> Result<(), Error> {
        while *pos < buf.len() {
            let Some(state) = self.requests.get(&stream_id).map(|s| s.state) else {
                return Ok(());
            };
            if matches!(state, RecvState::Blocked { .. }) {
                return Ok(());
            }
            let (frame, n) = match decode_h3_frame(&buf[*pos..]) {
                Ok(f) => f,
                Err(Error::BufferTooSmall { .. }) => return Ok(()),
                Err(e) => return Err(e),
            };
            *pos += n;
            match (frame, state) {
                (H3Frame::Headers(block), RecvState::Headers) => {
                    self.consumed(stream_id, n);
                    self.decode_headers(stream_id, block, false, now)?;
                }
                (H3Frame::Headers(block), RecvState::Body) => {
                    self.consumed(stream_id, n);
                    self.decode_headers(stream_id, block, true, now)?;
                }
                (H3Frame::Data(payload), RecvState::Body) => {
                    self.consumed(stream_id, n - payload.len());
                    if let Some(stream) = self.requests.get_mut(&stream_id)
                        && !payload.is_empty()
                    {
                        stream.body.extend_from_slice(payload);
                        self.events.push_back(H3Event::Data(stream_id));
                    }
                }
                (H3Frame::Unknown(_), _) => self.consumed(stream_id, n),
                _ => return Err(Error::Http3(H3Error::FrameUnexpected)),
            }
        }
        Ok(())
    }

    fn consumed(&mut self, stream_id: u64, n: usize) {
        self.conn_flow.on_consumed(n as u64);
        if let Some(stream) = self.requests.get_mut(&stream_id) {
            stream.flow.on_consumed(n as u64);
            if stream.flow.should_update().is_some() {
                self.stream_updates.push_back(stream_id);
            }
        }
    }

    fn decode_headers(&mut self, stream_id: u64, block: &[u8], trailers: bool, now: Instant) -> Result<(), Error> {
        let mut fields = Vec::new();
        let section = self
            .decoder
            .decode_field_section(stream_id, block, now, |n, v| fields.push((n.to_vec(), v.to_vec())))?;
        let Some(stream) = self.requests.get_mut(&stream_id) else {
            return Ok(());
        };
        let list_size = match section {
            FieldSection::Blocked => {
                trace!(stream_id, trailers, "h3 header section blocked");
                stream.blocked_block = block.to_vec();
                stream.state = RecvState::Blocked { trailers };
                return Ok(());
            }
            FieldSection::Decoded { list_size } => list_size,
        };
        if list_size as u64 > self.config.max_field_section_size {
            return Err(Error::stream(stream_id, StreamFault::HeaderTooLarge));
        }
        if trailers {
            stream.state = RecvState::Done;
            return Ok(());
        }
        if !fields.iter().any(|(n, _)| n == b":method") {
            return Err(Error::stream(stream_id, StreamFault::Malformed));
        }
        let urgency = fields
            .iter()
            .find(|(n, _)| n == PRIORITY)
            .map_or(DEFAULT_URGENCY, |(_, v)| parse_urgency(v));
        stream.headers = fields;
        stream.state = RecvState::Body;
        self.scheduler.update(stream_id, 0, urgency_weight(urgency), false);
        self.events.push_back(H3Event::Headers(stream_id));
        Ok(())
    }

    fn recv_uni(&mut self, stream_id: u64, data: &[u8], fin: bool, now: Instant) -> Result<(), Error> {
        let len = data.len() as u64;
        let (window, peer) = (self.config.max_stream_data, self.config.peer_max_stream_data);
        let uni = self.peer_uni.entry(stream_id).or_insert_with(|| PeerUni {
            kind: None,
            buf: Vec::new(),
            flow: StreamFlow::new(window, peer),
        });
        uni.flow.on_recv(len)?;
        uni.flow.on_consumed(len);
        if uni.flow.should_update().is_some() {
            self.stream_updates.push_back(stream_id);
        }
        self.conn_flow.on_consumed(len);
        uni.buf.extend_from_slice(data);

        let known = uni.kind;
        let kind = match known {
            Some(kind) => kind,
            None => {
                let (ty, n) = match decode_varint(&uni.buf) {
                    Ok(v) => v,
                    Err(Error::BufferTooSmall { .. }) => return Ok(()),
                    Err(e) => return Err(e),
                };
                uni.buf.drain(..n);
                let kind = self.classify_uni(stream_id, ty)?;
                if let Some(uni) = self.peer_uni.get_mut(&stream_id) {
                    uni.kind = Some(kind);
                }
                kind
            }
        };

        let Some(uni) = self.peer_uni.get_mut(&stream_id) else {
            return Ok(());
        };
        let mut bytes = std::mem::take(&mut uni.buf);
        match kind {
            UniKind::Control => self.recv_control(&mut bytes)?,
            UniKind::Encoder => {
                self.decoder.on_encoder_stream(&bytes)?;
                bytes.clear();
                self.resume_unblocked(now)?;
            }
            UniKind::Decoder => {
                self.encoder.on_decoder_stream(&bytes)?;
                bytes.clear();
            }
            UniKind::Ignored => bytes.clear(),
        }
        if let Some(uni) = self.peer_uni.get_mut(&stream_id) {
            uni.buf = bytes;
        }
        if fin && kind != UniKind::Ignored {
            return Err(Error::Http3(H3Error::ClosedCriticalStream));
        }
        Ok(())
    }

    fn classify_uni(&mut self, stream_id: u64, ty: u64) -> Result<UniKind, Error> {
        const DUPLICATE: Error = Error::Http3(H3Error::StreamCreationError);
        let slot = match ty {
            H3_STREAM_TYPE_CONTROL => &mut self.peer_control,
            H3_STREAM_TYPE_QPACK_ENCODER => &mut self.peer_encoder,
            H3_STREAM_TYPE_QPACK_DECODER => &mut self.peer_decoder,
            // Only servers push.
            H3_STREAM_TYPE_PUSH => return Err(DUPLICATE),
            _ => {
                trace!(stream_id, stream_type = ty, "ignoring unknown uni stream");
                return Ok(UniKind::Ignored);
            }
        };
        if slot.is_some() {
            return Err(DUPLICATE);
        }
        *slot = Some(stream_id);
        trace!(stream_id, stream_type = ty, "peer uni stream opened");
        Ok(match ty {
            H3_STREAM_TYPE_CONTROL => UniKind::Control,
            H3_STREAM_TYPE_QPACK_ENCODER => UniKind::Encoder,
            _ => UniKind::Decoder,
        })
    }

    /// Parse complete control frames from `buf`, leaving any partial frame.
    fn recv_control(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let mut pos = 0;
        while pos < buf.len() {
            let (frame, n) = match decode_h3_frame(&buf[pos..]) {
                Ok(f) => f,
                Err(Error::BufferTooSmall { .. }) => break,
                Err(e) => return Err(e),
            };
            pos += n;
            if self.peer_settings.is_none() && !matches!(frame, H3Frame::Settings(_)) {
                return Err(Error::Http3(H3Error::MissingSettings));
            }
            match frame {
                H3Frame::Settings(settings) => {
                    if self.peer_settings.is_some() {
                        return Err(Error::Http3(H3Error::FrameUnexpected));
                    }
                    self.encoder.configure(
                        settings.qpack_max_table_capacity.unwrap_or(0),
                        settings.qpack_blocked_streams.unwrap_or(0),
                    )?;
                    debug!(?settings, "h3 peer settings");
                    self.peer_settings = Some(settings);
                    self.events.push_back(H3Event::Connected);
                }
                H3Frame::GoAway(id) => {
                    debug!(id, "h3 peer goaway");
                    self.events.push_back(H3Event::GoAway(id));
                }
                H3Frame::PriorityUpdate { stream_id, value } => {
                    if !is_client_initiated(stream_id) || is_unidirectional(stream_id) {
                        return Err(Error::Http3(H3Error::IdError));
                    }
                    if self.scheduler.contains(stream_id) {
                        let weight = urgency_weight(parse_urgency(value));
                        self.scheduler.update(stream_id, 0, weight, false);
                    }
                }
                H3Frame::MaxPushId(_) | H3Frame::CancelPush(_) | H3Frame::Unknown(_) => {}
                H3Frame::Data(_) | H3Frame::Headers(_) | H3Frame::PushPromise => {
                    return Err(Error::Http3(H3Error::FrameUnexpected));
                }
            }
        }
        buf.drain(..pos);
        Ok(())
    }

    /// Re-run header sections whose inserts have now arrived.
    fn resume_unblocked(&mut self, now: Instant) -> Result<(), Error> {
        let mut ready = Vec::new();
        self.decoder.take_unblocked(&mut ready);
        for stream_id in ready {
            let Some(stream) = self.requests.get_mut(&stream_id) else {
                continue;
            };
            let RecvState::Blocked { trailers } = stream.state else {
                continue;
            };
            let block = std::mem::take(&mut stream.blocked_block);
            stream.state = if trailers { RecvState::Body } else { RecvState::Headers };
            trace!(stream_id, "h3 header section unblocked");
            let result = self
                .decode_headers(stream_id, &block, trailers, now)
                .and_then(|()| self.process_request(stream_id, now));
            match result {
                Err(e @ Error::Stream { .. }) => self.reset_stream(stream_id, e.h3_code())?,
                other => other?,
            }
        }
        Ok(())
    }
}

fn capacity(flow: &StreamFlow) -> usize {
    usize::try_from(flow.send_capacity()).unwrap_or(usize::MAX)
}
