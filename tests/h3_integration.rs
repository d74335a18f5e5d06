//! HTTP/3 end-to-end tests: a worker driving in-memory QUIC connections.
//!
//! The packet layer is a collaborator, so these tests hand the server a
//! fake acceptor whose connections deliver reassembled stream bytes and
//! record everything written back.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use milli_serve::config::{Limits, WorkerConfig};
use milli_serve::error::Error;
use milli_serve::h3::qpack::{FieldSection, QpackDecoder, QpackEncoder};
use milli_serve::h3::{
    H3_STREAM_TYPE_CONTROL, H3_STREAM_TYPE_QPACK_ENCODER, H3Frame, H3Settings, KeyPhase, decode_h3_frame, put_h3_frame,
};
use milli_serve::http::{Request, ResponseDescriptor, RouteDecision, StatusCode};
use milli_serve::server::{Server, ServerHandle};
use milli_serve::service::{QuicAcceptor, QuicEvent, QuicTransport, Router, Services};

// ---------------------------------------------------------------------------
// Fake packet layer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Wire {
    events: VecDeque<QuicEvent>,
    streams: HashMap<u64, (Vec<u8>, bool)>,
    resets: Vec<(u64, u64)>,
    closed: Option<u64>,
    bell: Option<Bell>,
}

/// Tells the acceptor which connection has new events: a datagram
/// carrying the connection id.
struct Bell {
    socket: std::net::UdpSocket,
    target: SocketAddr,
    id: u64,
}

impl Bell {
    fn ring(&self) {
        self.socket.send_to(&self.id.to_be_bytes(), self.target).unwrap();
    }
}

type SharedWire = Arc<Mutex<Wire>>;

struct FakeConnection {
    id: u64,
    wire: SharedWire,
}

impl QuicTransport for FakeConnection {
    fn id(&self) -> u64 {
        self.id
    }
    fn alpn(&self) -> Option<&[u8]> {
        Some(b"h3")
    }
    fn poll_event(&mut self) -> Option<QuicEvent> {
        self.wire.lock().unwrap().events.pop_front()
    }
    fn send_crypto(&mut self, _: KeyPhase, _: &[u8]) -> Result<(), Error> {
        Ok(())
    }
    fn send_stream(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<(), Error> {
        let mut wire = self.wire.lock().unwrap();
        let entry = wire.streams.entry(stream_id).or_default();
        entry.0.extend_from_slice(data);
        entry.1 |= fin;
        Ok(())
    }
    fn reset_stream(&mut self, stream_id: u64, code: u64) -> Result<(), Error> {
        self.wire.lock().unwrap().resets.push((stream_id, code));
        Ok(())
    }
    fn send_max_data(&mut self, _: u64) -> Result<(), Error> {
        Ok(())
    }
    fn send_max_stream_data(&mut self, _: u64, _: u64) -> Result<(), Error> {
        Ok(())
    }
    fn close(&mut self, code: u64) {
        self.wire.lock().unwrap().closed = Some(code);
    }
}

type Pending = Arc<Mutex<Vec<Box<dyn QuicTransport>>>>;

/// Hands out queued connections whenever a datagram arrives and reports
/// the connection ids the datagrams carry as ready.
struct FakeAcceptor {
    socket: mio::net::UdpSocket,
    pending: Pending,
}

impl QuicAcceptor for FakeAcceptor {
    fn socket(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.socket
    }
    fn accept(&mut self, _now: u64, out: &mut Vec<Box<dyn QuicTransport>>, ready: &mut Vec<u64>) -> Result<(), Error> {
        let mut buf = [0u8; 1500];
        while let Ok((n, _)) = self.socket.recv_from(&mut buf) {
            if let Ok(id) = <[u8; 8]>::try_from(&buf[..n]) {
                ready.push(u64::from_be_bytes(id));
            }
        }
        out.append(&mut self.pending.lock().unwrap());
        Ok(())
    }
    fn flush(&mut self, _now: u64) -> Result<(), Error> {
        Ok(())
    }
    fn next_timeout(&self) -> Option<u64> {
        None
    }
}

struct Harness {
    handle: ServerHandle,
    pending: Pending,
    knock: Arc<Mutex<Option<SocketAddr>>>,
}

impl Harness {
    fn start() -> Self {
        let pending: Pending = Arc::default();
        let knock: Arc<Mutex<Option<SocketAddr>>> = Arc::default();
        let config = WorkerConfig {
            listen: vec![SocketAddr::from(([127, 0, 0, 1], 0))],
            quic_listen: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
            workers: 1,
            limits: Limits { qpack_blocked_lifetime_ms: 10_000, ..Limits::default() },
            ..WorkerConfig::default()
        };
        let (p, k) = (pending.clone(), knock.clone());
        let acceptor = move |_: usize| -> Result<Box<dyn QuicAcceptor>, Error> {
            let socket = mio::net::UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0)))?;
            *k.lock().unwrap() = Some(socket.local_addr()?);
            Ok(Box::new(FakeAcceptor { socket, pending: p.clone() }))
        };
        let services =
            Services::new(Arc::new(|| Box::new(Echo) as Box<dyn Router>)).with_quic(Arc::new(acceptor));
        let handle = Server::bind(Arc::new(config), services).unwrap().start().unwrap();
        Self { handle, pending, knock }
    }

    /// Queue a connection and poke the worker's UDP socket so it accepts it.
    fn connect(&self, id: u64) -> SharedWire {
        wait_for(|| self.knock.lock().unwrap().is_some());
        let target = self.knock.lock().unwrap().unwrap();
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let wire: SharedWire = Arc::default();
        {
            let mut w = wire.lock().unwrap();
            w.events.push_back(QuicEvent::KeysInstalled(KeyPhase::Handshake));
            w.events.push_back(QuicEvent::KeysInstalled(KeyPhase::OneRtt));
            w.bell = Some(Bell { socket, target, id });
        }
        self.pending.lock().unwrap().push(Box::new(FakeConnection { id, wire: wire.clone() }));
        ring(&wire);
        wire
    }

    fn stop(self) {
        self.handle.shutdown();
        self.handle.join();
    }
}

struct Echo;

impl Router for Echo {
    fn route(&mut self, req: &Request<'_>) -> RouteDecision {
        let path = String::from_utf8_lossy(req.path).into_owned();
        RouteDecision::Respond(ResponseDescriptor::text(StatusCode::OK, &format!("path={path} body={}", req.body.len())))
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for the worker");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Queue stream bytes without telling the worker.
fn queue(wire: &SharedWire, stream_id: u64, data: Vec<u8>, fin: bool) {
    wire.lock().unwrap().events.push_back(QuicEvent::Stream { stream_id, data, fin });
}

fn ring(wire: &SharedWire) {
    if let Some(bell) = &wire.lock().unwrap().bell {
        bell.ring();
    }
}

fn push(wire: &SharedWire, stream_id: u64, data: Vec<u8>, fin: bool) {
    queue(wire, stream_id, data, fin);
    ring(wire);
}

fn control(capacity: u64, blocked: u64) -> Vec<u8> {
    let mut out = vec![H3_STREAM_TYPE_CONTROL as u8];
    let settings = H3Settings {
        max_field_section_size: None,
        qpack_max_table_capacity: Some(capacity),
        qpack_blocked_streams: Some(blocked),
    };
    put_h3_frame(&H3Frame::Settings(settings), &mut out).unwrap();
    out
}

fn request(enc: &mut QpackEncoder, stream_id: u64, path: &[u8], extra: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut fields: Vec<(&[u8], &[u8])> =
        vec![(b":method", b"GET"), (b":scheme", b"https"), (b":authority", b"example.com"), (b":path", path)];
    fields.extend_from_slice(extra);
    let mut block = Vec::new();
    enc.encode_field_section(stream_id, &fields, &mut block).unwrap();
    let mut out = Vec::new();
    put_h3_frame(&H3Frame::Headers(&block), &mut out).unwrap();
    out
}

fn finished(wire: &SharedWire, stream_id: u64) -> bool {
    wire.lock().unwrap().streams.get(&stream_id).is_some_and(|(_, fin)| *fin)
}

/// Decode the response on `stream_id`, applying the server's encoder
/// stream first.
fn response(wire: &SharedWire, stream_id: u64) -> (Vec<(Vec<u8>, Vec<u8>)>, Vec<u8>) {
    let w = wire.lock().unwrap();
    let mut decoder = QpackDecoder::new(4096, 16);
    if let Some((encoder_stream, _)) = w.streams.get(&7)
        && encoder_stream.len() > 1
    {
        decoder.on_encoder_stream(&encoder_stream[1..]).unwrap();
    }
    let bytes = &w.streams[&stream_id].0;
    let mut pos = 0;
    let mut fields = Vec::new();
    let mut body = Vec::new();
    while pos < bytes.len() {
        let (frame, n) = decode_h3_frame(&bytes[pos..]).unwrap();
        match frame {
            H3Frame::Headers(block) => {
                let section = decoder
                    .decode_field_section(stream_id, block, 0, |n, v| fields.push((n.to_vec(), v.to_vec())))
                    .unwrap();
                assert!(matches!(section, FieldSection::Decoded { .. }));
            }
            H3Frame::Data(data) => body.extend_from_slice(data),
            other => panic!("unexpected frame {other:?}"),
        }
        pos += n;
    }
    (fields, body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn request_over_quic_is_answered() {
    let harness = Harness::start();
    let wire = harness.connect(1);
    push(&wire, 2, control(0, 0), false);
    let mut enc = QpackEncoder::new(0);
    push(&wire, 0, request(&mut enc, 0, b"/hello", &[]), true);

    wait_for(|| finished(&wire, 0));
    let (fields, body) = response(&wire, 0);
    assert_eq!(fields[0], (b":status".to_vec(), b"200".to_vec()));
    assert_eq!(body, b"path=/hello body=0");
    assert!(wire.lock().unwrap().resets.is_empty());
    harness.stop();
}

#[test]
fn blocked_header_section_stalls_only_its_stream() {
    let harness = Harness::start();
    let wire = harness.connect(2);
    push(&wire, 2, control(0, 0), false);

    let mut enc = QpackEncoder::new(4096);
    enc.configure(4096, 1).unwrap();
    let blocked = request(&mut enc, 0, b"/blocked", &[(b"x-trace", b"abc")]);
    let inserts = enc.take_instructions();
    assert!(!inserts.is_empty());
    let independent = request(&mut enc, 4, b"/free", &[(b"x-trace", b"abc")]);
    push(&wire, 0, blocked, true);
    push(&wire, 4, independent, true);

    wait_for(|| finished(&wire, 4));
    assert!(!finished(&wire, 0));
    assert_eq!(response(&wire, 4).1, b"path=/free body=0");

    let mut encoder_stream = vec![H3_STREAM_TYPE_QPACK_ENCODER as u8];
    encoder_stream.extend_from_slice(&inserts);
    push(&wire, 6, encoder_stream, false);
    wait_for(|| finished(&wire, 0));
    assert_eq!(response(&wire, 0).1, b"path=/blocked body=0");
    harness.stop();
}

#[test]
fn shutdown_sends_h3_goaway() {
    let harness = Harness::start();
    let wire = harness.connect(3);
    push(&wire, 2, control(0, 0), false);
    wait_for(|| wire.lock().unwrap().streams.contains_key(&3));
    harness.handle.shutdown();

    // Control stream: type byte, SETTINGS, then GOAWAY.
    wait_for(|| {
        let w = wire.lock().unwrap();
        let control = &w.streams[&3].0;
        let mut pos = 1;
        while let Ok((frame, n)) = decode_h3_frame(&control[pos..]) {
            if matches!(frame, H3Frame::GoAway(_)) {
                return true;
            }
            pos += n;
        }
        false
    });
    harness.handle.join();
    assert_eq!(wire.lock().unwrap().closed, Some(0x100));
}

#[test]
fn only_signalled_connections_are_serviced() {
    let harness = Harness::start();
    let quiet = harness.connect(4);
    let loud = harness.connect(5);
    push(&quiet, 2, control(0, 0), false);
    push(&loud, 2, control(0, 0), false);
    wait_for(|| quiet.lock().unwrap().streams.contains_key(&3) && loud.lock().unwrap().streams.contains_key(&3));

    let mut enc = QpackEncoder::new(0);
    queue(&quiet, 0, request(&mut enc, 0, b"/quiet", &[]), true);
    push(&loud, 0, request(&mut enc, 0, b"/loud", &[]), true);
    wait_for(|| finished(&loud, 0));
    std::thread::sleep(Duration::from_millis(50));
    assert!(!finished(&quiet, 0));

    ring(&quiet);
    wait_for(|| finished(&quiet, 0));
    assert_eq!(response(&quiet, 0).1, b"path=/quiet body=0");
    harness.stop();
}
