//! HTTP/3 handler (RFC 9114) over streams reassembled by the QUIC transport.
//!
//! The QUIC transport (loss recovery, congestion control, packet protection)
//! is a collaborator. This module sees ordered bytes per stream id, decides
//! what is allowed at each key phase, and produces stream writes bounded by
//! MAX_DATA / MAX_STREAM_DATA.

pub mod connection;
pub mod flow_control;
pub mod frame;
pub mod qpack;

pub use connection::{H3Config, H3Connection, H3Event, Transmit};
pub use flow_control::StreamFlow;
pub use frame::{H3Frame, decode_h3_frame, put_h3_frame};

/// HTTP/3 settings (RFC 9114 §7.2.4.1).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct H3Settings {
    /// SETTINGS_MAX_FIELD_SECTION_SIZE (0x06).
    pub max_field_section_size: Option<u64>,
    /// SETTINGS_QPACK_MAX_TABLE_CAPACITY (0x01).
    pub qpack_max_table_capacity: Option<u64>,
    /// SETTINGS_QPACK_BLOCKED_STREAMS (0x07).
    pub qpack_blocked_streams: Option<u64>,
}

pub const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x06;
pub const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
pub const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x07;

/// HTTP/3 unidirectional stream types (RFC 9114 §6.2, RFC 9204 §4.2).
pub const H3_STREAM_TYPE_CONTROL: u64 = 0x00;
pub const H3_STREAM_TYPE_PUSH: u64 = 0x01;
pub const H3_STREAM_TYPE_QPACK_ENCODER: u64 = 0x02;
pub const H3_STREAM_TYPE_QPACK_DECODER: u64 = 0x03;

/// Packet protection level the transport has keys for.
///
/// Keys are installed strictly in this order. Request streams only exist
/// once 1-RTT keys are in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyPhase {
    Initial,
    Handshake,
    OneRtt,
}

/// RFC 9218 default urgency.
pub const DEFAULT_URGENCY: u8 = 3;

/// Urgency from a `priority` field value (`u=N, i`). Unknown parameters
/// and out-of-range urgencies are ignored.
pub fn parse_urgency(value: &[u8]) -> u8 {
    value
        .split(|&b| b == b',')
        .map(|item| crate::http::header::trim_ows(item))
        .find_map(|item| match item {
            [b'u', b'=', d] if d.is_ascii_digit() && *d <= b'7' => Some(d - b'0'),
            _ => None,
        })
        .unwrap_or(DEFAULT_URGENCY)
}

/// Scheduler weight for an urgency: 0 is most urgent.
pub const fn urgency_weight(urgency: u8) -> u16 {
    let u = if urgency > 7 { 7 } else { urgency };
    (8 - u as u16) * 32
}

/// Whether the stream id was opened by the client.
pub const fn is_client_initiated(stream_id: u64) -> bool {
    stream_id & 0x1 == 0
}

/// Whether the stream id is unidirectional.
pub const fn is_unidirectional(stream_id: u64) -> bool {
    stream_id & 0x2 != 0
}
