//! Closed error taxonomy for the request-processing core.
//!
//! Every failure the core can observe is one variant of [`Error`]. Handlers
//! never inspect strings: they match on the variant, or on its
//! [`ErrorClass`], and the compiler checks that every path is covered.

use crate::http::StatusCode;

/// QUIC transport error codes (RFC 9000 §20).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TransportError {
    NoError = 0x00,
    InternalError = 0x01,
    ConnectionRefused = 0x02,
    FlowControlError = 0x03,
    StreamLimitError = 0x04,
    StreamStateError = 0x05,
    FinalSizeError = 0x06,
    FrameEncodingError = 0x07,
    TransportParameterError = 0x08,
    ConnectionIdLimitError = 0x09,
    ProtocolViolation = 0x0a,
    InvalidToken = 0x0b,
    ApplicationError = 0x0c,
    CryptoBufferExceeded = 0x0d,
    KeyUpdateError = 0x0e,
    AeadLimitReached = 0x0f,
    NoViablePath = 0x10,
    VersionNegotiationError = 0x11,
}

impl TransportError {
    /// Convert a transport error to its RFC 9000 wire code.
    pub const fn to_code(self) -> u64 {
        self as u64
    }

    /// Parse a wire error code into a `TransportError`.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x00 => Some(Self::NoError),
            0x01 => Some(Self::InternalError),
            0x02 => Some(Self::ConnectionRefused),
            0x03 => Some(Self::FlowControlError),
            0x04 => Some(Self::StreamLimitError),
            0x05 => Some(Self::StreamStateError),
            0x06 => Some(Self::FinalSizeError),
            0x07 => Some(Self::FrameEncodingError),
            0x08 => Some(Self::TransportParameterError),
            0x09 => Some(Self::ConnectionIdLimitError),
            0x0a => Some(Self::ProtocolViolation),
            0x0b => Some(Self::InvalidToken),
            0x0c => Some(Self::ApplicationError),
            0x0d => Some(Self::CryptoBufferExceeded),
            0x0e => Some(Self::KeyUpdateError),
            0x0f => Some(Self::AeadLimitReached),
            0x10 => Some(Self::NoViablePath),
            0x11 => Some(Self::VersionNegotiationError),
            _ => None,
        }
    }
}

/// HTTP/3 and QPACK error codes (RFC 9114 §8.1, RFC 9204 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum H3Error {
    NoError = 0x0100,
    GeneralProtocolError = 0x0101,
    InternalError = 0x0102,
    StreamCreationError = 0x0103,
    ClosedCriticalStream = 0x0104,
    FrameUnexpected = 0x0105,
    FrameError = 0x0106,
    ExcessiveLoad = 0x0107,
    IdError = 0x0108,
    SettingsError = 0x0109,
    MissingSettings = 0x010a,
    RequestRejected = 0x010b,
    RequestCancelled = 0x010c,
    RequestIncomplete = 0x010d,
    MessageError = 0x010e,
    ConnectError = 0x010f,
    VersionFallback = 0x0110,
    QpackDecompressionFailed = 0x0200,
    QpackEncoderStreamError = 0x0201,
    QpackDecoderStreamError = 0x0202,
}

impl H3Error {
    pub const fn to_code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x0100 => Some(Self::NoError),
            0x0101 => Some(Self::GeneralProtocolError),
            0x0102 => Some(Self::InternalError),
            0x0103 => Some(Self::StreamCreationError),
            0x0104 => Some(Self::ClosedCriticalStream),
            0x0105 => Some(Self::FrameUnexpected),
            0x0106 => Some(Self::FrameError),
            0x0107 => Some(Self::ExcessiveLoad),
            0x0108 => Some(Self::IdError),
            0x0109 => Some(Self::SettingsError),
            0x010a => Some(Self::MissingSettings),
            0x010b => Some(Self::RequestRejected),
            0x010c => Some(Self::RequestCancelled),
            0x010d => Some(Self::RequestIncomplete),
            0x010e => Some(Self::MessageError),
            0x010f => Some(Self::ConnectError),
            0x0110 => Some(Self::VersionFallback),
            0x0200 => Some(Self::QpackDecompressionFailed),
            0x0201 => Some(Self::QpackEncoderStreamError),
            0x0202 => Some(Self::QpackDecoderStreamError),
            _ => None,
        }
    }
}

/// HTTP/2 error codes (RFC 9113 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum H2Error {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl H2Error {
    pub const fn to_code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(Self::NoError),
            0x1 => Some(Self::ProtocolError),
            0x2 => Some(Self::InternalError),
            0x3 => Some(Self::FlowControlError),
            0x4 => Some(Self::SettingsTimeout),
            0x5 => Some(Self::StreamClosed),
            0x6 => Some(Self::FrameSizeError),
            0x7 => Some(Self::RefusedStream),
            0x8 => Some(Self::Cancel),
            0x9 => Some(Self::CompressionError),
            0xa => Some(Self::ConnectError),
            0xb => Some(Self::EnhanceYourCalm),
            0xc => Some(Self::InadequateSecurity),
            0xd => Some(Self::Http11Required),
            _ => None,
        }
    }
}

/// Why a single stream failed while its connection keeps serving others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    /// Request line, header syntax or framing was invalid.
    Malformed,
    /// Header section exceeded the configured limit.
    HeaderTooLarge,
    /// Stream was refused (concurrency limit or shutdown).
    Refused,
    /// Peer or policy cancelled the exchange.
    Cancelled,
    /// A QPACK-blocked header section outlived its lifetime bound.
    BlockedTooLong,
    /// Frame or operation not allowed in the stream's current state.
    IllegalState,
}

/// Coarse class of an [`Error`]; decides how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection reset, timeout, closed socket: tear the connection down, no retry.
    Transport,
    /// Peer broke the protocol: send a termination frame if possible, then drop.
    Protocol,
    /// Only one stream is affected: reset it and keep the connection.
    Stream,
    /// Capacity exhausted: reject with a capacity response, or drop.
    Resource,
    /// Proxied backend failed: surface as a gateway response.
    Upstream,
    /// Nothing failed; the operation must be retried on the next readiness.
    Pending,
}

/// Top-level crate error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Socket-level failure reported by the OS.
    Io(std::io::ErrorKind),
    /// Idle or header timeout elapsed.
    TimedOut,
    /// Connection is closed.
    Closed,
    /// QUIC transport error, fatal to the connection.
    Transport(TransportError),
    /// HTTP/3 connection error.
    Http3(H3Error),
    /// HTTP/2 connection error.
    Http2(H2Error),
    /// First bytes match no supported protocol.
    MalformedPreface,
    /// Header compression index out of range, or table desynchronized.
    InvalidIndex { index: u64 },
    /// Header block is malformed (bad integer, Huffman, or instruction).
    HeaderBlock,
    /// TLS collaborator rejected a record or handshake.
    Crypto,
    /// Stream-scoped failure.
    Stream { stream_id: u64, fault: StreamFault },
    /// Connection arena budget or page pool exhausted.
    ArenaExhausted,
    /// A single header entry exceeds the dynamic table capacity.
    TableCapacityExceeded,
    /// Caller-provided or bounded buffer too small.
    BufferTooSmall { needed: usize },
    /// No more stream slots available.
    StreamLimitExhausted,
    /// Proxied request timed out on every attempt.
    UpstreamTimeout,
    /// Proxied request failed without a response.
    UpstreamUnavailable,
    /// Would block; retry on the next readiness notification.
    WouldBlock,
    /// Operation not valid in the current state.
    InvalidState,
}

impl Error {
    /// Shorthand for a stream-scoped error.
    pub const fn stream(stream_id: u64, fault: StreamFault) -> Self {
        Error::Stream { stream_id, fault }
    }

    /// Map the error onto the propagation taxonomy.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Error::Io(_) | Error::TimedOut | Error::Closed => ErrorClass::Transport,
            Error::Transport(_)
            | Error::Http3(_)
            | Error::Http2(_)
            | Error::MalformedPreface
            | Error::InvalidIndex { .. }
            | Error::HeaderBlock
            | Error::Crypto
            | Error::InvalidState => ErrorClass::Protocol,
            Error::Stream { .. } => ErrorClass::Stream,
            Error::ArenaExhausted
            | Error::TableCapacityExceeded
            | Error::BufferTooSmall { .. }
            | Error::StreamLimitExhausted => ErrorClass::Resource,
            Error::UpstreamTimeout | Error::UpstreamUnavailable => ErrorClass::Upstream,
            Error::WouldBlock => ErrorClass::Pending,
        }
    }

    /// Status of the response to synthesise, when one can still be sent.
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Stream { fault, .. } => match fault {
                StreamFault::Malformed => Some(StatusCode::BAD_REQUEST),
                StreamFault::HeaderTooLarge => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
                StreamFault::Refused | StreamFault::BlockedTooLong => {
                    Some(StatusCode::SERVICE_UNAVAILABLE)
                }
                StreamFault::Cancelled | StreamFault::IllegalState => None,
            },
            Error::ArenaExhausted | Error::BufferTooSmall { .. } => {
                Some(StatusCode::PAYLOAD_TOO_LARGE)
            }
            Error::TableCapacityExceeded => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Error::StreamLimitExhausted => Some(StatusCode::SERVICE_UNAVAILABLE),
            Error::UpstreamTimeout => Some(StatusCode::GATEWAY_TIMEOUT),
            Error::UpstreamUnavailable => Some(StatusCode::BAD_GATEWAY),
            Error::Io(_)
            | Error::TimedOut
            | Error::Closed
            | Error::Transport(_)
            | Error::Http3(_)
            | Error::Http2(_)
            | Error::MalformedPreface
            | Error::InvalidIndex { .. }
            | Error::HeaderBlock
            | Error::Crypto
            | Error::WouldBlock
            | Error::InvalidState => None,
        }
    }

    /// HTTP/2 error code to put in RST_STREAM or GOAWAY for this error.
    pub const fn h2_code(&self) -> H2Error {
        match self {
            Error::Http2(e) => *e,
            Error::InvalidIndex { .. } | Error::HeaderBlock | Error::TableCapacityExceeded => {
                H2Error::CompressionError
            }
            Error::Stream { fault, .. } => match fault {
                StreamFault::Refused | StreamFault::BlockedTooLong => H2Error::RefusedStream,
                StreamFault::Cancelled => H2Error::Cancel,
                StreamFault::IllegalState => H2Error::StreamClosed,
                StreamFault::Malformed | StreamFault::HeaderTooLarge => H2Error::ProtocolError,
            },
            Error::StreamLimitExhausted => H2Error::RefusedStream,
            Error::ArenaExhausted | Error::BufferTooSmall { .. } => H2Error::EnhanceYourCalm,
            Error::MalformedPreface | Error::InvalidState | Error::Transport(_) | Error::Http3(_) => {
                H2Error::ProtocolError
            }
            Error::Io(_)
            | Error::TimedOut
            | Error::Closed
            | Error::Crypto
            | Error::UpstreamTimeout
            | Error::UpstreamUnavailable
            | Error::WouldBlock => H2Error::InternalError,
        }
    }

    /// HTTP/3 application error code for stream resets or CONNECTION_CLOSE.
    pub const fn h3_code(&self) -> u64 {
        match self {
            Error::Http3(e) => e.to_code(),
            Error::Transport(e) => e.to_code(),
            Error::InvalidIndex { .. } | Error::HeaderBlock | Error::TableCapacityExceeded => {
                H3Error::QpackDecompressionFailed.to_code()
            }
            Error::Stream { fault, .. } => match fault {
                StreamFault::Refused | StreamFault::BlockedTooLong => {
                    H3Error::RequestRejected.to_code()
                }
                StreamFault::Cancelled => H3Error::RequestCancelled.to_code(),
                StreamFault::Malformed | StreamFault::HeaderTooLarge => {
                    H3Error::MessageError.to_code()
                }
                StreamFault::IllegalState => H3Error::FrameUnexpected.to_code(),
            },
            Error::StreamLimitExhausted | Error::ArenaExhausted | Error::BufferTooSmall { .. } => {
                H3Error::ExcessiveLoad.to_code()
            }
            Error::MalformedPreface | Error::InvalidState | Error::Http2(_) => {
                H3Error::GeneralProtocolError.to_code()
            }
            Error::Io(_)
            | Error::TimedOut
            | Error::Closed
            | Error::Crypto
            | Error::UpstreamTimeout
            | Error::UpstreamUnavailable
            | Error::WouldBlock => H3Error::InternalError.to_code(),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<H3Error> for Error {
    fn from(e: H3Error) -> Self {
        Error::Http3(e)
    }
}

impl From<H2Error> for Error {
    fn from(e: H2Error) -> Self {
        Error::Http2(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock => Error::WouldBlock,
            std::io::ErrorKind::TimedOut => Error::TimedOut,
            kind => Error::Io(kind),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Io(kind) => write!(f, "I/O error: {kind}"),
            Error::TimedOut => write!(f, "timed out"),
            Error::Closed => write!(f, "connection closed"),
            Error::Transport(e) => write!(f, "transport error: {e:?}"),
            Error::Http3(e) => write!(f, "HTTP/3 error: {e:?}"),
            Error::Http2(e) => write!(f, "HTTP/2 error: {e:?}"),
            Error::MalformedPreface => write!(f, "malformed connection preface"),
            Error::InvalidIndex { index } => write!(f, "header table index {index} out of range"),
            Error::HeaderBlock => write!(f, "malformed header block"),
            Error::Crypto => write!(f, "TLS record or handshake rejected"),
            Error::Stream { stream_id, fault } => {
                write!(f, "stream {stream_id} failed: {fault:?}")
            }
            Error::ArenaExhausted => write!(f, "connection arena budget exhausted"),
            Error::TableCapacityExceeded => write!(f, "header entry exceeds table capacity"),
            Error::BufferTooSmall { needed } => {
                write!(f, "buffer too small, need {needed} bytes")
            }
            Error::StreamLimitExhausted => write!(f, "stream limit exhausted"),
            Error::UpstreamTimeout => write!(f, "upstream timed out"),
            Error::UpstreamUnavailable => write!(f, "upstream unavailable"),
            Error::WouldBlock => write!(f, "would block"),
            Error::InvalidState => write!(f, "invalid state"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h2_codes_round_trip() {
        for code in 0..=0xd {
            let e = H2Error::from_code(code).unwrap();
            assert_eq!(e.to_code(), code);
        }
        assert_eq!(H2Error::from_code(0xe), None);
    }

    #[test]
    fn h3_codes_round_trip() {
        assert_eq!(H3Error::from_code(0x0200), Some(H3Error::QpackDecompressionFailed));
        assert_eq!(H3Error::RequestRejected.to_code(), 0x010b);
        assert_eq!(H3Error::from_code(0x0300), None);
    }

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(Error::Io(std::io::ErrorKind::ConnectionReset).class(), ErrorClass::Transport);
        assert_eq!(Error::Http2(H2Error::FlowControlError).class(), ErrorClass::Protocol);
        assert_eq!(Error::InvalidIndex { index: 70 }.class(), ErrorClass::Protocol);
        assert_eq!(Error::stream(3, StreamFault::Malformed).class(), ErrorClass::Stream);
        assert_eq!(Error::ArenaExhausted.class(), ErrorClass::Resource);
        assert_eq!(Error::UpstreamTimeout.class(), ErrorClass::Upstream);
        assert_eq!(Error::WouldBlock.class(), ErrorClass::Pending);
    }

    #[test]
    fn status_for_recoverable_errors() {
        assert_eq!(Error::UpstreamTimeout.status(), Some(StatusCode::GATEWAY_TIMEOUT));
        assert_eq!(Error::ArenaExhausted.status(), Some(StatusCode::PAYLOAD_TOO_LARGE));
        assert_eq!(
            Error::stream(1, StreamFault::Malformed).status(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(Error::Http2(H2Error::ProtocolError).status(), None);
    }

    #[test]
    fn wire_codes_for_stream_faults() {
        let e = Error::stream(5, StreamFault::BlockedTooLong);
        assert_eq!(e.h3_code(), H3Error::RequestRejected.to_code());
        assert_eq!(e.h2_code(), H2Error::RefusedStream);
        assert_eq!(Error::InvalidIndex { index: 9 }.h2_code(), H2Error::CompressionError);
    }

    #[test]
    fn io_would_block_maps_to_pending() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::WouldBlock).into();
        assert_eq!(e, Error::WouldBlock);
    }
}
