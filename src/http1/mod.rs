//! HTTP/1.1 server side: zero-copy request parsing, pipelining, and
//! response head and chunk framing.

pub mod codec;
pub mod parse;

pub use codec::{CONTINUE_RESPONSE, Http1Codec, Http1Item, RequestHead, ResponseQueue};
pub use parse::{BodyFraming, MAX_HEADERS, ParsedHead};
