//! HTTP/2 protocol implementation (RFC 9113).
//!
//! A pure-codec HTTP/2 server stack with the same calling convention as
//! the HTTP/3 handler: `feed_data()` → `poll_event()` → `poll_output()`.

pub mod connection;
pub mod flow_control;
pub mod frame;
pub mod priority;
pub mod stream;

pub use connection::{CONNECTION_PREFACE, H2Config, H2Connection, H2Event, H2Settings};
pub use flow_control::{FlowController, RecvWindow};
pub use frame::{H2Frame, H2FrameHeader, H2Priority};
pub use priority::PriorityScheduler;
