//! Shared HTTP types used across HTTP/1.1, HTTP/2, and HTTP/3.

pub mod header;
pub mod message;
pub mod method;
pub mod status;

pub use header::{Header, HeaderList, HeaderSlice, Slice};
pub use message::{
    Body, Protocol, Request, ResponseDescriptor, RouteDecision, UpstreamTarget, Version,
};
pub use method::Method;
pub use status::StatusCode;
