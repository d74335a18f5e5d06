//! Multi-protocol HTTP request-processing core.
//!
//! Sans-IO codecs for HTTP/1.1 ([`http1`]), HTTP/2 ([`h2`], [`hpack`]) and
//! HTTP/3 ([`h3`]) sit under a shared response [`pipeline`]. The [`server`]
//! module drives them from per-thread readiness loops, with every
//! connection's buffers carved from a bounded [`arena`].

#![forbid(unsafe_code)]

pub mod arena;
pub mod buf;
pub mod config;
pub mod error;
pub mod h2;
pub mod h3;
pub mod hpack;
pub mod http;
pub mod http1;
pub mod mux;
pub mod pipeline;
pub mod server;
pub mod service;
pub mod timer;
pub mod varint;

pub use config::WorkerConfig;
pub use error::Error;
pub use server::{Server, ServerHandle};
pub use service::Services;
