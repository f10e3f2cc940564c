//! HTTP surface of a polystep engine.
//!
//! Serves state inspection and editing, external triggers, recorded traces
//! and collected logs. The server only binds to loopback addresses.

mod error;
mod http;
mod routes;

pub use error::ApiError;
pub use http::{PolystepHttpServer, RunningHttpServer, resolve_bind_address};
