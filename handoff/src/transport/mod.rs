//! Transport layer for handoff.
//!
//! HTTP via axum: the master status endpoint, worker self-diagnostics, and a bundled
//! application server.

pub mod http;

pub use http::{HttpServer, serve};
