//! # forked-server
//!
//! The daemon's two loopback listeners: the tracer push channel (WebSocket,
//! port 7999) and the HTTP/JSON API for the UI (port 8000), plus the
//! shutdown coordinator that ties every background task to one cancellation
//! token.

#![deny(unsafe_code)]

pub mod api;
pub mod health;
pub mod ingest_ws;
pub mod shutdown;

pub use api::ApiState;
pub use ingest_ws::IngestState;
pub use shutdown::ShutdownCoordinator;

/// Default bind address for the tracer push channel.
pub const DEFAULT_INGEST_ADDR: &str = "127.0.0.1:7999";
/// Default bind address for the HTTP API.
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
