//! # forked-gateway
//!
//! Single-use, authenticated conversation with the external agent gateway
//! over a framed-JSON WebSocket: `connect` handshake (signed device
//! identity), then exactly one `agent` or `send` request, resolving on the
//! terminal response. Hard deadlines close the socket.

#![deny(unsafe_code)]

pub mod client;
pub mod errors;

pub use client::{agent_id_from_session_key, GatewayClient, ROLE, SCOPES};
pub use errors::{GatewayError, Result};
