//! # forked-core
//!
//! Shared event model for the Forked daemon: the [`Stream`] tag, the
//! [`TraceFrame`] wire format pushed by the tracer, and typed views over the
//! dynamic `data` payload.
//!
//! Payloads are deliberately kept as raw [`serde_json::Value`] alongside the
//! typed accessors so they round-trip through the store and the API without
//! loss. The `type` discriminator inside `data` drives interpretation.

#![deny(unsafe_code)]

pub mod frame;
pub mod payload;
pub mod stream;
pub mod time;

pub use frame::TraceFrame;
pub use payload::{payload_type, FileSnapshotView, PayloadKind};
pub use stream::Stream;
pub use time::now_ms;

/// Sentinel branch key for runs that belong to no explicit fork.
pub const MAIN_BRANCH: &str = "main";
