//! # forked-store
//!
//! Embedded `SQLite` store for trace events and file snapshots.
//!
//! Layout follows a pooled-connection + stateless-repository split: the
//! [`TraceStore`] facade owns an `r2d2` pool, and repositories
//! ([`EventRepo`], [`SnapshotRepo`]) expose the raw operations against a
//! borrowed connection. Migrations are embedded and idempotent.
//!
//! [`EventRepo`]: sqlite::repositories::event::EventRepo
//! [`SnapshotRepo`]: sqlite::repositories::snapshot::SnapshotRepo

#![deny(unsafe_code)]

pub mod errors;
pub mod sqlite;
pub mod store;

pub use errors::{Result, StoreError};
pub use sqlite::repositories::event::NewEvent;
pub use sqlite::repositories::snapshot::TRUNCATED_MARKER;
pub use sqlite::row_types::{EventRow, SessionRow, SnapshotRow};
pub use store::{payload_to_string, SweepCounts, TraceStore};
