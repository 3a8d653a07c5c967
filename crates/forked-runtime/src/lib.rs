//! # forked-runtime
//!
//! The daemon's engines: the ingest pipeline that turns tracer frames into
//! stored events with reconstructed lineage, the rewind engine that restores
//! snapshotted filesystem state, the fork engine that replays a run through
//! the gateway, and the retention sweeper.
//!
//! Shared mutable state (lineage maps, pending forks) is lock-bundled and
//! never held across I/O; long-running work (gateway conversations) runs as
//! cancellable tasks.

#![deny(unsafe_code)]

pub mod fork;
pub mod hint;
pub mod ingest;
pub mod lineage;
pub mod rewind;
pub mod sweeper;

pub use fork::{spawn_reaper, ForkEngine, ForkFailure, ForkOutcome, ForkRegistry, PendingFork};
pub use hint::{derive_hint, parse_address, session_channel, DeliveryHint};
pub use ingest::IngestPipeline;
pub use lineage::{LineageTracker, Resolution, RunLineage, DEFAULT_PROMOTION_THRESHOLD};
pub use rewind::{
    BackupEntry, FileResult, PlanEntry, RewindEngine, RewindError, RewindOutcome,
};
pub use sweeper::spawn_sweeper;
