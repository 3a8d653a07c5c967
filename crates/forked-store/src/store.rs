//! High-level [`TraceStore`] facade.
//!
//! Wraps the connection pool and repositories into the operations the
//! daemon's engines and API need. Multi-row writes (fork placeholders) run
//! inside a single transaction so readers never observe partial state.

use serde_json::Value;
use tracing::{debug, info};

use crate::errors::Result;
use crate::sqlite::connection::{self, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::sqlite::migrations::run_migrations;
use crate::sqlite::repositories::event::{EventRepo, NewEvent};
use crate::sqlite::repositories::snapshot::SnapshotRepo;
use crate::sqlite::row_types::{EventRow, SessionRow, SnapshotRow};

const MS_PER_DAY: i64 = 86_400_000;

/// Counts returned by a retention sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepCounts {
    pub events: usize,
    pub snapshots: usize,
}

/// The embedded trace store.
pub struct TraceStore {
    pool: ConnectionPool,
}

impl TraceStore {
    /// Open (or create) the store at `path` and run migrations.
    pub fn open(path: &str) -> Result<Self> {
        let pool = connection::new_file(path, &ConnectionConfig::default())?;
        let conn = pool.get()?;
        let _ = run_migrations(&conn)?;
        let pragmas = connection::verify_pragmas(&conn)?;
        debug!(
            journal_mode = %pragmas.journal_mode,
            foreign_keys = pragmas.foreign_keys_enabled,
            "store pragmas verified"
        );
        restrict_db_permissions(path);
        Ok(Self { pool })
    }

    /// Open an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = connection::new_in_memory()?;
        let conn = pool.get()?;
        let _ = run_migrations(&conn)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────

    /// Append one event; returns its row id.
    pub fn insert_event(&self, event: &NewEvent) -> Result<i64> {
        let conn = self.conn()?;
        EventRepo::insert(&conn, event)
    }

    /// Append several events atomically (fork placeholder writes).
    pub fn insert_events_atomic(&self, events: &[NewEvent]) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            ids.push(EventRepo::insert(&tx, event)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    /// One aggregate row per run, newest activity first.
    pub fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        let conn = self.conn()?;
        EventRepo::list_sessions(&conn)
    }

    /// Resolve `id` as a session key first, then as a run id, and return the
    /// matching timeline ordered by `(ts, seq)`.
    pub fn list_traces(&self, id: &str) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        if EventRepo::session_key_exists(&conn, id)? {
            return EventRepo::list_by_session_key(&conn, id);
        }
        EventRepo::list_by_run(&conn, id)
    }

    /// All events for a single run, ordered by `(ts, seq)`.
    pub fn list_events_by_run(&self, run_id: &str) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        EventRepo::list_by_run(&conn, run_id)
    }

    /// Count of events recorded for a run.
    pub fn count_events_for_run(&self, run_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        EventRepo::count_by_run(&conn, run_id)
    }

    /// Total events in the store.
    pub fn event_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        EventRepo::count(&conn)
    }

    /// Highest `seq` for a run.
    pub fn max_seq_for_run(&self, run_id: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        EventRepo::max_seq(&conn, run_id)
    }

    /// Most recent non-null session key recorded for a run.
    pub fn latest_session_key_for_run(&self, run_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        EventRepo::latest_session_key(&conn, run_id)
    }

    /// Whether the run carries a `fork_info` event.
    pub fn run_has_fork_info(&self, run_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        EventRepo::has_fork_info(&conn, run_id)
    }

    /// Back-fill the lineage stamp on every row of a run.
    pub fn stamp_fork_lineage(&self, run_id: &str, parent_run_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        EventRepo::stamp_fork_lineage(&conn, run_id, parent_run_id)
    }

    /// Distinct runs first seen at or after `cutoff_ms`.
    pub fn runs_created_after(
        &self,
        cutoff_ms: i64,
        session_key: Option<&str>,
        exclude: &[&str],
    ) -> Result<Vec<String>> {
        let conn = self.conn()?;
        EventRepo::runs_created_after(&conn, cutoff_ms, session_key, exclude)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────────────

    /// Open a snapshot row with a file's before-image.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_snapshot_start(
        &self,
        run_id: &str,
        seq: i64,
        tool_name: Option<&str>,
        file_path: &str,
        content_before: Option<&str>,
        existed_before: bool,
        created_at: i64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        SnapshotRepo::insert_start(
            &conn,
            run_id,
            seq,
            tool_name,
            file_path,
            content_before,
            existed_before,
            created_at,
        )
    }

    /// Complete the most recent open snapshot row for `(run_id, file_path)`.
    pub fn update_snapshot_end(
        &self,
        run_id: &str,
        file_path: &str,
        content_after: Option<&str>,
        exists_after: Option<bool>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        SnapshotRepo::update_end(&conn, run_id, file_path, content_after, exists_after)
    }

    /// Insert a complete before/after capture in one row.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_snapshot_whole_file(
        &self,
        run_id: &str,
        seq: i64,
        tool_name: Option<&str>,
        file_path: &str,
        content_before: Option<&str>,
        content_after: Option<&str>,
        existed_before: bool,
        exists_after: Option<bool>,
        created_at: i64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        SnapshotRepo::insert_whole_file(
            &conn,
            run_id,
            seq,
            tool_name,
            file_path,
            content_before,
            content_after,
            existed_before,
            exists_after,
            created_at,
        )
    }

    /// Resolve `id` as a session key first, then as a run id, and return the
    /// matching snapshots.
    pub fn list_snapshots(&self, id: &str) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn()?;
        if EventRepo::session_key_exists(&conn, id)? {
            return SnapshotRepo::list_by_session_key(&conn, id);
        }
        SnapshotRepo::list_by_run(&conn, id)
    }

    /// Snapshots for a run with `seq <= target_seq`, ascending.
    pub fn snapshots_up_to(&self, run_id: &str, target_seq: i64) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn()?;
        SnapshotRepo::list_up_to_seq(&conn, run_id, target_seq)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Retention
    // ─────────────────────────────────────────────────────────────────────

    /// Delete events and snapshots older than `days` days.
    pub fn delete_older_than(&self, days: u32, now_ms: i64) -> Result<SweepCounts> {
        let cutoff = now_ms - i64::from(days) * MS_PER_DAY;
        let conn = self.conn()?;
        let events = EventRepo::delete_older_than(&conn, cutoff)?;
        let snapshots = SnapshotRepo::delete_older_than(&conn, cutoff)?;
        if events > 0 || snapshots > 0 {
            info!(events, snapshots, days, "retention sweep deleted rows");
        }
        Ok(SweepCounts { events, snapshots })
    }
}

/// Serialize a payload for storage.
#[must_use]
pub fn payload_to_string(data: &Value) -> String {
    serde_json::to_string(data).unwrap_or_else(|_| "null".to_string())
}

#[cfg(unix)]
fn restrict_db_permissions(path: &str) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn restrict_db_permissions(_path: &str) {}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
