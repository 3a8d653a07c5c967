//! Event repository — append-only trace event log.
//!
//! Events are immutable once written, with one exception: the lineage stamp
//! (`is_fork`, `forked_from_run_id`) may be back-filled across a whole run
//! when the run is later identified as a fork child.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;
use crate::sqlite::row_types::{EventRow, SessionRow};

const EVENT_COLUMNS: &str = "id, run_id, session_key, seq, stream, ts, data, is_fork, forked_from_run_id, created_at";

/// A new event ready for insertion.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub run_id: String,
    pub session_key: Option<String>,
    pub seq: i64,
    pub stream: String,
    pub ts: i64,
    /// Serialized JSON payload.
    pub data: String,
    pub is_fork: bool,
    pub forked_from_run_id: Option<String>,
    pub created_at: i64,
}

/// Event repository — stateless, every method takes `&Connection`.
pub struct EventRepo;

impl EventRepo {
    /// Insert a single event; returns the new row id.
    pub fn insert(conn: &Connection, event: &NewEvent) -> Result<i64> {
        let _ = conn.execute(
            "INSERT INTO events (run_id, session_key, seq, stream, ts, data, is_fork, forked_from_run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.run_id,
                event.session_key,
                event.seq,
                event.stream,
                event.ts,
                event.data,
                event.is_fork,
                event.forked_from_run_id,
                event.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All events for one run, ordered by `(ts, seq)`.
    pub fn list_by_run(conn: &Connection, run_id: &str) -> Result<Vec<EventRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE run_id = ?1 ORDER BY ts ASC, seq ASC"
        ))?;
        let rows = stmt
            .query_map(params![run_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All events across every run sharing a session key, ordered by `(ts, seq)`.
    pub fn list_by_session_key(conn: &Connection, session_key: &str) -> Result<Vec<EventRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE session_key = ?1 ORDER BY ts ASC, seq ASC"
        ))?;
        let rows = stmt
            .query_map(params![session_key], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Whether any event carries the given session key.
    pub fn session_key_exists(conn: &Connection, session_key: &str) -> Result<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE session_key = ?1)",
            params![session_key],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Count events recorded for a run.
    pub fn count_by_run(conn: &Connection, run_id: &str) -> Result<i64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Total event count across all runs.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Highest `seq` recorded for a run, if any.
    pub fn max_seq(conn: &Connection, run_id: &str) -> Result<Option<i64>> {
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(seq) FROM events WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(max)
    }

    /// Most recent non-null session key recorded for a run.
    pub fn latest_session_key(conn: &Connection, run_id: &str) -> Result<Option<String>> {
        let key: Option<String> = conn
            .query_row(
                "SELECT session_key FROM events
                 WHERE run_id = ?1 AND session_key IS NOT NULL
                 ORDER BY ts DESC, seq DESC LIMIT 1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    /// Whether a run carries a `fork_info` event (i.e. is an explicit fork
    /// placeholder).
    pub fn has_fork_info(conn: &Connection, run_id: &str) -> Result<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE run_id = ?1 AND stream = 'fork_info')",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Back-fill the lineage stamp on every existing row of a run.
    ///
    /// Returns the number of rows updated.
    pub fn stamp_fork_lineage(conn: &Connection, run_id: &str, parent_run_id: &str) -> Result<usize> {
        let changed = conn.execute(
            "UPDATE events SET is_fork = 1, forked_from_run_id = ?2 WHERE run_id = ?1",
            params![run_id, parent_run_id],
        )?;
        Ok(changed)
    }

    /// Distinct run ids first observed at or after `cutoff_ms`, optionally
    /// restricted to one session key, excluding the given runs.
    ///
    /// Used by the fork engine's late-linkage scan.
    pub fn runs_created_after(
        conn: &Connection,
        cutoff_ms: i64,
        session_key: Option<&str>,
        exclude: &[&str],
    ) -> Result<Vec<String>> {
        let mut sql = String::from(
            "SELECT run_id FROM events GROUP BY run_id HAVING MIN(created_at) >= ?1",
        );
        if session_key.is_some() {
            sql.push_str(" AND MAX(session_key = ?2) = 1");
        }
        sql.push_str(" ORDER BY MIN(created_at) ASC");

        let mut stmt = conn.prepare(&sql)?;
        let runs: Vec<String> = match session_key {
            Some(key) => stmt
                .query_map(params![cutoff_ms, key], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![cutoff_ms], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        Ok(runs
            .into_iter()
            .filter(|r| !exclude.contains(&r.as_str()))
            .collect())
    }

    /// One aggregate row per run, newest activity first.
    ///
    /// The session key shown is the most recent non-null one for the run;
    /// `llm_input`/`llm_output` counts come from the JSON `type` field.
    pub fn list_sessions(conn: &Connection) -> Result<Vec<SessionRow>> {
        let mut stmt = conn.prepare(
            "SELECT e.run_id,
                    (SELECT e2.session_key FROM events e2
                      WHERE e2.run_id = e.run_id AND e2.session_key IS NOT NULL
                      ORDER BY e2.ts DESC, e2.seq DESC LIMIT 1),
                    MIN(e.ts),
                    MAX(e.ts),
                    COUNT(*),
                    SUM(CASE WHEN json_extract(e.data, '$.type') = 'llm_input' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN json_extract(e.data, '$.type') = 'llm_output' THEN 1 ELSE 0 END),
                    MAX(e.is_fork),
                    (SELECT e3.forked_from_run_id FROM events e3
                      WHERE e3.run_id = e.run_id AND e3.forked_from_run_id IS NOT NULL LIMIT 1)
             FROM events e
             GROUP BY e.run_id
             ORDER BY MAX(e.ts) DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SessionRow {
                    run_id: row.get(0)?,
                    session_key: row.get(1)?,
                    start_time: row.get(2)?,
                    last_activity: row.get(3)?,
                    event_count: row.get(4)?,
                    llm_input_count: row.get(5)?,
                    llm_output_count: row.get(6)?,
                    is_fork: row.get::<_, i64>(7)? != 0,
                    forked_from_run_id: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete events older than `cutoff_ms`; returns rows removed.
    pub fn delete_older_than(conn: &Connection, cutoff_ms: i64) -> Result<usize> {
        let changed = conn.execute(
            "DELETE FROM events WHERE created_at < ?1",
            params![cutoff_ms],
        )?;
        Ok(changed)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
        Ok(EventRow {
            id: row.get(0)?,
            run_id: row.get(1)?,
            session_key: row.get(2)?,
            seq: row.get(3)?,
            stream: row.get(4)?,
            ts: row.get(5)?,
            data: row.get(6)?,
            is_fork: row.get::<_, i64>(7)? != 0,
            forked_from_run_id: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
