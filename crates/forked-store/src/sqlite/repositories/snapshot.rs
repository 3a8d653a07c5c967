//! File-snapshot repository.
//!
//! A snapshot row is opened by a `tool_call_start` frame (before-image) and
//! completed by the matching `tool_call_end` frame (after-image). Config and
//! setup-file changes capture both sides in a single row.

use rusqlite::{params, Connection};

use crate::errors::Result;
use crate::sqlite::row_types::SnapshotRow;

const SNAPSHOT_COLUMNS: &str = "id, run_id, seq, tool_name, file_path, content_before, content_after, existed_before, exists_after, created_at";

/// Snapshot bodies above this size are cut and marked.
const MAX_CONTENT_BYTES: usize = 512 * 1024;

/// Marker appended to truncated snapshot bodies. Not reversible.
pub const TRUNCATED_MARKER: &str = "[TRUNCATED]";

/// Snapshot repository — stateless, every method takes `&Connection`.
pub struct SnapshotRepo;

impl SnapshotRepo {
    /// Open a snapshot row with the before-image of a file.
    pub fn insert_start(
        conn: &Connection,
        run_id: &str,
        seq: i64,
        tool_name: Option<&str>,
        file_path: &str,
        content_before: Option<&str>,
        existed_before: bool,
        created_at: i64,
    ) -> Result<i64> {
        let _ = conn.execute(
            "INSERT INTO file_snapshots (run_id, seq, tool_name, file_path, content_before, existed_before, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                seq,
                tool_name,
                file_path,
                content_before.map(truncate_content),
                existed_before,
                created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fill the after-image on the most recent open row for `(run_id, file_path)`.
    ///
    /// Returns `false` when no open row exists (the end frame arrived
    /// without a matching start).
    pub fn update_end(
        conn: &Connection,
        run_id: &str,
        file_path: &str,
        content_after: Option<&str>,
        exists_after: Option<bool>,
    ) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE file_snapshots
             SET content_after = ?3, exists_after = ?4
             WHERE id = (SELECT id FROM file_snapshots
                          WHERE run_id = ?1 AND file_path = ?2 AND content_after IS NULL
                          ORDER BY id DESC LIMIT 1)",
            params![
                run_id,
                file_path,
                content_after.map(truncate_content),
                exists_after,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Insert a complete before/after capture in one row.
    pub fn insert_whole_file(
        conn: &Connection,
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
        let _ = conn.execute(
            "INSERT INTO file_snapshots (run_id, seq, tool_name, file_path, content_before, content_after, existed_before, exists_after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_id,
                seq,
                tool_name,
                file_path,
                content_before.map(truncate_content),
                content_after.map(truncate_content),
                existed_before,
                exists_after,
                created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All snapshots for a run, ordered by `seq`.
    pub fn list_by_run(conn: &Connection, run_id: &str) -> Result<Vec<SnapshotRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM file_snapshots WHERE run_id = ?1 ORDER BY seq ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![run_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Snapshots for every run sharing a session key, ordered by `seq`.
    pub fn list_by_session_key(conn: &Connection, session_key: &str) -> Result<Vec<SnapshotRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM file_snapshots
             WHERE run_id IN (SELECT DISTINCT run_id FROM events WHERE session_key = ?1)
             ORDER BY seq ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![session_key], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Snapshots for a run with `seq <= target_seq`, ordered by `seq` ascending.
    pub fn list_up_to_seq(
        conn: &Connection,
        run_id: &str,
        target_seq: i64,
    ) -> Result<Vec<SnapshotRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM file_snapshots
             WHERE run_id = ?1 AND seq <= ?2 ORDER BY seq ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![run_id, target_seq], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete snapshots older than `cutoff_ms`; returns rows removed.
    pub fn delete_older_than(conn: &Connection, cutoff_ms: i64) -> Result<usize> {
        let changed = conn.execute(
            "DELETE FROM file_snapshots WHERE created_at < ?1",
            params![cutoff_ms],
        )?;
        Ok(changed)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
        Ok(SnapshotRow {
            id: row.get(0)?,
            run_id: row.get(1)?,
            seq: row.get(2)?,
            tool_name: row.get(3)?,
            file_path: row.get(4)?,
            content_before: row.get(5)?,
            content_after: row.get(6)?,
            existed_before: row.get::<_, i64>(7)? != 0,
            exists_after: row.get::<_, Option<i64>>(8)?.map(|v| v != 0),
            created_at: row.get(9)?,
        })
    }
}

/// Cap a snapshot body, appending the truncation marker when cut.
fn truncate_content(content: &str) -> String {
    if content.len() <= MAX_CONTENT_BYTES {
        return content.to_string();
    }
    // Cut on a char boundary at or below the cap.
    let mut end = MAX_CONTENT_BYTES;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATED_MARKER}", &content[..end])
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results, clippy::too_many_arguments)]
mod tests {
    use super::*;
    use crate::sqlite::migrations::run_migrations;
    use crate::sqlite::repositories::event::{EventRepo, NewEvent};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn start_then_end_completes_row() {
        let conn = setup();
        SnapshotRepo::insert_start(&conn, "R1", 5, Some("write"), "/tmp/a", Some("X"), true, 1000)
            .unwrap();
        let matched =
            SnapshotRepo::update_end(&conn, "R1", "/tmp/a", Some("Y"), Some(true)).unwrap();
        assert!(matched);

        let rows = SnapshotRepo::list_by_run(&conn, "R1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content_before.as_deref(), Some("X"));
        assert_eq!(rows[0].content_after.as_deref(), Some("Y"));
        assert!(rows[0].existed_before);
        assert_eq!(rows[0].exists_after, Some(true));
    }

    #[test]
    fn update_end_targets_newest_open_row() {
        let conn = setup();
        SnapshotRepo::insert_start(&conn, "R1", 1, Some("write"), "/tmp/a", Some("A"), true, 1000)
            .unwrap();
        SnapshotRepo::update_end(&conn, "R1", "/tmp/a", Some("B"), Some(true)).unwrap();
        SnapshotRepo::insert_start(&conn, "R1", 3, Some("write"), "/tmp/a", Some("B"), true, 1100)
            .unwrap();
        SnapshotRepo::update_end(&conn, "R1", "/tmp/a", Some("C"), Some(true)).unwrap();

        let rows = SnapshotRepo::list_by_run(&conn, "R1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content_after.as_deref(), Some("B"));
        assert_eq!(rows[1].content_after.as_deref(), Some("C"));
    }

    #[test]
    fn update_end_without_start_is_noop() {
        let conn = setup();
        let matched =
            SnapshotRepo::update_end(&conn, "R1", "/tmp/missing", Some("Y"), None).unwrap();
        assert!(!matched);
    }

    #[test]
    fn whole_file_row_is_complete() {
        let conn = setup();
        SnapshotRepo::insert_whole_file(
            &conn,
            "R1",
            7,
            None,
            "/tmp/cfg.json",
            Some("{}"),
            Some("{\"a\":1}"),
            true,
            Some(true),
            1000,
        )
        .unwrap();

        let rows = SnapshotRepo::list_by_run(&conn, "R1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content_before.as_deref(), Some("{}"));
        assert_eq!(rows[0].content_after.as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn list_by_session_key_resolves_via_events() {
        let conn = setup();
        EventRepo::insert(
            &conn,
            &NewEvent {
                run_id: "R1".into(),
                session_key: Some("S".into()),
                seq: 1,
                stream: "tool".into(),
                ts: 1000,
                data: "{}".into(),
                is_fork: false,
                forked_from_run_id: None,
                created_at: 1000,
            },
        )
        .unwrap();
        SnapshotRepo::insert_start(&conn, "R1", 1, Some("write"), "/tmp/a", None, false, 1000)
            .unwrap();
        SnapshotRepo::insert_start(&conn, "R2", 1, Some("write"), "/tmp/b", None, false, 1000)
            .unwrap();

        let rows = SnapshotRepo::list_by_session_key(&conn, "S").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].file_path, "/tmp/a");
    }

    #[test]
    fn list_up_to_seq_filters() {
        let conn = setup();
        SnapshotRepo::insert_start(&conn, "R1", 2, None, "/tmp/a", Some("A"), true, 1000).unwrap();
        SnapshotRepo::insert_start(&conn, "R1", 9, None, "/tmp/b", Some("B"), true, 1100).unwrap();

        let rows = SnapshotRepo::list_up_to_seq(&conn, "R1", 5).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].file_path, "/tmp/a");
    }

    #[test]
    fn delete_older_than_removes_rows() {
        let conn = setup();
        SnapshotRepo::insert_start(&conn, "R1", 1, None, "/tmp/a", None, false, 100).unwrap();
        SnapshotRepo::insert_start(&conn, "R1", 2, None, "/tmp/b", None, false, 9000).unwrap();

        let deleted = SnapshotRepo::delete_older_than(&conn, 5000).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(SnapshotRepo::list_by_run(&conn, "R1").unwrap().len(), 1);
    }

    #[test]
    fn oversized_content_is_truncated() {
        let conn = setup();
        let big = "x".repeat(MAX_CONTENT_BYTES + 100);
        SnapshotRepo::insert_start(&conn, "R1", 1, None, "/tmp/big", Some(&big), true, 1000)
            .unwrap();

        let rows = SnapshotRepo::list_by_run(&conn, "R1").unwrap();
        let stored = rows[0].content_before.as_deref().unwrap();
        assert!(stored.ends_with(TRUNCATED_MARKER));
        assert!(stored.len() < big.len());
    }

    #[test]
    fn small_content_untouched() {
        assert_eq!(truncate_content("hello"), "hello");
    }
}
