//! Schema setup for the trace database.
//!
//! The whole schema lives in one embedded SQL file and installs inside a
//! single transaction. A small `schema_version` table remembers what a
//! database already has: reopening an existing store is a no-op, and a
//! future schema bump gets a place to hang its upgrade off.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::errors::{Result, StoreError};

/// The schema version this build expects.
const SCHEMA_VERSION: u32 = 1;
const SCHEMA_DESCRIPTION: &str = "events + file_snapshots";
const SCHEMA_SQL: &str = include_str!("v001_schema.sql");

/// Bring the database up to [`SCHEMA_VERSION`].
///
/// Returns how many installs ran (0 when the file is already current).
///
/// # Errors
///
/// Returns [`StoreError::Migration`] if any step fails; the transactional
/// install leaves no partial schema behind.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
           version     INTEGER PRIMARY KEY,
           applied_at  TEXT    NOT NULL,
           description TEXT
         );",
    )
    .map_err(|e| schema_error("create schema_version", &e))?;

    if current_version(conn)? >= SCHEMA_VERSION {
        debug!(version = SCHEMA_VERSION, "schema already current");
        return Ok(0);
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| schema_error("begin install", &e))?;
    tx.execute_batch(SCHEMA_SQL)
        .map_err(|e| schema_error("install schema", &e))?;
    let _ = tx
        .execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, datetime('now'), ?2)",
            params![SCHEMA_VERSION, SCHEMA_DESCRIPTION],
        )
        .map_err(|e| schema_error("record version", &e))?;
    tx.commit().map_err(|e| schema_error("commit install", &e))?;

    info!(version = SCHEMA_VERSION, "schema installed");
    Ok(1)
}

/// Highest schema version the database carries, or 0 for a fresh file.
pub fn current_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| schema_error("read schema_version", &e))?
        .flatten();
    Ok(version.unwrap_or(0))
}

fn schema_error(step: &str, cause: &rusqlite::Error) -> StoreError {
    StoreError::Migration {
        message: format!("{step}: {cause}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;

    fn open_memory() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn install_creates_tables() {
        let conn = open_memory();
        let applied = run_migrations(&conn).unwrap();
        assert_eq!(applied, 1);

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in ["events", "file_snapshots", "schema_version"] {
            assert!(tables.contains(&table.to_string()), "missing table: {table}");
        }
    }

    #[test]
    fn reinstall_is_a_noop() {
        let conn = open_memory();
        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert_eq!(run_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn fresh_database_reports_version_zero() {
        let conn = open_memory();
        conn.execute_batch(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL, description TEXT);",
        )
        .unwrap();
        assert_eq!(current_version(&conn).unwrap(), 0);
    }

    #[test]
    fn installed_database_reports_current_version() {
        let conn = open_memory();
        run_migrations(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 1);
    }

    #[test]
    fn version_row_records_description() {
        let conn = open_memory();
        run_migrations(&conn).unwrap();

        let description: String = conn
            .query_row(
                "SELECT description FROM schema_version WHERE version = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(description.contains("events"));
    }

    #[test]
    fn indexes_are_created() {
        let conn = open_memory();
        run_migrations(&conn).unwrap();

        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for idx in [
            "idx_events_run",
            "idx_events_session",
            "idx_events_created",
            "idx_snapshots_run_seq",
            "idx_snapshots_created",
        ] {
            assert!(indexes.contains(&idx.to_string()), "missing index: {idx}");
        }
    }

    #[test]
    fn events_table_has_expected_columns() {
        let conn = open_memory();
        run_migrations(&conn).unwrap();

        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(events)")
            .unwrap()
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for col in [
            "id",
            "run_id",
            "session_key",
            "seq",
            "stream",
            "ts",
            "data",
            "is_fork",
            "forked_from_run_id",
            "created_at",
        ] {
            assert!(columns.contains(&col.to_string()), "missing column: {col}");
        }
    }
}
