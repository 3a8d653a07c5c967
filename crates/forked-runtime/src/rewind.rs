//! Filesystem rewind.
//!
//! Rewinding a run to a target sequence restores every touched file to the
//! state captured by the *earliest* snapshot at or below that sequence —
//! that before-image is what the file looked like before the run got to it.
//! Current contents are backed up first; backups travel in the audit event
//! for manual recovery.
//!
//! Atomicity is per file: one failed write does not abort the others, and
//! the call reports success when at least one file was restored.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use forked_core::{now_ms, Stream};
use forked_store::{payload_to_string, NewEvent, SnapshotRow, StoreError, TraceStore};

/// Errors that fail a rewind outright (per-file errors do not).
#[derive(Debug, Error)]
pub enum RewindError {
    /// No snapshots exist at or below the target sequence.
    #[error("No file snapshots found for run {run_id} up to seq {target_seq}")]
    NoSnapshots { run_id: String, target_seq: i64 },

    /// Store failure while planning or auditing.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Convenience alias for rewind results.
pub type Result<T> = std::result::Result<T, RewindError>;

/// What the rewind would do to one file.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub file_path: String,
    pub original_existed: bool,
    /// `restore` or `delete`.
    pub action: &'static str,
}

/// Result of applying the plan to one file.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub file_path: String,
    /// `restored`, `deleted`, or `already_absent`.
    pub action: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pre-rewind capture of one file's current state.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub file_path: String,
    pub content: Option<String>,
    pub existed: bool,
}

/// Outcome of an executed rewind.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindOutcome {
    pub success: bool,
    pub backup_id: String,
    pub files_affected: usize,
    pub results: Vec<FileResult>,
    pub backups: Vec<BackupEntry>,
}

/// The rewind engine.
pub struct RewindEngine {
    store: Arc<TraceStore>,
}

impl RewindEngine {
    pub fn new(store: Arc<TraceStore>) -> Self {
        Self { store }
    }

    /// Compute the restore/delete plan without touching the filesystem.
    pub fn preview(&self, run_id: &str, target_seq: i64) -> Result<Vec<PlanEntry>> {
        let snapshots = self.earliest_per_file(run_id, target_seq)?;
        Ok(snapshots
            .iter()
            .map(|snap| PlanEntry {
                file_path: snap.file_path.clone(),
                original_existed: snap.existed_before,
                action: if snap.existed_before { "restore" } else { "delete" },
            })
            .collect())
    }

    /// Execute the rewind: back up current contents, then restore or delete
    /// each file. Appends a `rewind` audit event on completion.
    pub fn execute(&self, run_id: &str, target_seq: i64) -> Result<RewindOutcome> {
        let snapshots = self.earliest_per_file(run_id, target_seq)?;

        let backup_id = format!("rewind_{}", now_ms());
        let mut backups = Vec::with_capacity(snapshots.len());
        for snap in &snapshots {
            backups.push(capture_backup(&snap.file_path));
        }

        let mut results = Vec::with_capacity(snapshots.len());
        for snap in &snapshots {
            results.push(apply_snapshot(snap));
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let outcome = RewindOutcome {
            success: succeeded > 0,
            backup_id,
            files_affected: succeeded,
            results,
            backups,
        };

        self.append_audit_event(run_id, target_seq, &outcome)?;
        info!(
            run_id,
            target_seq,
            files = outcome.files_affected,
            backup_id = %outcome.backup_id,
            "rewind executed"
        );
        Ok(outcome)
    }

    /// Earliest snapshot per distinct file path with `seq <= target_seq`.
    fn earliest_per_file(&self, run_id: &str, target_seq: i64) -> Result<Vec<SnapshotRow>> {
        let all = self.store.snapshots_up_to(run_id, target_seq)?;
        if all.is_empty() {
            return Err(RewindError::NoSnapshots {
                run_id: run_id.to_string(),
                target_seq,
            });
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut earliest = Vec::new();
        for snap in all {
            if seen.insert(snap.file_path.clone()) {
                earliest.push(snap);
            }
        }
        Ok(earliest)
    }

    fn append_audit_event(
        &self,
        run_id: &str,
        target_seq: i64,
        outcome: &RewindOutcome,
    ) -> Result<()> {
        let seq = self.store.max_seq_for_run(run_id)?.unwrap_or(0) + 1;
        let session_key = self.store.latest_session_key_for_run(run_id)?;
        let now = now_ms();
        let data = json!({
            "type": "rewind_executed",
            "runId": run_id,
            "targetSeq": target_seq,
            "backupId": outcome.backup_id,
            "filesAffected": outcome.files_affected,
            "results": outcome.results,
            "backups": outcome.backups,
        });
        let _ = self.store.insert_event(&NewEvent {
            run_id: run_id.to_string(),
            session_key,
            seq,
            stream: Stream::Rewind.as_str().to_string(),
            ts: now,
            data: payload_to_string(&data),
            is_fork: false,
            forked_from_run_id: None,
            created_at: now,
        })?;
        Ok(())
    }
}

fn capture_backup(file_path: &str) -> BackupEntry {
    match std::fs::read_to_string(file_path) {
        Ok(content) => BackupEntry {
            file_path: file_path.to_string(),
            content: Some(content),
            existed: true,
        },
        Err(_) => BackupEntry {
            file_path: file_path.to_string(),
            content: None,
            existed: Path::new(file_path).exists(),
        },
    }
}

fn apply_snapshot(snap: &SnapshotRow) -> FileResult {
    let path = Path::new(&snap.file_path);

    if !snap.existed_before {
        if path.exists() {
            return match std::fs::remove_file(path) {
                Ok(()) => FileResult {
                    file_path: snap.file_path.clone(),
                    action: "deleted",
                    success: true,
                    error: None,
                },
                Err(e) => {
                    warn!(file = %snap.file_path, error = %e, "rewind delete failed");
                    FileResult {
                        file_path: snap.file_path.clone(),
                        action: "deleted",
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };
        }
        return FileResult {
            file_path: snap.file_path.clone(),
            action: "already_absent",
            success: true,
            error: None,
        };
    }

    let content = snap.content_before.as_deref().unwrap_or("");
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    };
    match write() {
        Ok(()) => FileResult {
            file_path: snap.file_path.clone(),
            action: "restored",
            success: true,
            error: None,
        },
        Err(e) => {
            warn!(file = %snap.file_path, error = %e, "rewind restore failed");
            FileResult {
                file_path: snap.file_path.clone(),
                action: "restored",
                success: false,
                error: Some(e.to_string()),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;

    fn setup() -> (Arc<TraceStore>, RewindEngine, tempfile::TempDir) {
        let store = Arc::new(TraceStore::in_memory().unwrap());
        let engine = RewindEngine::new(store.clone());
        let dir = tempfile::tempdir().unwrap();
        (store, engine, dir)
    }

    fn file_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn no_snapshots_is_an_error() {
        let (_store, engine, _dir) = setup();
        let err = engine.execute("R1", 0).unwrap_err();
        assert!(matches!(err, RewindError::NoSnapshots { .. }));
        assert!(err.to_string().contains("No file snapshots"));
    }

    #[test]
    fn preview_uses_earliest_snapshot_per_file() {
        let (store, engine, dir) = setup();
        let path = file_path(&dir, "a.txt");
        // Two snapshots of the same file; the earliest wins.
        store
            .insert_snapshot_start("R1", 2, Some("write"), &path, Some("first"), true, 1000)
            .unwrap();
        store
            .insert_snapshot_start("R1", 8, Some("write"), &path, Some("later"), true, 1100)
            .unwrap();

        let plan = engine.preview("R1", 99).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].action, "restore");
        assert!(plan[0].original_existed);
    }

    #[test]
    fn preview_ignores_snapshots_past_target() {
        let (store, engine, dir) = setup();
        store
            .insert_snapshot_start("R1", 50, None, &file_path(&dir, "late.txt"), Some("x"), true, 1000)
            .unwrap();
        let err = engine.preview("R1", 10).unwrap_err();
        assert!(matches!(err, RewindError::NoSnapshots { .. }));
    }

    #[test]
    fn execute_restores_content_and_audits() {
        let (store, engine, dir) = setup();
        let path = file_path(&dir, "a.txt");
        std::fs::write(&path, "Y").unwrap();
        store
            .insert_snapshot_start("R1", 3, Some("write"), &path, Some("X"), true, 1000)
            .unwrap();
        store
            .insert_event(&NewEvent {
                run_id: "R1".into(),
                session_key: Some("S".into()),
                seq: 3,
                stream: "tool".into(),
                ts: 1000,
                data: "{}".into(),
                is_fork: false,
                forked_from_run_id: None,
                created_at: 1000,
            })
            .unwrap();

        let outcome = engine.execute("R1", 99).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.files_affected, 1);
        assert_eq!(outcome.results[0].action, "restored");
        assert!(outcome.results[0].success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "X");

        // Backup captured the pre-rewind content.
        assert_eq!(outcome.backups[0].content.as_deref(), Some("Y"));
        assert!(outcome.backups[0].existed);
        assert!(outcome.backup_id.starts_with("rewind_"));

        // Audit event landed on the run's rewind stream.
        let events = store.list_events_by_run("R1").unwrap();
        let audit = events.iter().find(|e| e.stream == "rewind").unwrap();
        let data = audit.data_value();
        assert_eq!(data["type"], "rewind_executed");
        assert_eq!(data["backupId"], outcome.backup_id.as_str());
        assert_eq!(audit.seq, 4);
    }

    #[test]
    fn execute_deletes_files_that_did_not_exist() {
        let (store, engine, dir) = setup();
        let path = file_path(&dir, "new.txt");
        std::fs::write(&path, "created by the run").unwrap();
        store
            .insert_snapshot_start("R1", 1, Some("write"), &path, None, false, 1000)
            .unwrap();

        let outcome = engine.execute("R1", 10).unwrap();
        assert_eq!(outcome.results[0].action, "deleted");
        assert!(outcome.results[0].success);
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn absent_file_reports_already_absent() {
        let (store, engine, dir) = setup();
        let path = file_path(&dir, "never-created.txt");
        store
            .insert_snapshot_start("R1", 1, None, &path, None, false, 1000)
            .unwrap();

        let outcome = engine.execute("R1", 10).unwrap();
        assert_eq!(outcome.results[0].action, "already_absent");
        assert!(outcome.results[0].success);
    }

    #[test]
    fn null_content_before_restores_empty_file() {
        let (store, engine, dir) = setup();
        let path = file_path(&dir, "emptied.txt");
        std::fs::write(&path, "junk").unwrap();
        store
            .insert_snapshot_start("R1", 1, None, &path, None, true, 1000)
            .unwrap();

        let outcome = engine.execute("R1", 10).unwrap();
        assert!(outcome.success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn restore_creates_missing_parent_dirs() {
        let (store, engine, dir) = setup();
        let path = dir
            .path()
            .join("deep/nested/file.txt")
            .to_string_lossy()
            .into_owned();
        store
            .insert_snapshot_start("R1", 1, None, &path, Some("body"), true, 1000)
            .unwrap();

        let outcome = engine.execute("R1", 10).unwrap();
        assert!(outcome.success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "body");
    }

    #[test]
    fn preview_and_execute_cover_same_files() {
        let (store, engine, dir) = setup();
        let a = file_path(&dir, "a.txt");
        let b = file_path(&dir, "b.txt");
        std::fs::write(&a, "1").unwrap();
        store
            .insert_snapshot_start("R1", 1, None, &a, Some("0"), true, 1000)
            .unwrap();
        store
            .insert_snapshot_start("R1", 2, None, &b, None, false, 1000)
            .unwrap();

        let plan = engine.preview("R1", 10).unwrap();
        let outcome = engine.execute("R1", 10).unwrap();
        assert_eq!(plan.len(), outcome.results.len());
    }
}
