//! Row structs mapped from `SQLite` query results.

use serde::Serialize;
use serde_json::Value;

/// A stored trace event.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub id: i64,
    pub run_id: String,
    pub session_key: Option<String>,
    pub seq: i64,
    pub stream: String,
    pub ts: i64,
    /// Raw JSON payload text, exactly as ingested.
    pub data: String,
    pub is_fork: bool,
    pub forked_from_run_id: Option<String>,
    pub created_at: i64,
}

impl EventRow {
    /// Parse the payload text back into a JSON value.
    ///
    /// Stored payloads were serialized by us, so a parse failure means the
    /// row was tampered with; fall back to null rather than erroring a whole
    /// timeline read.
    #[must_use]
    pub fn data_value(&self) -> Value {
        serde_json::from_str(&self.data).unwrap_or(Value::Null)
    }
}

/// A stored file snapshot (before/after capture of one file).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRow {
    pub id: i64,
    pub run_id: String,
    pub seq: i64,
    pub tool_name: Option<String>,
    pub file_path: String,
    pub content_before: Option<String>,
    pub content_after: Option<String>,
    pub existed_before: bool,
    pub exists_after: Option<bool>,
    pub created_at: i64,
}

/// One aggregate row per run, for the sessions listing.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub run_id: String,
    pub session_key: Option<String>,
    pub start_time: i64,
    pub last_activity: i64,
    pub event_count: i64,
    pub llm_input_count: i64,
    pub llm_output_count: i64,
    pub is_fork: bool,
    pub forked_from_run_id: Option<String>,
}
