//! Typed views over the dynamic `data` payload.
//!
//! The tracer ships many payload shapes discriminated by a `type` field.
//! Only the shapes the daemon inspects get a typed view here; everything
//! else passes through the store untouched.

use serde_json::Value;

/// Payload discriminators the daemon acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    LlmInput,
    LlmOutput,
    ToolCallStart,
    ToolCallEnd,
    ConfigChange,
    SetupFileChange,
    MessageReceived,
    MessageSent,
    ForkInfo,
    RewindExecuted,
    SessionStart,
    /// Anything else — stored verbatim, never interpreted.
    Other,
}

impl PayloadKind {
    /// Classify a payload by its `type` discriminator.
    #[must_use]
    pub fn of(data: &Value) -> Self {
        match payload_type(data) {
            Some("llm_input") => Self::LlmInput,
            Some("llm_output") => Self::LlmOutput,
            Some("tool_call_start") => Self::ToolCallStart,
            Some("tool_call_end") => Self::ToolCallEnd,
            Some("config_change") => Self::ConfigChange,
            Some("setup_file_change") => Self::SetupFileChange,
            Some("message_received") => Self::MessageReceived,
            Some("message_sent") => Self::MessageSent,
            Some("fork_info") => Self::ForkInfo,
            Some("rewind_executed") => Self::RewindExecuted,
            Some("session_start") => Self::SessionStart,
            _ => Self::Other,
        }
    }

    /// Whether this payload can carry an inline file snapshot.
    #[must_use]
    pub fn carries_snapshot(self) -> bool {
        matches!(
            self,
            Self::ToolCallStart | Self::ToolCallEnd | Self::ConfigChange | Self::SetupFileChange
        )
    }

    /// Whether this is a whole-file capture (before and after in one frame).
    #[must_use]
    pub fn is_whole_file_change(self) -> bool {
        matches!(self, Self::ConfigChange | Self::SetupFileChange)
    }
}

/// The `type` discriminator of a payload, if present.
#[must_use]
pub fn payload_type(data: &Value) -> Option<&str> {
    data.get("type")?.as_str()
}

/// Inline file-snapshot fields extracted from a tool or config payload.
///
/// Start frames carry the `before` side, end frames the `after` side, and
/// whole-file change frames both.
#[derive(Clone, Debug, Default)]
pub struct FileSnapshotView {
    pub file_path: String,
    pub tool_name: Option<String>,
    pub content_before: Option<String>,
    pub content_after: Option<String>,
    pub existed_before: Option<bool>,
    pub exists_after: Option<bool>,
}

impl FileSnapshotView {
    /// Extract the snapshot view from a payload.
    ///
    /// Returns `None` unless both `fileSnapshot` and a file path are present
    /// (the path may live on the payload or inside the snapshot object).
    #[must_use]
    pub fn extract(data: &Value) -> Option<Self> {
        let snap = data.get("fileSnapshot")?;
        let file_path = data
            .get("filePath")
            .and_then(Value::as_str)
            .or_else(|| snap.get("filePath").and_then(Value::as_str))?
            .to_string();

        Some(Self {
            file_path,
            tool_name: data.get("toolName").and_then(Value::as_str).map(String::from),
            content_before: snap
                .get("contentBefore")
                .and_then(Value::as_str)
                .map(String::from),
            content_after: snap
                .get("contentAfter")
                .and_then(Value::as_str)
                .map(String::from),
            existed_before: snap.get("existedBefore").and_then(Value::as_bool),
            exists_after: snap.get("existsAfter").and_then(Value::as_bool),
        })
    }
}

/// Fetch a string field from a payload.
#[must_use]
pub fn extract_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key)?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_known_types() {
        assert_eq!(
            PayloadKind::of(&json!({"type": "llm_input"})),
            PayloadKind::LlmInput
        );
        assert_eq!(
            PayloadKind::of(&json!({"type": "tool_call_end"})),
            PayloadKind::ToolCallEnd
        );
        assert_eq!(
            PayloadKind::of(&json!({"type": "something_new"})),
            PayloadKind::Other
        );
        assert_eq!(PayloadKind::of(&json!({})), PayloadKind::Other);
    }

    #[test]
    fn snapshot_carriers() {
        assert!(PayloadKind::ToolCallStart.carries_snapshot());
        assert!(PayloadKind::ConfigChange.carries_snapshot());
        assert!(!PayloadKind::LlmInput.carries_snapshot());
        assert!(PayloadKind::SetupFileChange.is_whole_file_change());
        assert!(!PayloadKind::ToolCallEnd.is_whole_file_change());
    }

    #[test]
    fn extract_start_snapshot() {
        let data = json!({
            "type": "tool_call_start",
            "toolName": "write",
            "filePath": "/tmp/a",
            "fileSnapshot": {"filePath": "/tmp/a", "contentBefore": "X", "existedBefore": true}
        });
        let view = FileSnapshotView::extract(&data).unwrap();
        assert_eq!(view.file_path, "/tmp/a");
        assert_eq!(view.tool_name.as_deref(), Some("write"));
        assert_eq!(view.content_before.as_deref(), Some("X"));
        assert_eq!(view.existed_before, Some(true));
        assert!(view.content_after.is_none());
    }

    #[test]
    fn extract_path_from_snapshot_object() {
        let data = json!({
            "type": "tool_call_end",
            "fileSnapshot": {"filePath": "/tmp/b", "contentAfter": "Y", "existsAfter": true}
        });
        let view = FileSnapshotView::extract(&data).unwrap();
        assert_eq!(view.file_path, "/tmp/b");
        assert_eq!(view.content_after.as_deref(), Some("Y"));
        assert_eq!(view.exists_after, Some(true));
    }

    #[test]
    fn extract_requires_snapshot_and_path() {
        assert!(FileSnapshotView::extract(&json!({"type": "tool_call_start"})).is_none());
        assert!(
            FileSnapshotView::extract(&json!({"type": "tool_call_start", "fileSnapshot": {}}))
                .is_none()
        );
    }
}
