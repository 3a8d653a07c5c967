//! The wire frame pushed by the tracer over the loopback channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::Stream;

/// One observation as emitted by the tracer plugin inside the Gateway.
///
/// `run_id` may arrive as the literal `"unknown"` for background filesystem
/// events; the ingest pipeline synthesizes a `bg_*` run id for those. `data`
/// is kept opaque — its `type` field discriminates the payload shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceFrame {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    pub seq: i64,
    pub stream: Stream,
    /// Wall-clock millisecond timestamp assigned by the tracer.
    pub ts: i64,
    #[serde(default)]
    pub data: Value,
}

impl TraceFrame {
    /// Parse a single frame from its JSON text.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Whether the frame arrived without a usable run id.
    #[must_use]
    pub fn run_id_missing(&self) -> bool {
        match self.run_id.as_deref() {
            None | Some("") | Some("unknown") => true,
            Some(_) => false,
        }
    }
}
