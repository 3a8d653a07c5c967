//! Health endpoint payload.

use std::time::Instant;

use serde_json::{json, Value};

/// Build the `/api/health` response.
#[must_use]
pub fn health_response(start_time: Instant, event_count: i64) -> Value {
    json!({
        "status": "ok",
        "uptime": start_time.elapsed().as_secs(),
        "eventCount": event_count,
    })
}
