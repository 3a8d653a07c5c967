//! The loopback HTTP/JSON API consumed by the UI.
//!
//! A thin shell over the store and engines: no auth beyond the loopback
//! bind, CORS restricted to localhost origins, GET/POST only.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use forked_runtime::{ForkEngine, ForkFailure, LineageTracker, RewindEngine, RewindError};
use forked_settings::{sanitize_config, Settings};
use forked_store::{StoreError, TraceStore};

use crate::health::health_response;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<TraceStore>,
    pub lineage: Arc<LineageTracker>,
    pub rewind: Arc<RewindEngine>,
    pub fork: Arc<ForkEngine>,
    pub settings: Arc<Settings>,
    pub start_time: Instant,
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/config", get(get_config))
        .route("/api/openclaw-config", get(get_openclaw_config))
        .route("/api/sessions", get(get_sessions))
        .route("/api/traces/{id}", get(get_traces))
        .route("/api/snapshots/{id}", get(get_snapshots))
        .route("/api/rewind/preview/{run_id}/{seq}", get(get_rewind_preview))
        .route("/api/rewind", post(post_rewind))
        .route("/api/fork", post(post_fork))
        .with_state(state)
        .layer(localhost_cors())
        .layer(RequestBodyLimitLayer::new(4 * 1024 * 1024))
}

/// Bind the API on `addr` and serve until the token cancels.
pub async fn serve(
    state: ApiState,
    addr: &str,
    cancel: CancellationToken,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    info!(addr = %bound_addr, "api server started");

    let app = router(state);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;
        info!("api server stopped");
    });
    Ok((bound_addr, handle))
}

/// CORS limited to localhost-origin pages.
fn localhost_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| {
                    o.starts_with("http://localhost") || o.starts_with("http://127.0.0.1")
                })
                .unwrap_or(false)
        }))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

// ─────────────────────────────────────────────────────────────────────────────
// Error mapping
// ─────────────────────────────────────────────────────────────────────────────

/// API-level error → JSON body with a status code.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({"success": false, "message": self.message}));
        (self.status, body).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<ApiState>) -> Json<Value> {
    let event_count = state.store.event_count().unwrap_or(0);
    Json(health_response(state.start_time, event_count))
}

async fn get_config(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({"retentionDays": state.settings.retention.to_value()}))
}

async fn get_openclaw_config(State(state): State<ApiState>) -> Json<Value> {
    match &state.settings.raw_host_config {
        Some(config) => Json(json!({"ok": true, "config": sanitize_config(config)})),
        None => {
            let error = state
                .settings
                .host_config_error
                .clone()
                .unwrap_or_else(|| "config unavailable".to_string());
            Json(json!({"ok": false, "error": error}))
        }
    }
}

async fn get_sessions(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let sessions = state.store.list_sessions()?;
    Ok(Json(serde_json::to_value(sessions).unwrap_or_default()))
}

async fn get_traces(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let events = state.store.list_traces(&id)?;
    let body: Vec<Value> = events
        .iter()
        .map(|event| {
            json!({
                "id": event.id,
                "runId": event.run_id,
                "sessionKey": event.session_key,
                "seq": event.seq,
                "stream": event.stream,
                "ts": event.ts,
                "data": event.data_value(),
                "isFork": event.is_fork,
                "forkedFromRunId": event.forked_from_run_id,
                "branchKey": state.lineage.branch_key(&event.run_id),
            })
        })
        .collect();
    Ok(Json(Value::Array(body)))
}

async fn get_snapshots(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshots = state.store.list_snapshots(&id)?;
    Ok(Json(serde_json::to_value(snapshots).unwrap_or_default()))
}

async fn get_rewind_preview(
    State(state): State<ApiState>,
    Path((run_id, seq)): Path<(String, i64)>,
) -> Result<Json<Value>, ApiError> {
    match state.rewind.preview(&run_id, seq) {
        Ok(files) => Ok(Json(json!({
            "runId": run_id,
            "targetSeq": seq,
            "files": files,
        }))),
        Err(RewindError::NoSnapshots { .. }) => Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("No file snapshots found for run {run_id}"),
        }),
        Err(RewindError::Store(e)) => Err(e.into()),
    }
}

async fn post_rewind(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let run_id = body
        .get("runId")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("runId is required"))?;
    let target_seq = body
        .get("targetSeq")
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::bad_request("targetSeq is required"))?;

    match state.rewind.execute(run_id, target_seq) {
        Ok(outcome) => Ok(Json(json!({
            "success": outcome.success,
            "backupId": outcome.backup_id,
            "filesAffected": outcome.files_affected,
            "results": outcome.results,
        }))),
        Err(err @ RewindError::NoSnapshots { .. }) => Ok(Json(json!({
            "success": false,
            "message": err.to_string(),
        }))),
        Err(RewindError::Store(e)) => Err(e.into()),
    }
}

async fn post_fork(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let origin_run_id = body
        .get("originalRunId")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("originalRunId is required"))?;
    let fork_from_seq = body
        .get("forkFromSeq")
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::bad_request("forkFromSeq is required"))?;
    let modified_data = body
        .get("modifiedData")
        .cloned()
        .ok_or_else(|| ApiError::bad_request("modifiedData is required"))?;

    let outcome = state
        .fork
        .fork(origin_run_id, fork_from_seq, modified_data)
        .await?;

    let status = match outcome.failure {
        Some(ForkFailure::Gateway) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    };
    let body = json!({
        "success": outcome.success,
        "newRunId": outcome.new_run_id,
        "linked": outcome.linked,
        "message": outcome.message,
        "gatewayResult": outcome.gateway_result,
    });
    Ok((status, Json(body)).into_response())
}
