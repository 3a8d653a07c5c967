//! The tracer push channel: a loopback WebSocket server.
//!
//! Multiple tracer connections are tolerated (one is typical). Each text
//! message is one JSON frame; parsed frames flow into the shared ingest
//! queue. Malformed frames are logged and dropped without closing the
//! connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use forked_core::TraceFrame;

/// Shared state for the ingest listener.
#[derive(Clone)]
pub struct IngestState {
    tx: mpsc::Sender<TraceFrame>,
    connections: Arc<AtomicUsize>,
    frames_total: Arc<AtomicU64>,
}

impl IngestState {
    pub fn new(tx: mpsc::Sender<TraceFrame>) -> Self {
        Self {
            tx,
            connections: Arc::new(AtomicUsize::new(0)),
            frames_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Currently connected tracers.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Total frames accepted since startup.
    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }
}

/// Build the ingest router (`/` and `/ws` both upgrade).
pub fn router(state: IngestState) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Bind the push channel on `addr` and serve until the token cancels.
pub async fn serve(
    state: IngestState,
    addr: &str,
    cancel: CancellationToken,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    info!(addr = %bound_addr, "ingest channel listening");

    let app = router(state);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;
        info!("ingest channel stopped");
    });
    Ok((bound_addr, handle))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<IngestState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tracer(socket, state))
}

async fn handle_tracer(mut socket: WebSocket, state: IngestState) {
    let peers = state.connections.fetch_add(1, Ordering::Relaxed) + 1;
    info!(peers, "tracer connected");

    let mut frames: u64 = 0;
    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "tracer socket error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                match TraceFrame::parse(&text) {
                    Ok(frame) => {
                        frames += 1;
                        let _ = state.frames_total.fetch_add(1, Ordering::Relaxed);
                        // Await here gives backpressure to a fast tracer
                        // instead of dropping frames.
                        if state.tx.send(frame).await.is_err() {
                            warn!("ingest pipeline gone, closing tracer connection");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping malformed trace frame");
                    }
                }
            }
            Message::Ping(data) => {
                let _ = socket.send(Message::Pong(data)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let peers = state.connections.fetch_sub(1, Ordering::Relaxed) - 1;
    info!(peers, frames, "tracer disconnected");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
