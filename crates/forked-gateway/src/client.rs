//! The gateway conversation: connect, authenticate, issue one request,
//! collect the terminal response.
//!
//! Each call opens a fresh WebSocket — the gateway treats a connection as
//! one authenticated session, and forks are rare enough that reuse buys
//! nothing. Intermediate `accepted` responses and `event` progress frames
//! are skipped; the conversation resolves on the terminal `res` frame
//! matching the request id.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use forked_identity::Identity;

use crate::errors::{GatewayError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Scopes requested during the handshake.
pub const SCOPES: &[&str] = &["operator.admin", "operator.write"];
/// Role requested during the handshake.
pub const ROLE: &str = "operator";

const PROTOCOL_VERSION: u64 = 3;
const AGENT_DEADLINE: Duration = Duration::from_secs(120);
const SEND_DEADLINE: Duration = Duration::from_secs(30);
/// Server-side agent timeout passed in the request params, in seconds.
const AGENT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Client for the gateway's framed-JSON RPC channel.
pub struct GatewayClient {
    url: String,
    token: Option<String>,
    identity: Arc<Identity>,
}

impl GatewayClient {
    /// Create a client for the given gateway URL.
    pub fn new(url: String, token: Option<String>, identity: Arc<Identity>) -> Self {
        Self {
            url,
            token,
            identity,
        }
    }

    /// Run the agent with a message, optionally bound to a session key.
    ///
    /// Returns the terminal response frame. Deadline: 120 s overall.
    pub async fn run_agent(&self, message: &str, session_key: Option<&str>) -> Result<Value> {
        let params = json!({
            "message": message,
            "agentId": agent_id_from_session_key(session_key),
            "sessionKey": session_key,
            "idempotencyKey": Uuid::now_v7().to_string(),
            "timeout": AGENT_REQUEST_TIMEOUT_SECS,
        });
        self.converse("agent", params, AGENT_DEADLINE).await
    }

    /// Publish a message to a user channel (fork echoes and reply delivery).
    ///
    /// Deadline: 30 s overall.
    pub async fn send_message(&self, channel: &str, to: &str, message: &str) -> Result<Value> {
        let params = json!({
            "channel": channel,
            "to": to,
            "message": message,
            "idempotencyKey": Uuid::now_v7().to_string(),
        });
        self.converse("send", params, SEND_DEADLINE).await
    }

    /// One full conversation: connect handshake, then a single request.
    ///
    /// The whole exchange runs under one deadline; hitting it drops the
    /// socket, which closes it.
    async fn converse(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let context: &'static str = if method == "agent" { "agent" } else { "send" };
        tokio::time::timeout(deadline, self.converse_inner(method, params))
            .await
            .map_err(|_| GatewayError::Timeout {
                seconds: deadline.as_secs(),
                context,
            })?
    }

    async fn converse_inner(&self, method: &str, params: Value) -> Result<Value> {
        let (mut ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| GatewayError::Transport(format!("connect {}: {e}", self.url)))?;

        self.handshake(&mut ws).await?;

        let request_id = Uuid::now_v7().to_string();
        send_frame(
            &mut ws,
            &json!({"type": "req", "id": request_id, "method": method, "params": params}),
        )
        .await?;
        let result = wait_for_terminal_res(&mut ws, &request_id).await?;

        let _ = ws.close(None).await;
        Ok(result)
    }

    async fn handshake(&self, ws: &mut WsStream) -> Result<()> {
        let connect_id = Uuid::now_v7().to_string();
        let signed_at_ms = now_epoch_ms();
        let device = self
            .identity
            .sign_auth_payload(SCOPES, ROLE, self.token.as_deref(), None, signed_at_ms)
            .to_value();

        let mut params = json!({
            "minProtocol": PROTOCOL_VERSION,
            "maxProtocol": PROTOCOL_VERSION,
            "client": {
                "id": "cli",
                "version": env!("CARGO_PKG_VERSION"),
                "platform": std::env::consts::OS,
                "mode": "cli",
                "instanceId": Uuid::now_v7().to_string(),
            },
            "role": ROLE,
            "scopes": SCOPES,
            "device": device,
        });
        if let Some(token) = &self.token {
            params["auth"] = json!({"token": token});
        }

        send_frame(
            ws,
            &json!({"type": "req", "id": connect_id, "method": "connect", "params": params}),
        )
        .await?;

        let frame = wait_for_terminal_res(ws, &connect_id)
            .await
            .map_err(|e| match e {
                GatewayError::Rejected(message) => GatewayError::AuthFailed(message),
                other => other,
            })?;
        debug!(protocol = ?frame.pointer("/payload/protocol"), "gateway handshake complete");
        Ok(())
    }
}

/// Second segment of an `agent:`-prefixed session key, else `"main"`.
#[must_use]
pub fn agent_id_from_session_key(session_key: Option<&str>) -> String {
    if let Some(key) = session_key {
        if let Some(rest) = key.strip_prefix("agent:") {
            if let Some(agent_id) = rest.split(':').next() {
                if !agent_id.is_empty() {
                    return agent_id.to_string();
                }
            }
        }
    }
    "main".to_string()
}

async fn send_frame(ws: &mut WsStream, frame: &Value) -> Result<()> {
    let text = serde_json::to_string(frame)
        .map_err(|e| GatewayError::Transport(format!("frame encode: {e}")))?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| GatewayError::Transport(format!("send: {e}")))
}

/// Read frames until the terminal `res` for `request_id` arrives.
///
/// Skips `event` frames and `res` frames whose `payload.status` is
/// `"accepted"`. A close or stream end before the terminal response is
/// [`GatewayError::Closed`].
async fn wait_for_terminal_res(ws: &mut WsStream, request_id: &str) -> Result<Value> {
    loop {
        let message = match ws.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(GatewayError::Transport(format!("recv: {e}"))),
            None => return Err(GatewayError::Closed),
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data)).await;
                continue;
            }
            Message::Close(_) => return Err(GatewayError::Closed),
            _ => continue,
        };

        let frame: Value = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unparseable gateway frame");
                continue;
            }
        };

        if frame["type"] != "res" || frame["id"] != request_id {
            continue;
        }
        if frame.pointer("/payload/status").and_then(Value::as_str) == Some("accepted") {
            continue;
        }

        let ok = frame.get("ok").and_then(Value::as_bool).unwrap_or(true);
        if !ok || frame.get("error").is_some_and(|e| !e.is_null()) {
            let message = frame
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("request refused")
                .to_string();
            return Err(GatewayError::Rejected(message));
        }
        return Ok(frame);
    }
}

fn now_epoch_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
