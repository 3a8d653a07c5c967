//! Error types for gateway conversations.

use thiserror::Error;

/// Failure modes of a gateway conversation.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The `connect` handshake was refused.
    #[error("gateway auth failed: {0}")]
    AuthFailed(String),

    /// The gateway rejected the request itself.
    #[error("gateway rejected request: {0}")]
    Rejected(String),

    /// Socket-level failure (connect, send, or malformed frame).
    #[error("gateway transport error: {0}")]
    Transport(String),

    /// The overall deadline elapsed; the socket was closed.
    #[error("gateway timed out after {seconds}s during {context}")]
    Timeout {
        seconds: u64,
        context: &'static str,
    },

    /// The gateway closed the connection before a terminal response.
    #[error("gateway closed connection unexpectedly")]
    Closed,
}

impl GatewayError {
    /// Stable kind string for logs and API diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailed(_) => "auth_failed",
            Self::Rejected(_) => "request_rejected",
            Self::Transport(_) => "transport_error",
            Self::Timeout { .. } => "timeout",
            Self::Closed => "closed_unexpectedly",
        }
    }
}

/// Convenience alias for gateway results.
pub type Result<T> = std::result::Result<T, GatewayError>;
