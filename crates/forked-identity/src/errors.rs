//! Error types for identity management.

use thiserror::Error;

/// Errors loading, generating, or persisting the device identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Filesystem error reading or writing the key file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Key file JSON is malformed.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// PEM or key material is invalid.
    #[error("key error: {0}")]
    Key(String),
}

/// Convenience alias for identity results.
pub type Result<T> = std::result::Result<T, IdentityError>;
