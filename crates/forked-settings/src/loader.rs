//! Settings loading.
//!
//! Loading flow:
//! 1. Read the host (OpenClaw) config at `~/.openclaw/openclaw.json` —
//!    gateway endpoint, shared token, configured delivery channels. A
//!    missing or unreadable file downgrades to defaults with a warning.
//! 2. Read the local override file `~/.forked/config.json` for retention.
//! 3. Apply the `FORKED_RETENTION_DAYS` env override (highest priority).
//!    Invalid values are silently ignored.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::retention::Retention;

/// Default gateway port when the host config does not specify one.
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Env var overriding the retention setting.
pub const RETENTION_ENV_VAR: &str = "FORKED_RETENTION_DAYS";

/// Resolved daemon settings.
#[derive(Clone, Debug)]
pub struct Settings {
    /// WebSocket URL of the gateway push channel.
    pub gateway_url: String,
    /// Optional shared secret for the gateway handshake.
    pub gateway_token: Option<String>,
    /// Configured delivery channels, lowercased. Empty when unknown.
    pub configured_channels: HashSet<String>,
    /// How long trace data is kept.
    pub retention: Retention,
    /// Raw host config for the sanitized view; `None` when unreadable.
    pub raw_host_config: Option<Value>,
    /// Human-readable host-config read error, when any.
    pub host_config_error: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_url: format!("ws://127.0.0.1:{DEFAULT_GATEWAY_PORT}"),
            gateway_token: None,
            configured_channels: HashSet::new(),
            retention: Retention::default(),
            raw_host_config: None,
            host_config_error: None,
        }
    }
}

/// Resolve the host config path (`~/.openclaw/openclaw.json`).
pub fn host_config_path() -> PathBuf {
    home_dir().join(".openclaw").join("openclaw.json")
}

/// Resolve the local override path (`~/.forked/config.json`).
pub fn local_config_path() -> PathBuf {
    home_dir().join(".forked").join("config.json")
}

/// Resolve the daemon state directory (`~/.forked`).
pub fn state_dir() -> PathBuf {
    home_dir().join(".forked")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// Load settings from the default locations with env overrides.
pub fn load_settings() -> Settings {
    load_settings_from_paths(
        &host_config_path(),
        &local_config_path(),
        std::env::var(RETENTION_ENV_VAR).ok().as_deref(),
    )
}

/// Load settings from explicit paths (testable without a real home dir).
pub fn load_settings_from_paths(
    host_path: &Path,
    local_path: &Path,
    env_retention: Option<&str>,
) -> Settings {
    let mut settings = Settings::default();

    match read_json(host_path) {
        Ok(Some(config)) => {
            apply_host_config(&mut settings, &config);
            settings.raw_host_config = Some(config);
        }
        Ok(None) => {
            debug!(path = %host_path.display(), "host config not found, using defaults");
            settings.host_config_error = Some("config file not found".to_string());
        }
        Err(message) => {
            warn!(path = %host_path.display(), %message, "failed to read host config");
            settings.host_config_error = Some(message);
        }
    }

    match read_json(local_path) {
        Ok(Some(local)) => {
            if let Some(value) = local.get("retentionDays") {
                if let Some(retention) = Retention::from_value(value) {
                    settings.retention = retention;
                }
            }
        }
        Ok(None) => {}
        Err(message) => {
            warn!(path = %local_path.display(), %message, "failed to read local config");
        }
    }

    if let Some(raw) = env_retention {
        if let Some(retention) = Retention::parse(raw) {
            settings.retention = retention;
        }
    }

    settings
}

fn apply_host_config(settings: &mut Settings, config: &Value) {
    if let Some(port) = config
        .get("gateway")
        .and_then(|g| g.get("port"))
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
    {
        settings.gateway_url = format!("ws://127.0.0.1:{port}");
    }

    settings.gateway_token = config
        .get("gateway")
        .and_then(|g| g.get("auth"))
        .and_then(|a| a.get("token"))
        .and_then(Value::as_str)
        .map(String::from);

    if let Some(channels) = config.get("channels").and_then(Value::as_object) {
        settings.configured_channels = channels.keys().map(|k| k.to_lowercase()).collect();
    }
}

/// Read a JSON file. `Ok(None)` when the file does not exist.
fn read_json(path: &Path) -> std::result::Result<Option<Value>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let value: Value = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    Ok(Some(value))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
