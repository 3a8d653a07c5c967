//! # forked-settings
//!
//! Configuration for the Forked daemon: the host (OpenClaw) config file is
//! the source of truth for the gateway endpoint, shared token, and configured
//! delivery channels; retention comes from a local override file and the
//! `FORKED_RETENTION_DAYS` env var. A sanitized deep copy of the raw host
//! config is exposed for the UI.

#![deny(unsafe_code)]

pub mod loader;
pub mod retention;
pub mod sanitize;

pub use loader::{
    host_config_path, load_settings, load_settings_from_paths, local_config_path, state_dir,
    Settings, DEFAULT_GATEWAY_PORT, RETENTION_ENV_VAR,
};
pub use retention::{Retention, DEFAULT_RETENTION_DAYS};
pub use sanitize::{sanitize_config, REDACTED};
