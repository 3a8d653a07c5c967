//! Sanitized config view for the UI.
//!
//! The raw host config carries API tokens and environment blocks that must
//! never reach the browser. Redaction is structural: sensitive key names,
//! everything under an `env` object, and the gateway auth token.

use serde_json::{Map, Value};

/// Replacement string for redacted values.
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEY_PARTS: &[&str] = &["token", "secret", "key", "password"];

/// Whether a key name is sensitive (case-insensitive substring match).
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lower.contains(part))
}

/// Produce a deep copy of `config` with every sensitive value replaced by
/// [`REDACTED`].
///
/// Rules:
/// - any key matching `token`/`secret`/`key`/`password` (case-insensitive)
/// - every value under an `env` object, regardless of key name
/// - `gateway.auth.token` (already covered by the key rule, kept explicit
///   in tests)
#[must_use]
pub fn sanitize_config(config: &Value) -> Value {
    sanitize_value(config, false)
}

fn sanitize_value(value: &Value, under_env: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                let redact_here = under_env || is_sensitive_key(key);
                let next = if redact_here && !val.is_object() && !val.is_array() {
                    Value::from(REDACTED)
                } else if redact_here {
                    // Sensitive containers: redact every leaf inside.
                    sanitize_value(val, true)
                } else {
                    sanitize_value(val, key == "env")
                };
                let _ = out.insert(key.clone(), next);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(item, under_env))
                .collect(),
        ),
        _ if under_env => Value::from(REDACTED),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_sensitive_key_names() {
        let config = json!({
            "apiToken": "xyz",
            "clientSecret": "shh",
            "sshKey": "k",
            "password": "p",
            "name": "visible"
        });
        let out = sanitize_config(&config);
        assert_eq!(out["apiToken"], REDACTED);
        assert_eq!(out["clientSecret"], REDACTED);
        assert_eq!(out["sshKey"], REDACTED);
        assert_eq!(out["password"], REDACTED);
        assert_eq!(out["name"], "visible");
    }

    #[test]
    fn redacts_everything_under_env() {
        let config = json!({
            "env": {"OPENAI_API_KEY": "sk-1", "PLAIN_VAR": "also hidden"},
            "other": "visible"
        });
        let out = sanitize_config(&config);
        assert_eq!(out["env"]["OPENAI_API_KEY"], REDACTED);
        assert_eq!(out["env"]["PLAIN_VAR"], REDACTED);
        assert_eq!(out["other"], "visible");
    }

    #[test]
    fn redacts_gateway_auth_token() {
        let config = json!({"gateway": {"auth": {"token": "abc"}, "port": 18789}});
        let out = sanitize_config(&config);
        assert_eq!(out["gateway"]["auth"]["token"], REDACTED);
        assert_eq!(out["gateway"]["port"], 18789);
    }

    #[test]
    fn recurses_into_nested_channels() {
        let config = json!({
            "channels": {"telegram": {"apiToken": "xyz", "groupId": "-100"}}
        });
        let out = sanitize_config(&config);
        assert_eq!(out["channels"]["telegram"]["apiToken"], REDACTED);
        assert_eq!(out["channels"]["telegram"]["groupId"], "-100");
    }

    #[test]
    fn recurses_into_arrays() {
        let config = json!({"list": [{"token": "a"}, {"plain": "b"}]});
        let out = sanitize_config(&config);
        assert_eq!(out["list"][0]["token"], REDACTED);
        assert_eq!(out["list"][1]["plain"], "b");
    }

    #[test]
    fn spec_scenario_all_three_redacted() {
        let config = json!({
            "env": {"OPENAI_API_KEY": "sk-…"},
            "gateway": {"auth": {"token": "abc"}},
            "channels": {"telegram": {"apiToken": "xyz"}}
        });
        let out = sanitize_config(&config);
        assert_eq!(out["env"]["OPENAI_API_KEY"], REDACTED);
        assert_eq!(out["gateway"]["auth"]["token"], REDACTED);
        assert_eq!(out["channels"]["telegram"]["apiToken"], REDACTED);
    }

    #[test]
    fn no_string_under_sensitive_key_survives() {
        // Sensitive key holding an object: leaves inside are redacted too.
        let config = json!({"keyMaterial": {"inner": "secret-bytes"}});
        let out = sanitize_config(&config);
        assert_eq!(out["keyMaterial"]["inner"], REDACTED);
    }
}
