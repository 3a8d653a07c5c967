//! Signed auth payload sent during the gateway handshake.

use serde::Serialize;
use serde_json::Value;

/// Output of [`Identity::sign_auth_payload`].
///
/// `public_key` and `signature` are base64url (no padding) over the raw
/// bytes.
///
/// [`Identity::sign_auth_payload`]: crate::Identity::sign_auth_payload
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAuthPayload {
    pub device_id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl SignedAuthPayload {
    /// JSON form embedded into the gateway `connect` request.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case() {
        let payload = SignedAuthPayload {
            device_id: "dev".into(),
            public_key: "pk".into(),
            signature: "sig".into(),
            signed_at_ms: 42,
            nonce: None,
        };
        let value = payload.to_value();
        assert_eq!(value["deviceId"], "dev");
        assert_eq!(value["publicKey"], "pk");
        assert_eq!(value["signedAtMs"], 42);
        assert!(value.get("nonce").is_none());
    }

    #[test]
    fn nonce_included_when_present() {
        let payload = SignedAuthPayload {
            device_id: "dev".into(),
            public_key: "pk".into(),
            signature: "sig".into(),
            signed_at_ms: 42,
            nonce: Some("n1".into()),
        };
        assert_eq!(payload.to_value()["nonce"], "n1");
    }
}
