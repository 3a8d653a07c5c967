//! Keypair persistence and device id derivation.

use std::path::Path;

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::errors::{IdentityError, Result};
use crate::payload::SignedAuthPayload;

/// On-disk key file format.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFile {
    pub version: u32,
    pub device_id: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
    pub created_at_ms: i64,
}

/// The device identity: a loaded keypair plus its derived id.
pub struct Identity {
    device_id: String,
    signing_key: SigningKey,
}

impl Identity {
    /// Load the identity from `path`, generating and persisting a fresh
    /// keypair when the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let identity = Self::from_signing_key(signing_key);
        identity.persist(path)?;
        info!(device_id = %identity.device_id, "generated new device identity");
        Ok(identity)
    }

    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: KeyFile = serde_json::from_str(&content)?;
        let signing_key = SigningKey::from_pkcs8_pem(&file.private_key_pem)
            .map_err(|e| IdentityError::Key(format!("invalid private key pem: {e}")))?;
        // The device id is always recomputed from the key material; the
        // stored copy is informational.
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let device_id = derive_device_id(&signing_key.verifying_key().to_bytes());
        Self {
            device_id,
            signing_key,
        }
    }

    fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let private_key_pem = self
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| IdentityError::Key(format!("pem encode failed: {e}")))?;
        let public_key_pem = self
            .signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| IdentityError::Key(format!("pem encode failed: {e}")))?;

        let file = KeyFile {
            version: 1,
            device_id: self.device_id.clone(),
            public_key_pem,
            private_key_pem: private_key_pem.to_string(),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)?;
        restrict_permissions(path)?;
        Ok(())
    }

    /// The stable device id (hex SHA-256 of the raw public key).
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Raw 32-byte public key.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign an authentication payload for the gateway handshake.
    ///
    /// The signed string is pipe-joined:
    /// `<version>|<deviceId>|cli|cli|<role>|<scopes,comma>|<signedAtMs>|<token>[|<nonce>]`
    /// where version is `v2` when a nonce is supplied and `v1` otherwise.
    pub fn sign_auth_payload(
        &self,
        scopes: &[&str],
        role: &str,
        gateway_token: Option<&str>,
        nonce: Option<&str>,
        signed_at_ms: i64,
    ) -> SignedAuthPayload {
        let version = if nonce.is_some() { "v2" } else { "v1" };
        let mut parts = vec![
            version.to_string(),
            self.device_id.clone(),
            "cli".to_string(),
            "cli".to_string(),
            role.to_string(),
            scopes.join(","),
            signed_at_ms.to_string(),
            gateway_token.unwrap_or("").to_string(),
        ];
        if let Some(nonce) = nonce {
            parts.push(nonce.to_string());
        }
        let message = parts.join("|");
        let signature = self.signing_key.sign(message.as_bytes());

        SignedAuthPayload {
            device_id: self.device_id.clone(),
            public_key: base64url(&self.public_key_bytes()),
            signature: base64url(&signature.to_bytes()),
            signed_at_ms,
            nonce: nonce.map(String::from),
        }
    }
}

/// hex(SHA-256(raw public key bytes)).
fn derive_device_id(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn base64url(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
