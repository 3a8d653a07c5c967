//! # forked-identity
//!
//! One persistent Ed25519 keypair per install, used to authenticate the
//! daemon against the gateway. The key file lives at
//! `~/.forked/identity.json` with owner-only permissions; the stable device
//! id is the SHA-256 of the raw public key bytes, hex-encoded.

#![deny(unsafe_code)]

pub mod errors;
mod keeper;
mod payload;

pub use errors::{IdentityError, Result};
pub use keeper::{Identity, KeyFile};
pub use payload::SignedAuthPayload;
