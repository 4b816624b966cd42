//! Authentication context shared by client and server.
//!
//! Destinations are signed with HMAC-SHA256 over
//! `"<identity>:<host>:<port>"`, so a token only verifies for the client
//! identity it was issued to.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default name of the header carrying the client identity.
pub const DEFAULT_IDENTITY_HEADER: &str = "x-wstclient";

/// Number of random bytes in a client identity.
pub const IDENTITY_LEN: usize = 20;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid secret key")]
    InvalidKey,
}

/// Process-wide authentication settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Shared secret; `None` runs in open mode.
    pub shared_secret: Option<String>,
    /// Header that carries the client identity.
    pub identity_header: String,
}

impl AuthContext {
    pub fn new(shared_secret: Option<String>, identity_header: impl Into<String>) -> Self {
        Self {
            shared_secret: shared_secret.filter(|s| !s.is_empty()),
            identity_header: identity_header.into(),
        }
    }
}

/// The random identity a client process presents on every transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Generate 20 random bytes, hex-encoded.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let bytes: [u8; IDENTITY_LEN] = rng.gen();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn signing_mac(
    secret: &str,
    identity: &str,
    host: &str,
    port: u16,
) -> Result<HmacSha256, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidKey)?;
    mac.update(format!("{}:{}:{}", identity, host, port).as_bytes());
    Ok(mac)
}

/// Sign a destination for a client identity. Returns the raw 32-byte MAC.
pub fn sign_target(
    secret: &str,
    identity: &str,
    host: &str,
    port: u16,
) -> Result<[u8; 32], AuthError> {
    let mac = signing_mac(secret, identity, host, port)?;
    let mut signature = [0u8; 32];
    signature.copy_from_slice(&mac.finalize().into_bytes());
    Ok(signature)
}

/// Verify a destination signature in constant time.
pub fn verify_target(
    secret: &str,
    identity: &str,
    host: &str,
    port: u16,
    signature: &[u8],
) -> bool {
    match signing_mac(secret, identity, host, port) {
        Ok(mac) => mac.verify_slice(signature).is_ok(),
        Err(_) => false,
    }
}
