//! Credential validation and signing of the acquisition request.
//!
//! Two independent features, either, both, or neither of which may be
//! configured:
//!
//! - **Client token**: an opaque identifier sent as `X-LT-Client-Token`.
//! - **HMAC signing**: a shared secret producing `X-Timestamp`, `X-Nonce`
//!   and `Authorization: HMAC sha256=<hex>` per request.
//!
//! The signature input is the byte-exact concatenation
//! `METHOD ∥ PATH ∥ TIMESTAMP ∥ NONCE ∥ BODY` with no separators, rendered
//! as lowercase hex. Because the timestamp and nonce are fresh per call,
//! every retry of the acquisition request must be re-signed.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::TunnelConfig;
use crate::error::TunnelError;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted client-token length.
const CLIENT_TOKEN_MAX_LEN: usize = 256;

/// Minimum accepted HMAC secret length in bytes.
const HMAC_SECRET_MIN_LEN: usize = 32;

/// One authentication header: name and value.
pub type AuthHeader = (&'static str, String);

/// Produces authentication headers for acquisition requests.
#[derive(Clone)]
pub struct Signer {
    client_token: Option<String>,
    hmac_secret: Option<String>,
}

// Debug reports only whether each credential is present, never its value.
impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("client_token", &self.client_token.is_some())
            .field("hmac_secret", &self.hmac_secret.is_some())
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Validate the credential fields of `config` and build a signer.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` when the client token is empty, longer than 256
    /// characters or contains characters outside `[A-Za-z0-9_-]`, or when
    /// the HMAC secret is shorter than 32 bytes.
    pub fn from_config(config: &TunnelConfig) -> Result<Self, TunnelError> {
        if let Some(token) = &config.client_token {
            validate_client_token(token)?;
        }
        if let Some(secret) = &config.hmac_secret {
            if secret.len() < HMAC_SECRET_MIN_LEN {
                return Err(TunnelError::config(format!(
                    "hmacSecret must be at least {HMAC_SECRET_MIN_LEN} bytes, got {}",
                    secret.len()
                )));
            }
        }
        Ok(Self {
            client_token: config.client_token.clone(),
            hmac_secret: config.hmac_secret.clone(),
        })
    }

    /// Produce the authentication headers for one request, using the
    /// current wall clock for the timestamp and nonce.
    pub fn headers(&self, method: &str, path: &str, body: &str) -> Vec<AuthHeader> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.headers_at(method, path, body, now_ms)
    }

    /// Produce the authentication headers for one request at a fixed clock
    /// reading. Deterministic; signatures for identical inputs are
    /// identical bit-for-bit.
    pub fn headers_at(&self, method: &str, path: &str, body: &str, now_ms: i64) -> Vec<AuthHeader> {
        let mut headers = Vec::new();

        if let Some(token) = &self.client_token {
            headers.push(("X-LT-Client-Token", token.clone()));
        }

        if let Some(secret) = &self.hmac_secret {
            let timestamp = (now_ms / 1000).to_string();
            let nonce = now_ms.to_string();
            let signature = sign(secret, method, path, &timestamp, &nonce, body);
            headers.push(("X-Timestamp", timestamp));
            headers.push(("X-Nonce", nonce));
            headers.push(("Authorization", format!("HMAC sha256={signature}")));
        }

        headers
    }
}

/// Compute the lowercase-hex HMAC-SHA-256 over the concatenated input.
fn sign(secret: &str, method: &str, path: &str, timestamp: &str, nonce: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(nonce.as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check a client token: non-empty, at most 256 chars, `[A-Za-z0-9_-]` only.
fn validate_client_token(token: &str) -> Result<(), TunnelError> {
    if token.is_empty() {
        return Err(TunnelError::config("clientToken must not be empty"));
    }
    if token.len() > CLIENT_TOKEN_MAX_LEN {
        return Err(TunnelError::config(format!(
            "clientToken must be at most {CLIENT_TOKEN_MAX_LEN} characters, got {}",
            token.len()
        )));
    }
    if let Some(bad) = token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(TunnelError::config(format!(
            "clientToken contains invalid character {bad:?}; allowed are A-Z, a-z, 0-9, '_' and '-'"
        )));
    }
    Ok(())
}
