//! # Authentication Helpers
//!
//! Client API-key verification for the request path, plus the password
//! verifier backing the admin surface.
//!
//! API keys arrive via `x-api-key` or `Authorization: Bearer sk-proxy-…`
//! and are stored as SHA-256 hashes; the raw key never touches the
//! database.
//!
//! Passwords exist in two stored formats side by side: a legacy
//! `salt$sha256hex` form kept for migrated accounts, and bcrypt. Inputs
//! longer than bcrypt's 72-byte limit are pre-hashed to SHA-256 hex before
//! verification, matching how such digests were written.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::db::{ApiKeyAuth, SqliteApiKeyStore};
use crate::gateway_error::GatewayError;

/// Prefix of proxy-issued API keys carried in the Authorization header.
pub const PROXY_KEY_PREFIX: &str = "sk-proxy-";

/// Admin session lifetime.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

/// Pull the presented API key out of the request headers.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !value.trim().is_empty() {
            return Some(value.trim().to_string());
        }
    }
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok())?;
    let token = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer "))?;
    let token = token.trim();
    token.starts_with(PROXY_KEY_PREFIX).then(|| token.to_string())
}

/// SHA-256 hex digest of an API key, the stored form.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Authenticate a request against the key store.
pub async fn authenticate(
    store: &SqliteApiKeyStore,
    headers: &HeaderMap,
) -> Result<ApiKeyAuth, GatewayError> {
    let Some(key) = extract_api_key(headers) else {
        return Err(GatewayError::Auth {
            message: "missing API key: send x-api-key or Authorization: Bearer sk-proxy-..."
                .to_string(),
        });
    };

    match store.find_by_hash(&hash_api_key(&key)).await {
        Ok(Some(auth)) => {
            store.touch(auth.id).await;
            Ok(auth)
        }
        Ok(None) => Err(GatewayError::Auth {
            message: "invalid API key".to_string(),
        }),
        Err(e) => Err(GatewayError::Internal {
            message: format!("key lookup failed: {e}"),
        }),
    }
}

/// Verify a password against a stored hash in either supported format.
pub fn verify_password(password: &str, stored: &str) -> bool {
    if stored.starts_with("$2") {
        let candidate = if password.len() > 72 {
            hex::encode(Sha256::digest(password.as_bytes()))
        } else {
            password.to_string()
        };
        return bcrypt::verify(candidate, stored).unwrap_or(false);
    }

    // Legacy form: "<salt>$<sha256hex(salt + password)>".
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    let computed = hex::encode(Sha256::digest(format!("{salt}{password}").as_bytes()));
    constant_time_eq(&computed, digest)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
