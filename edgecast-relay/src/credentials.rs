//! Time-limited TURN credentials
//!
//! Compatible with coturn's `static-auth-secret` mode (TURN REST API):
//! - Username: `<expiry_timestamp>:<user_id>`
//! - Credential: base64(HMAC-SHA1(secret, username))
//!
//! Verification is stateless. Any relay holding the shared secret recomputes
//! the HMAC from the username alone, so an issued credential stays valid until
//! its embedded expiry and cannot be revoked earlier.

use base64::Engine;
use chrono::{DateTime, Utc};
use edgecast_core::{Error, Result};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::Sha1;
use std::time::Duration;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCredentials {
    pub username: String,
    pub credential: String,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub urls: Vec<String>,
}

#[derive(Clone)]
pub struct TurnCredentialService {
    shared_secret: String,
    ttl: Duration,
}

impl std::fmt::Debug for TurnCredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCredentialService")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TurnCredentialService {
    #[must_use]
    pub fn new(shared_secret: impl Into<String>, ttl: Duration) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            ttl,
        }
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint credentials for `user_id`, valid for the configured TTL
    pub fn generate_credentials(&self, user_id: &str, urls: Vec<String>) -> Result<TurnCredentials> {
        self.generate_credentials_at(user_id, urls, Utc::now())
    }

    pub fn generate_credentials_at(
        &self,
        user_id: &str,
        urls: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<TurnCredentials> {
        if user_id.is_empty() {
            return Err(Error::Validation("userId must not be empty".to_string()));
        }

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| Error::Internal(format!("Invalid credential TTL: {e}")))?;
        let expires_at = now + ttl;
        let username = format!("{}:{user_id}", expires_at.timestamp());
        let credential = compute_hmac(&self.shared_secret, &username)?;

        Ok(TurnCredentials {
            username,
            credential,
            ttl_seconds: self.ttl.as_secs(),
            expires_at,
            urls,
        })
    }

    /// Verify a credential against this service's secret
    #[must_use]
    pub fn verify(&self, username: &str, credential: &str, now: DateTime<Utc>) -> bool {
        verify_credentials(&self.shared_secret, username, credential, now)
    }

    pub fn validate_config(&self) -> anyhow::Result<()> {
        if self.shared_secret.is_empty() {
            return Err(anyhow::anyhow!("TURN shared secret is empty"));
        }

        if self.shared_secret.len() < 32 {
            return Err(anyhow::anyhow!("TURN shared secret should be at least 32 characters"));
        }

        if self.ttl.as_secs() < 60 {
            return Err(anyhow::anyhow!("TURN credential TTL should be at least 60 seconds"));
        }

        if self.ttl.as_secs() > 86400 * 7 {
            return Err(anyhow::anyhow!("TURN credential TTL should not exceed 7 days"));
        }

        Ok(())
    }
}

fn compute_hmac(secret: &str, username: &str) -> Result<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Internal(format!("Failed to create HMAC: {e}")))?;
    mac.update(username.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Stateless check a relay performs: expiry from the username, then the HMAC
#[must_use]
pub fn verify_credentials(secret: &str, username: &str, credential: &str, now: DateTime<Utc>) -> bool {
    let Some((expiry, user_id)) = username.split_once(':') else {
        return false;
    };
    let Ok(expiry) = expiry.parse::<i64>() else {
        return false;
    };
    if user_id.is_empty() || expiry <= now.timestamp() {
        return false;
    }

    let Ok(expected) = compute_hmac(secret, username) else {
        return false;
    };
    expected.as_bytes().ct_eq(credential.as_bytes()).into()
}
