//! HMAC request signing for admin operations
//!
//! A signed request carries `X-Admin-Timestamp` (unix seconds) and
//! `X-Admin-Signature`, the hex HMAC-SHA256 of `"{timestamp}.{body}"`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::AdminConfig;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-admin-timestamp";
pub const SIGNATURE_HEADER: &str = "x-admin-signature";

#[derive(Clone)]
pub struct AdminVerifier {
    secret: Vec<u8>,
    max_skew_seconds: i64,
}

impl std::fmt::Debug for AdminVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminVerifier")
            .field("max_skew_seconds", &self.max_skew_seconds)
            .finish_non_exhaustive()
    }
}

impl AdminVerifier {
    #[must_use]
    pub fn new(config: &AdminConfig) -> Self {
        Self {
            secret: config.secret.as_bytes().to_vec(),
            max_skew_seconds: config.max_skew_seconds,
        }
    }

    fn mac(&self, timestamp: &str, body: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Internal(format!("Invalid HMAC key: {e}")))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }

    /// Hex signature for `body` at `timestamp`
    pub fn sign(&self, timestamp: i64, body: &[u8]) -> Result<String> {
        let mac = self.mac(&timestamp.to_string(), body)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check the timestamp window, then the MAC in constant time
    pub fn verify(
        &self,
        timestamp: &str,
        signature: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.secret.is_empty() {
            return Err(Error::InvalidSignature("admin access is not configured".to_string()));
        }

        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| Error::InvalidSignature("malformed timestamp".to_string()))?;
        if (now.timestamp() - ts).abs() > self.max_skew_seconds {
            return Err(Error::InvalidSignature(
                "timestamp outside allowed skew".to_string(),
            ));
        }

        let expected = hex::decode(signature.trim())
            .map_err(|_| Error::InvalidSignature("malformed signature".to_string()))?;

        self.mac(timestamp.trim(), body)?
            .verify_slice(&expected)
            .map_err(|_| Error::InvalidSignature("signature mismatch".to_string()))
    }
}
