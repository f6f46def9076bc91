use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Rate limit exceeded, resets at {reset_at}")]
    AdmissionDenied {
        remaining: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Checksum mismatch for asset {asset_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        asset_id: String,
        expected: String,
        actual: String,
    },

    #[error("Insufficient cache space: {required} bytes required, budget is {capacity} bytes")]
    InsufficientCacheSpace { required: u64, capacity: u64 },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Range {start}-{end} not satisfiable for {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a caller may retry the same request later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AdmissionDenied { .. } | Self::CapacityExceeded(_) | Self::UpstreamUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::CapacityExceeded("full".into()).is_retryable());
        assert!(Error::UpstreamUnavailable("down".into()).is_retryable());
        assert!(Error::AdmissionDenied {
            remaining: 0,
            reset_at: Utc::now()
        }
        .is_retryable());

        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::InsufficientCacheSpace {
            required: 10,
            capacity: 5
        }
        .is_retryable());
        assert!(!Error::ChecksumMismatch {
            asset_id: "a".into(),
            expected: "e".into(),
            actual: "b".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidRange {
            start: 10,
            end: 5,
            size: 100,
        };
        assert_eq!(err.to_string(), "Range 10-5 not satisfiable for 100 bytes");
    }
}
