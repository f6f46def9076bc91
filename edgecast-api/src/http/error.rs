// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Convert edgecast_core errors to HTTP errors
impl From<edgecast_core::Error> for AppError {
    fn from(err: edgecast_core::Error) -> Self {
        use edgecast_core::Error;

        match err {
            e @ Error::AdmissionDenied { .. } => Self::new(StatusCode::TOO_MANY_REQUESTS, e.to_string()),
            Error::CapacityExceeded(msg) => Self::new(StatusCode::SERVICE_UNAVAILABLE, msg),
            Error::UpstreamUnavailable(msg) => Self::new(StatusCode::BAD_GATEWAY, msg),
            Error::NotFound(msg) => Self::not_found(msg),
            Error::ChecksumMismatch {
                asset_id,
                expected,
                actual,
            } => {
                tracing::error!(%asset_id, %expected, %actual, "Refusing to serve corrupted asset");
                Self::internal_server_error(format!("Asset '{asset_id}' failed integrity check"))
            }
            e @ Error::InsufficientCacheSpace { .. } => {
                Self::new(StatusCode::INSUFFICIENT_STORAGE, e.to_string())
            }
            Error::InvalidSignature(msg) => Self::unauthorized(msg),
            e @ Error::InvalidRange { .. } => Self::new(StatusCode::RANGE_NOT_SATISFIABLE, e.to_string()),
            Error::Validation(msg) => Self::bad_request(msg),
            Error::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                Self::internal_server_error("Data processing error")
            }
            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

/// Convert anyhow errors to HTTP errors
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Anyhow error: {}", err);
        Self::internal_server_error("Internal server error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edgecast_core::Error;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                Error::AdmissionDenied {
                    remaining: 0,
                    reset_at: Utc::now(),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (Error::CapacityExceeded("full".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::UpstreamUnavailable("down".into()), StatusCode::BAD_GATEWAY),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                Error::ChecksumMismatch {
                    asset_id: "a".into(),
                    expected: "e".into(),
                    actual: "b".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                Error::InsufficientCacheSpace {
                    required: 2,
                    capacity: 1,
                },
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (Error::InvalidSignature("bad".into()), StatusCode::UNAUTHORIZED),
            (
                Error::InvalidRange {
                    start: 5,
                    end: 1,
                    size: 10,
                },
                StatusCode::RANGE_NOT_SATISFIABLE,
            ),
            (Error::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (Error::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status, expected);
        }
    }

    #[test]
    fn test_internal_details_not_leaked() {
        let err = AppError::from(Error::Internal("db password is hunter2".into()));
        assert_eq!(err.message, "Internal server error");
    }
}
