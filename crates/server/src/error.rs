//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gantry_registry::RegistryError;
use gantry_store::StoreError;
use serde::Serialize;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Stable error-kind tag for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
///
/// Variants map one-to-one onto the coordinator's error taxonomy; `Store`
/// and `Registry` are passthroughs for backend errors the manager did not
/// classify itself.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("upload queue full, retry after {retry_after_secs}s")]
    Overloaded { retry_after_secs: u64 },

    #[error("insufficient storage: need {needed} bytes, {available} available")]
    Exhausted { needed: u64, available: u64 },

    #[error("write deadline exceeded: {0}")]
    Timeout(String),

    #[error("io failure: {0}")]
    IoFailure(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl ApiError {
    /// Get the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Overloaded { .. } => "overloaded",
            Self::Exhausted { .. } => "exhausted",
            Self::Timeout(_) => "timeout",
            Self::IoFailure(_) => "io_failure",
            Self::Cancelled(_) => "cancelled",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
            Self::Store(e) => match e {
                StoreError::NotFound(_) => "not_found",
                StoreError::Exhausted { .. } => "exhausted",
                _ => "io_failure",
            },
            Self::Registry(e) => match e {
                RegistryError::NotFound(_) => "not_found",
                _ => "registry_error",
            },
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } | Self::Overloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Exhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Self::Timeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Cancelled(_) => StatusCode::CONFLICT,
            Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(e) => match e {
                StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                StoreError::Exhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Registry(e) => match e {
                RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
                RegistryError::AlreadyExists(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Retry-After hint in seconds, for throttling responses.
    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } | Self::Overloaded { retry_after_secs } => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        match self.retry_after() {
            Some(secs) => (status, [("Retry-After", secs.to_string())], Json(body)).into_response(),
            None => (status, Json(body)).into_response(),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_documented_statuses() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::PayloadTooLarge("x".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::RateLimited {
                retry_after_secs: 1
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Overloaded {
                retry_after_secs: 1
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Exhausted {
                needed: 1,
                available: 0
            }
            .status_code(),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            ApiError::Conflict("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Cancelled("x".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn store_errors_pass_through_classification() {
        let not_found: ApiError = StoreError::NotFound("chunk".into()).into();
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.code(), "not_found");

        let exhausted: ApiError = StoreError::Exhausted {
            needed: 10,
            available: 1,
        }
        .into();
        assert_eq!(exhausted.status_code(), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(exhausted.code(), "exhausted");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::Timeout("t".into()).code(), "timeout");
        assert_eq!(
            ApiError::Overloaded {
                retry_after_secs: 5
            }
            .code(),
            "overloaded"
        );
        assert_eq!(ApiError::Conflict("c".into()).code(), "conflict");
    }
}
