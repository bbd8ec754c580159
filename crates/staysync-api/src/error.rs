//! HTTP error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use staysync_delivery::{DeliveryError, ErrorCategory};

/// Error response with code and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

impl ErrorBody {
    /// Creates an error body.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { error: ErrorDetail { code: code.into(), message: message.into() } }
    }
}

/// Handler errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Failure inside the delivery core.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Unknown resource.
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or wrong admin token.
    #[error("admin token required")]
    Unauthorized,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::Delivery(err) => match err.category() {
                ErrorCategory::Storage => (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable"),
                ErrorCategory::TransientNetwork | ErrorCategory::Circuit => {
                    (StatusCode::BAD_GATEWAY, "upstream_unavailable")
                },
                ErrorCategory::DataQuality => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_reservation"),
                ErrorCategory::Auth | ErrorCategory::PermanentIntegration => {
                    (StatusCode::BAD_GATEWAY, "upstream_rejected")
                },
                ErrorCategory::Scheduling | ErrorCategory::Internal => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                },
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "request failed");
        }

        let message = match &self {
            Self::Delivery(err) if err.category() == ErrorCategory::Storage => {
                "storage temporarily unavailable".to_string()
            },
            other => other.to_string(),
        };

        (status, Json(ErrorBody::new(code, message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures_map_to_503_without_details() {
        let response = ApiError::from(DeliveryError::storage("password=hunter2")).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn client_errors_keep_their_status() {
        assert_eq!(ApiError::NotFound("reservation".into()).into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::BadRequest("x".into()).into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
