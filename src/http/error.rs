//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{RelayError, ValidationError};

/// Handler error; renders as `{"error": message}` with the mapped status.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
}

impl ApiError {
    /// 400 naming the missing or malformed body field.
    pub fn bad_request(field: &str) -> Self {
        Self(RelayError::MalformedInput(ValidationError::MissingField {
            field: field.to_string(),
        }))
    }

    /// 401 with `reason`.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self(RelayError::Unauthorized { reason: reason.into() })
    }

    /// 404 for an unknown subject.
    pub fn subject_not_found(id: impl Into<String>) -> Self {
        Self(RelayError::RecordNotFound {
            kind: "Subject",
            id: id.into(),
        })
    }
}

impl<E: Into<RelayError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type of the API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
