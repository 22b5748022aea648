//! Standardized error handling for the Hub's JSON API.
//!
//! Maps the core's six-kind `common::Error` taxonomy onto HTTP status codes
//! with a consistent response body, the way the teacher's API crate maps its
//! domain error onto `ApiError`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(status: u16, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Precondition(String),
    IntegrityViolation(String),
    Internal(String),
    BadRequest(String),
}

impl ApiError {
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            ApiError::NotFound(msg) => ErrorResponse::new(404, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => ErrorResponse::new(409, "CONFLICT", msg),
            ApiError::Unavailable(msg) => ErrorResponse::new(503, "UNAVAILABLE", msg),
            ApiError::Precondition(msg) => ErrorResponse::new(412, "PRECONDITION_FAILED", msg),
            ApiError::IntegrityViolation(msg) => {
                error!("integrity violation surfaced to caller: {msg}");
                ErrorResponse::new(500, "INTEGRITY_VIOLATION", msg)
            }
            ApiError::Internal(msg) => {
                error!("internal error: {msg}");
                ErrorResponse::new(500, "INTERNAL_ERROR", "An internal server error occurred")
                    .with_details(msg)
            }
            ApiError::BadRequest(msg) => ErrorResponse::new(400, "BAD_REQUEST", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.to_error_response();
        let status = StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

impl From<common::Error> for ApiError {
    fn from(err: common::Error) -> Self {
        match err {
            common::Error::NotFound(m) => ApiError::NotFound(m),
            common::Error::Conflict(m) => ApiError::Conflict(m),
            common::Error::Unavailable(m) => ApiError::Unavailable(m),
            common::Error::Precondition(m) => ApiError::Precondition(m),
            common::Error::IntegrityViolation(m) => ApiError::IntegrityViolation(m),
            common::Error::Fatal(m) => ApiError::Internal(m),
            common::Error::Io(e) => ApiError::Internal(format!("I/O error: {e}")),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        error!("database error: {err}");
        ApiError::Unavailable("database error occurred".to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("invalid JSON: {err}"))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Unavailable(format!("node unreachable: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_not_found_to_404() {
        let err: ApiError = common::Error::not_found("ctx-1").into();
        assert_eq!(err.to_error_response().status, 404);
    }

    #[test]
    fn maps_conflict_to_409() {
        let err: ApiError = common::Error::conflict("job already active").into();
        assert_eq!(err.to_error_response().status, 409);
    }

    #[test]
    fn maps_precondition_to_412() {
        let err: ApiError = common::Error::precondition("already failed over").into();
        assert_eq!(err.to_error_response().status, 412);
    }
}
