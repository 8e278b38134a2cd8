// src/api/error.rs
// Centralized error handling for HTTP API responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

use crate::context::error::ContextError;

/// Standard API error response format
#[derive(Debug)]
pub struct ApiError {
    pub message: String,
    pub status_code: StatusCode,
    pub error_code: Option<String>,
}

impl ApiError {
    /// Create a new internal server error
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            error_code: Some("INTERNAL_ERROR".to_string()),
        }
    }

    /// Create a new bad request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_REQUEST,
            error_code: Some("BAD_REQUEST".to_string()),
        }
    }

    /// Create a new not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::NOT_FOUND,
            error_code: Some("NOT_FOUND".to_string()),
        }
    }

    /// Create a new conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::CONFLICT,
            error_code: Some("CONFLICT".to_string()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

/// The core raises typed errors; the boundary translates them into
/// protocol-level failures.
impl From<ContextError> for ApiError {
    fn from(e: ContextError) -> Self {
        match &e {
            ContextError::NotFound { .. } => ApiError::not_found(e.to_string()),
            ContextError::AlreadyExists { .. } | ContextError::ConcurrentModification { .. } => {
                ApiError::conflict(e.to_string())
            }
            ContextError::InvalidLevel(_)
            | ContextError::InvalidDelegationTarget { .. }
            | ContextError::UnknownOperationType(_) => ApiError::bad_request(e.to_string()),
            ContextError::InheritanceCycle { .. } | ContextError::Operation(_) => {
                ApiError::internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response_json = json!({
            "error": true,
            "message": self.message,
            "status": self.status_code.as_u16()
        });

        if let Some(error_code) = self.error_code {
            response_json["error_code"] = json!(error_code);
        }

        (self.status_code, Json(response_json)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::types::ContextLevel;

    #[test]
    fn test_api_error_creation() {
        let error = ApiError::internal("Test error");
        assert_eq!(error.status_code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.message, "Test error");
    }

    #[test]
    fn test_context_error_status_mapping() {
        let not_found = ApiError::from(ContextError::NotFound {
            level: ContextLevel::Task,
            context_id: "t1".into(),
        });
        assert_eq!(not_found.status_code, StatusCode::NOT_FOUND);

        let exists = ApiError::from(ContextError::AlreadyExists {
            level: ContextLevel::Project,
            context_id: "p1".into(),
        });
        assert_eq!(exists.status_code, StatusCode::CONFLICT);

        let level = ApiError::from(ContextError::InvalidLevel("workspace".into()));
        assert_eq!(level.status_code, StatusCode::BAD_REQUEST);

        let stale = ApiError::from(ContextError::ConcurrentModification {
            level: ContextLevel::Task,
            context_id: "t1".into(),
            expected: 2,
        });
        assert_eq!(stale.status_code, StatusCode::CONFLICT);
    }
}
