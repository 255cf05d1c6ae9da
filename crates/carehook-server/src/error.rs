//! HTTP error responses.

use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use carehook_core::HookError;
use carehook_storage::StorageError;
use serde_json::json;

/// Error returned by API handlers, rendered as `{"error": code, "message": ...}`.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] HookError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            HookError::Validation(_) => StatusCode::BAD_REQUEST,
            HookError::NotFound { .. } => StatusCode::NOT_FOUND,
            HookError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            HookError::TransientDelivery { .. }
            | HookError::TerminalDelivery { .. }
            | HookError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self(e.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(HookError::validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(HookError::validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
