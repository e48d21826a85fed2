//! HTTP error mapping
//!
//! Engine error kinds map onto status codes here, and nothing else leaks:
//! internal failures become an opaque 500, never a stack trace.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use voxbridge_call_engine::CallEngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("service not ready: {0}")]
    NotReady(String),

    /// Personality query asked for JSON the model would not produce
    #[error("model output was not valid JSON")]
    UnparseableModelOutput { raw: String },

    #[error("internal error")]
    Internal(String),
}

impl From<CallEngineError> for ApiError {
    fn from(error: CallEngineError) -> Self {
        match error {
            CallEngineError::Validation { reason } => ApiError::BadRequest(reason),
            CallEngineError::NotFound { what, id } => ApiError::NotFound(format!("{} {}", what, id)),
            CallEngineError::NotReady { reason } => ApiError::NotReady(reason),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "error": reason }),
            ),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                json!({ "success": false, "error": format!("{} not found", what) }),
            ),
            ApiError::NotReady(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "success": false, "error": reason }),
            ),
            ApiError::UnparseableModelOutput { raw } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({
                    "success": false,
                    "error": "model output was not valid JSON",
                    "response": { "raw": raw },
                }),
            ),
            ApiError::Internal(reason) => {
                tracing::error!("api internal error: {}", reason);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "success": false, "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
