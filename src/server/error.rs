//! HTTP error responses.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::Error;

/// Error type for HTTP handlers. Renders as `{"error": ..., "code": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] Error),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid request body: {0}")]
    Body(#[from] JsonRejection),

    #[error("invalid query: {0}")]
    Query(#[from] QueryRejection),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "missing or invalid API key".to_string(),
            ),
            ApiError::Body(rejection) => {
                tracing::debug!(error = %rejection, "rejected request body");
                (rejection.status(), "INVALID_REQUEST_BODY", rejection.body_text())
            }
            ApiError::Query(rejection) => {
                tracing::debug!(error = %rejection, "rejected query string");
                (rejection.status(), "INVALID_QUERY", rejection.body_text())
            }
            ApiError::Core(err) => match err {
                Error::NotFound(what) => (StatusCode::NOT_FOUND, "NOT_FOUND", format!("{what} not found")),
                Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
                Error::Http(_) | Error::Transport(_) => {
                    tracing::error!(error = %err, "upstream error");
                    (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", err.to_string())
                }
                Error::Store(_)
                | Error::Migrate(_)
                | Error::Config(_)
                | Error::Io(_)
                | Error::Other(_) => {
                    tracing::error!(error = %err, "internal error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "an internal error occurred".to_string(),
                    )
                }
            },
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}
