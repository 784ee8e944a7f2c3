// src/error.rs
// Crate-wide error taxonomy (spec §7). Handlers translate these into HTTP
// responses; they never surface internal detail (stack traces, SQL text) to
// the client.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication error")]
    Authentication,

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limit exceeded")]
    RateLimit { retry_after_secs: u64 },

    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("timeout exceeded")]
    Timeout,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Authentication => StatusCode::UNAUTHORIZED,
            AppError::Authorization(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Deliberately generic for the variants that
    /// could otherwise leak internal detail.
    fn public_message(&self) -> String {
        match self {
            AppError::Validation(msg) => msg.clone(),
            AppError::Authentication => "authentication failed".to_string(),
            AppError::Authorization(msg) => msg.clone(),
            AppError::NotFound(msg) => msg.clone(),
            AppError::RateLimit { .. } => "rate limit exceeded".to_string(),
            AppError::Upstream { status, .. } => format!("upstream returned status {status}"),
            AppError::Timeout => "request deadline exceeded".to_string(),
            AppError::Storage(_) => "storage error".to_string(),
            AppError::Configuration(_) => "server misconfigured".to_string(),
            AppError::Internal(_) => "internal error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(error = %self, "request failed");

        let status = self.status();
        let mut response =
            (status, Json(json!({ "error": self.public_message() }))).into_response();

        if let AppError::RateLimit { retry_after_secs } = &self {
            response
                .headers_mut()
                .insert("Retry-After", retry_after_secs.to_string().parse().unwrap());
        }

        response
    }
}

pub type AppResult<T> = Result<T, AppError>;
