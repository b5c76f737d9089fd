//! Error types for the gateway crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ferry_engine::EngineError;
use serde_json::json;

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// An error propagated from the engine.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The request body or path contains invalid values.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::Engine(EngineError::InvalidOptions(_)) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Engine(e) => match e {
                EngineError::AlreadyRunning { .. } | EngineError::TaskNotRunning => StatusCode::CONFLICT,
                EngineError::NotAvailable(_) | EngineError::NotRunning(_) | EngineError::TaskNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                EngineError::Precondition(_) => StatusCode::PRECONDITION_FAILED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}
