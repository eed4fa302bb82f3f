//! Server error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lockstep_dispatch::DispatchError;
use serde::Serialize;
use thiserror::Error;

/// Server result type
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server busy: {0}")]
    Busy(String),

    #[error("Process group unavailable: {0}")]
    GroupUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DispatchError> for ServerError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::InvalidParams(_) => ServerError::InvalidRequest(e.to_string()),
            DispatchError::Busy(_) => ServerError::Busy(e.to_string()),
            DispatchError::GroupUnavailable(_) | DispatchError::Broadcast(_) => {
                ServerError::GroupUnavailable(e.to_string())
            }
            _ => ServerError::Internal(e.to_string()),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl ServerError {
    pub fn status_code(&self) -> (StatusCode, &'static str) {
        match self {
            ServerError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ServerError::Busy(_) => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
            ServerError::GroupUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "group_unavailable"),
            ServerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_code();

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}
