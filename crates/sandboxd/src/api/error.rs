//! API error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::agent::AgentError;
use crate::session::SessionError;

/// Errors surfaced to API clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("no capacity for new sessions")]
    Capacity,

    #[error("{0}")]
    Forbidden(String),

    #[error("container runtime failure: {0}")]
    Driver(String),

    #[error("{0}")]
    Upstream(String),

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::Capacity => (StatusCode::SERVICE_UNAVAILABLE, "no_capacity"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::Driver(_) => (StatusCode::INTERNAL_SERVER_ERROR, "driver_error"),
            ApiError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_unavailable"),
            ApiError::Internal(e) => {
                log::error!("internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound => ApiError::NotFound("session not found".to_string()),
            SessionError::Conflict(m) => ApiError::Conflict(m),
            SessionError::Capacity => ApiError::Capacity,
            SessionError::Driver(e) => ApiError::Driver(e.to_string()),
            SessionError::Internal(e) => ApiError::Internal(e),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::SessionNotFound => ApiError::NotFound("session not found".to_string()),
            AgentError::TaskNotFound => ApiError::NotFound("task not found".to_string()),
            AgentError::NotEnabled => {
                ApiError::Validation("agent tasks are not enabled for this session".to_string())
            }
            AgentError::NotRunning => {
                ApiError::Conflict("session container is not running".to_string())
            }
            AgentError::NoApiKey(provider) => {
                ApiError::Validation(format!("no {provider} api key configured"))
            }
            AgentError::Forbidden => {
                ApiError::Forbidden("task belongs to a different session".to_string())
            }
            AgentError::NotStarted => {
                ApiError::Conflict("task has not been handed to the runner yet".to_string())
            }
            AgentError::Upstream(e) => ApiError::Upstream(format!("{e:#}")),
            AgentError::Vault(e) => ApiError::Internal(e.into()),
            AgentError::Internal(e) => ApiError::Internal(e),
        }
    }
}
