//! Server error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use dp5_core::{Epoch, EngineError};

#[derive(Error, Debug)]
pub enum ServerError {
    /// Request does not match the server's role or epoch
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Shard file for epoch {epoch} unavailable: {reason}")]
    ShardUnavailable { epoch: Epoch, reason: String },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Lock error: {0}")]
    Lock(#[from] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        ServerError::Forbidden(message.into())
    }

    /// Outcome label for request metrics
    pub fn outcome(&self) -> &'static str {
        match self.status() {
            status if status.is_client_error() => crate::metrics::OUTCOME_REJECTED,
            _ => crate::metrics::OUTCOME_SERVER_ERROR,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServerError::Forbidden(_) | ServerError::ShardUnavailable { .. } => StatusCode::FORBIDDEN,
            ServerError::Engine(EngineError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Engine(_) => StatusCode::BAD_REQUEST,
            ServerError::Json(_) => StatusCode::BAD_REQUEST,
            ServerError::Config(_)
            | ServerError::Upstream(_)
            | ServerError::Lock(_)
            | ServerError::Io(_)
            | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<dp5_core::Error> for ServerError {
    fn from(e: dp5_core::Error) -> Self {
        ServerError::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServerError::Internal(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
