//! Client error types

use dp5_core::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Core(#[from] dp5_core::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No tokio runtime available for the HTTP transport")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, ClientError>;
