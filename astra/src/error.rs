//! Error types for astra

use thiserror::Error;

/// Result type alias for astra operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in astra
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Engine not ready: {0}")]
    EngineNotReady(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    pub fn engine_not_ready(msg: impl Into<String>) -> Self {
        Self::EngineNotReady(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Human-readable text without the category prefix, for surfacing in
    /// chat messages and status lines.
    pub fn user_message(&self) -> String {
        match self {
            Error::Engine(msg) | Error::EngineNotReady(msg) => msg.clone(),
            Error::Http(err) => err.to_string(),
            other => other.to_string(),
        }
    }
}
