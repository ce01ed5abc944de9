//! Centralized error types for kvbus.

use thiserror::Error;

/// Main error type for configuration and shared model operations.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid settings file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for kvbus core operations.
pub type KvResult<T> = Result<T, KvError>;

impl KvError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
