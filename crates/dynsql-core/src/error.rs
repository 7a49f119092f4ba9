//! Error types for dynsql core

use thiserror::Error;

/// Core error type for context construction and configuration loading
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid parameter context: {0}")]
    InvalidContext(String),
}

/// Result type alias for dynsql core operations
pub type Result<T> = std::result::Result<T, CoreError>;
