//! Error types shared by fastpath crates

use thiserror::Error;

/// Configuration error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error while reading or writing a config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Semantically invalid value
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration handling
pub type ConfigResult<T> = Result<T, ConfigError>;
