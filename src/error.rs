//! Error types for the Warden engine.

use thiserror::Error;

/// Main error type for Warden operations.
///
/// Only `Config` and `ConfigurationInvalid` ever reach an operator; everything
/// raised on the evaluation path is recovered into a safe decision.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration parsed but violates a policy invariant
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// The counter store could not be reached or did not answer in time
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for WardenError {
    fn from(err: redis::RedisError) -> Self {
        WardenError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
