//! Error types shared across the frame pipeline.

use thiserror::Error;

/// Main error type for configuration and other non-GPU failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// An environment override could not be parsed
    #[error("Invalid value '{value}' for {key}")]
    InvalidOverride {
        /// Environment variable name.
        key: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
