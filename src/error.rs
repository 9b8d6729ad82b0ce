//! Error types for the Tokengate admission engine.

use thiserror::Error;

/// Main error type for Tokengate operations.
///
/// These surface from configuration and initialization only. Admission
/// checks never return an error; backend failures there collapse to a denial.
#[derive(Error, Debug)]
pub enum TokengateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule that can never be evaluated (zero limit or zero duration)
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Malformed numeric field in a backend configuration
    #[error("Parse error: {0}")]
    Parse(#[from] std::num::ParseIntError),

    /// Remote store errors (connection, script load)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No backend registered under the requested name
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// A backend is already registered under this name
    #[error("Backend already registered: {0}")]
    DuplicateBackend(String),

    /// The backend was used before `init_rules` completed
    #[error("Backend not initialized: {0}")]
    NotInitialized(String),
}

/// Result type alias for Tokengate operations.
pub type Result<T> = std::result::Result<T, TokengateError>;
