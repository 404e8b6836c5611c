//! Error types for zonelimit.

use thiserror::Error;

pub use crate::ratelimit::{ConfigError, StoreError};

/// Main error type for zonelimit operations.
#[derive(Error, Debug)]
pub enum ZonelimitError {
    /// Malformed rate limit directive
    #[error("Directive error: {0}")]
    Directive(#[from] ConfigError),

    /// Service configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for zonelimit operations.
pub type Result<T> = std::result::Result<T, ZonelimitError>;
