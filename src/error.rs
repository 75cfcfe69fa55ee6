//! Error types for the gatelimit crate.

use thiserror::Error;

/// Main error type for gatelimit operations.
#[derive(Error, Debug)]
pub enum GatelimitError {
    /// Configuration rejected at construction time.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The counter store could not be reached, or an operation timed out.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// The key extractor produced no identity key for a request.
    #[error("Key extraction produced no identity key")]
    KeyExtraction,
}

/// Result type alias for gatelimit operations.
pub type Result<T> = std::result::Result<T, GatelimitError>;
