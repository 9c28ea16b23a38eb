//! Core error types.

use thiserror::Error;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// IO error (reading or writing rule files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A URL could not be interpreted as an absolute http(s) URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// HAR document is structurally unusable.
    #[error("HAR error: {0}")]
    Har(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
