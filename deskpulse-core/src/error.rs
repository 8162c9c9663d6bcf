//! Error types for deskpulse-core

use thiserror::Error;

/// Main error type for the deskpulse-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image decode/encode error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Screen capture failed; the tick is skipped
    #[error("capture error: {0}")]
    Capture(String),

    /// Retryable analysis failure (network, timeout, rate limit, 5xx)
    #[error("transient analysis error: {0}")]
    TransientAnalysis(String),

    /// Non-retryable analysis failure (malformed batch, payload too large)
    #[error("permanent analysis error: {0}")]
    PermanentAnalysis(String),

    /// Durable write failed for a single item
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Prior state could not be loaded at startup
    #[error("recovery error: {0}")]
    Recovery(String),
}

impl Error {
    /// Whether a failed analysis attempt may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientAnalysis(_))
    }
}

/// Result type alias for deskpulse-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransientAnalysis("HTTP 503".to_string()).is_transient());
        assert!(!Error::PermanentAnalysis("HTTP 413".to_string()).is_transient());
        assert!(!Error::Capture("no display".to_string()).is_transient());
    }
}
