//! Error types for the ETL pipeline.
//!
//! Every variant is fatal to the run that produced it. The variants mirror
//! where the failure came from so the caller (or whatever re-runs the job)
//! can tell an upstream outage from a bad document.

use thiserror::Error;

/// Main error type for all pipeline operations.
#[derive(Debug, Error)]
pub enum EtlError {
    /// The catalog API rejected or failed a request.
    #[error("catalog API error: {0}")]
    Catalog(String),

    /// The catalog API answered HTTP 429.
    #[error("catalog API rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    /// A raw document is missing a field, has the wrong shape, or carries an
    /// unparseable value.
    #[error("malformed document {key}: {reason}")]
    Malformed { key: String, reason: String },

    /// Object store request failed.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid or incomplete configuration.
    #[error("config error: {0}")]
    Config(String),

    /// CSV serialization failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EtlError {
    pub fn malformed(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        EtlError::Malformed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, EtlError>;
