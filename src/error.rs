//! Error types for the upstream core

use thiserror::Error;

use crate::connector::SourceId;

/// Result type alias for the upstream core
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Classification of a connector error, used by the retry policy to
/// decide whether another attempt can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts and transient network failures; another attempt may succeed.
    Retryable,
    /// Malformed requests and other deterministic failures; retrying is wasted work.
    NonRetryable,
}

/// Main error type for the upstream core
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// A cache tier could not be reached; degrades to a miss
    #[error("cache tier unavailable: {0}")]
    CacheUnavailable(String),

    /// The circuit for this source is open; the call was never made
    #[error("circuit open for source '{source}'")]
    CircuitOpen { source: SourceId },

    /// All retry attempts were consumed; wraps the last connector error
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        last: Box<UpstreamError>,
    },

    /// A job or batch deadline elapsed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Batch submission rejected before any job ran
    #[error("capacity exceeded: {outstanding} outstanding jobs, limit {limit}")]
    CapacityExceeded { outstanding: usize, limit: usize },

    /// An error returned by an upstream connector
    #[error("connector error: {message}")]
    Connector { class: ErrorClass, message: String },

    /// A malformed batch submission (empty ids, duplicate ids)
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpstreamError {
    /// Shorthand for a retryable connector failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Connector {
            class: ErrorClass::Retryable,
            message: message.into(),
        }
    }

    /// Shorthand for a non-retryable connector failure.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::Connector {
            class: ErrorClass::NonRetryable,
            message: message.into(),
        }
    }
}

/// Determine if an error is worth another attempt
pub fn is_retryable(error: &UpstreamError) -> bool {
    match error {
        UpstreamError::Connector { class, .. } => *class == ErrorClass::Retryable,
        UpstreamError::Io(_) => true, // network issues
        UpstreamError::CacheUnavailable(_) => false,
        UpstreamError::CircuitOpen { .. } => false,
        UpstreamError::DeadlineExceeded => false,
        UpstreamError::RetryExhausted { .. } => false,
        UpstreamError::CapacityExceeded { .. } => false,
        _ => false,
    }
}
