//! Error types for the sink.

use docmirror_feed::FeedError;
use thiserror::Error;

/// Result type for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;

/// Errors that can occur while mirroring records into a document store.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The document store failed.
    #[error("store error: {message}")]
    Store {
        /// Error message.
        message: String,
    },

    /// Reading the source log failed.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// The destination schema does not fit the running mode.
    #[error("configuration inconsistency: {message}")]
    ConfigInconsistency {
        /// What is wrong and how to fix it.
        message: String,
    },
}

impl SinkError {
    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a configuration inconsistency error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigInconsistency {
            message: message.into(),
        }
    }

    /// Returns true if retrying the run later may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ConfigInconsistency { .. })
    }
}
