//! Error types for the change feed.

use crate::record::Tid;
use thiserror::Error;

/// Result type for feed operations.
pub type FeedResult<T> = Result<T, FeedError>;

/// Errors that can occur while reading the source log.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Reading records after a tid failed.
    #[error("reading updates after tid {tid} failed: {message}")]
    Source {
        /// The tid the failed read started after.
        tid: Tid,
        /// Error message.
        message: String,
    },

    /// Listening for or receiving change notifications failed.
    #[error("notification error: {message}")]
    Notify {
        /// Error message.
        message: String,
    },

    /// A source log query unrelated to paging failed.
    #[error("source query failed: {0}")]
    Query(String),

    /// The notification channel was closed by the source.
    #[error("notification channel closed")]
    Closed,
}

impl FeedError {
    /// Create a source read error.
    pub fn source(tid: Tid, message: impl Into<String>) -> Self {
        Self::Source {
            tid,
            message: message.into(),
        }
    }

    /// Create a notification error.
    pub fn notify(message: impl Into<String>) -> Self {
        Self::Notify {
            message: message.into(),
        }
    }

    /// Create a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }
}
