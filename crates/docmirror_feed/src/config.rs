//! Change feed configuration.

use crate::record::{Tid, NO_TID};
use std::time::Duration;

/// Configuration for a [`crate::ChangeFeed`].
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Records with tids at or below this are skipped.
    pub start_tid: Tid,

    /// Inclusive upper bound. When set, the feed never waits for
    /// notifications and drains once the bound is read.
    pub end_tid: Option<Tid>,

    /// Soft cap on records per batch. A batch ends at the first
    /// transaction boundary after this many records.
    pub batch_limit: usize,

    /// Records fetched from the source per round trip.
    pub page_size: usize,

    /// How long a live feed waits for a notification before pulling anyway.
    pub poll_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            start_tid: NO_TID,
            end_tid: None,
            batch_limit: 100_000,
            page_size: 100,
            poll_timeout: Duration::from_secs(300),
        }
    }
}

impl FeedConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tid to start after.
    #[must_use]
    pub const fn start_tid(mut self, tid: Tid) -> Self {
        self.start_tid = tid;
        self
    }

    /// Sets the inclusive end tid.
    #[must_use]
    pub const fn end_tid(mut self, tid: Option<Tid>) -> Self {
        self.end_tid = tid;
        self
    }

    /// Sets the soft batch size. Zero is treated as one.
    #[must_use]
    pub const fn batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = if limit == 0 { 1 } else { limit };
        self
    }

    /// Sets the page size. Zero is treated as one.
    #[must_use]
    pub const fn page_size(mut self, size: usize) -> Self {
        self.page_size = if size == 0 { 1 } else { size };
        self
    }

    /// Sets the live poll timeout.
    #[must_use]
    pub const fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}
