//! Updater configuration.

use std::time::Duration;

/// When the updater removes documents whose objects are gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcMode {
    /// Collect once at startup, then follow.
    #[default]
    OnStart,
    /// Never collect.
    Skip,
    /// Collect, commit and exit without following.
    Only,
}

/// Configuration for an [`crate::Updater`].
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Checkpoint key for this updater.
    pub client_id: String,

    /// How long a live updater waits for a notification before polling.
    pub poll_timeout: Duration,

    /// Soft cap on records per batch, see [`docmirror_feed::FeedConfig`].
    pub batch_limit: usize,

    /// Records written per delete-then-insert round.
    pub chunk_size: usize,

    /// Records fetched from the source per round trip.
    pub page_size: usize,

    /// Garbage collection mode.
    pub gc: GcMode,

    /// Drop an incompatible legacy delete trigger instead of failing.
    pub remove_legacy_trigger: bool,

    /// Reprocess everything up to the saved checkpoint, then stop.
    pub redo: bool,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            client_id: "docmirror.updater".to_string(),
            poll_timeout: Duration::from_secs(30),
            batch_limit: 100_000,
            chunk_size: 100,
            page_size: 100,
            gc: GcMode::OnStart,
            remove_legacy_trigger: false,
            redo: false,
        }
    }
}

impl UpdaterConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the checkpoint key.
    #[must_use]
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Sets the live poll timeout.
    #[must_use]
    pub const fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the soft batch size. Zero is treated as one.
    #[must_use]
    pub const fn batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = if limit == 0 { 1 } else { limit };
        self
    }

    /// Sets the write chunk size. Zero is treated as one.
    #[must_use]
    pub const fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = if size == 0 { 1 } else { size };
        self
    }

    /// Sets the source page size. Zero is treated as one.
    #[must_use]
    pub const fn page_size(mut self, size: usize) -> Self {
        self.page_size = if size == 0 { 1 } else { size };
        self
    }

    /// Sets the garbage collection mode.
    #[must_use]
    pub const fn gc(mut self, mode: GcMode) -> Self {
        self.gc = mode;
        self
    }

    /// Sets whether a legacy delete trigger may be removed.
    #[must_use]
    pub const fn remove_legacy_trigger(mut self, value: bool) -> Self {
        self.remove_legacy_trigger = value;
        self
    }

    /// Sets redo mode.
    #[must_use]
    pub const fn redo(mut self, value: bool) -> Self {
        self.redo = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sizes_are_treated_as_one() {
        let config = UpdaterConfig::new().batch_limit(0).chunk_size(0).page_size(0);
        assert_eq!(config.batch_limit, 1);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.page_size, 1);
    }
}
