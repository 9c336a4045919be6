//! Update command implementation.

use docmirror_postgres::{PgNotifier, PgSource, PgStore};
use docmirror_sink::{GcMode, SinkError, Updater, UpdaterConfig};
use std::time::Duration;
use tracing::error;

/// Options for the update command.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Change-poll timeout in seconds.
    pub poll_timeout: u64,
    /// Soft batch size.
    pub transaction_size_limit: usize,
    /// Drop the legacy delete trigger instead of failing.
    pub remove_delete_trigger: bool,
    /// Collect garbage and exit.
    pub gc_only: bool,
    /// Skip startup garbage collection.
    pub no_gc: bool,
    /// Redo through the checkpoint.
    pub redo: bool,
    /// Checkpoint key.
    pub client_id: String,
}

impl UpdateOptions {
    fn config(&self) -> UpdaterConfig {
        let gc = if self.gc_only {
            GcMode::Only
        } else if self.no_gc {
            GcMode::Skip
        } else {
            GcMode::OnStart
        };
        UpdaterConfig::new()
            .client_id(self.client_id.as_str())
            .poll_timeout(Duration::from_secs(self.poll_timeout))
            .batch_limit(self.transaction_size_limit)
            .gc(gc)
            .remove_legacy_trigger(self.remove_delete_trigger)
            .redo(self.redo)
    }

    fn follows(&self) -> bool {
        !self.redo && !self.gc_only
    }
}

/// Runs the update command, returning the exit code.
pub fn run(dsn: &str, options: &UpdateOptions) -> Result<u8, Box<dyn std::error::Error>> {
    let source = PgSource::connect(dsn)?;
    let store = PgStore::connect(dsn)?;
    let mut updater = Updater::new(source, store, options.config());
    if options.follows() {
        updater = updater.with_notifier(PgNotifier::connect(dsn)?);
    }

    match updater.run() {
        Ok(summary) => {
            if options.gc_only {
                println!("Removed {} documents", summary.collected);
            }
            Ok(0)
        }
        Err(SinkError::ConfigInconsistency { message }) => {
            error!("{message}");
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}
