//! # Docmirror Sink
//!
//! Applies a change feed to a document store.
//!
//! - [`DocumentStore`] is the transactional destination seam, with
//!   [`MemoryStore`] for tests and embedding.
//! - [`Updater`] owns the checkpoint, garbage collection, redo runs and
//!   batch application.
//! - [`monitor::check`] reports how far the destination lags the source.
//!
//! ## Usage
//!
//! ```rust
//! use docmirror_feed::MemoryLog;
//! use docmirror_sink::{MemoryStore, Updater, UpdaterConfig};
//!
//! let log = MemoryLog::new();
//! let store = MemoryStore::new();
//! let mut updater = Updater::new(log, store.clone(), UpdaterConfig::new());
//! let summary = updater.run().unwrap();
//! assert_eq!(summary.records, 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
pub mod monitor;
mod store;
mod updater;

pub use config::{GcMode, UpdaterConfig};
pub use error::{SinkError, SinkResult};
pub use monitor::{LagReport, LagThresholds, Status};
pub use store::{Document, DocumentStore, MemoryStore};
pub use updater::{RunSummary, Updater};
