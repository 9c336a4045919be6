//! # Docmirror Postgres
//!
//! Postgres implementations of the docmirror seams.
//!
//! - [`PgSource`] reads `object_state` with keyset paging on `(tid, zoid)`.
//! - [`PgNotifier`] listens on `newt_object_state_changed`, installing the
//!   notify trigger on first use.
//! - [`PgStore`] writes the `newt` document table and the
//!   `newt_follow_progress` checkpoint table.
//!
//! Each adapter owns its own connection. A following updater needs all
//! three.
//!
//! ```no_run
//! use docmirror_postgres::{PgNotifier, PgSource, PgStore};
//! use docmirror_sink::{Updater, UpdaterConfig};
//!
//! let dsn = "postgresql://localhost/app";
//! let source = PgSource::connect(dsn).unwrap();
//! let store = PgStore::connect(dsn).unwrap();
//! let mut updater = Updater::new(source, store, UpdaterConfig::new())
//!     .with_notifier(PgNotifier::connect(dsn).unwrap());
//! updater.run().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod notify;
pub mod schema;
mod source;
mod store;

pub use notify::{stop_updates, PgNotifier};
pub use source::PgSource;
pub use store::PgStore;

/// Opens a plain connection, for [`stop_updates`] and ad hoc queries.
pub fn connect(dsn: &str) -> Result<postgres::Client, postgres::Error> {
    postgres::Client::connect(dsn, postgres::NoTls)
}
