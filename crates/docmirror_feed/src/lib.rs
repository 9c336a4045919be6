//! # Docmirror Feed
//!
//! Ordered change feed over an append-only log of object revisions.
//!
//! This crate provides:
//! - [`SourceLog`], the read seam over a revision log, and [`MemoryLog`]
//! - [`ChangeFeed`], which groups records into transaction-atomic batches
//!   and follows new commits through a [`Notifier`]
//! - [`follow_in_background`] for running a feed on its own thread
//! - Conversion between tids and wall-clock time in [`tid`]

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod feed;
mod follow;
mod notify;
mod record;
mod source;
pub mod tid;

pub use config::FeedConfig;
pub use error::{FeedError, FeedResult};
pub use feed::{Batch, ChangeFeed, FeedState};
pub use follow::{follow_in_background, Follower};
pub use notify::{ChannelNotifier, Notification, Notifier, StopHandle, STOP_PAYLOAD};
pub use record::{LogPosition, Record, Tid, MAX_TID, NO_TID};
pub use source::{MemoryLog, SourceLog};
