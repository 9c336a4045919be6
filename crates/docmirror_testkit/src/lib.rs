//! # Docmirror Testkit
//!
//! Test utilities for docmirror.
//!
//! This crate provides:
//! - [`PickleWriter`] for building pickle streams at any protocol
//! - Stored-record fixtures and populated in-memory logs
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use docmirror_testkit::prelude::*;
//!
//! let log = populated_log(20, 7);
//! assert_eq!(log.object_count(), 20);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod pickle;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::pickle::*;
}

pub use fixtures::*;
pub use generators::*;
pub use pickle::*;
