//! CLI command implementations.

pub mod decode;
pub mod monitor;
pub mod update;
