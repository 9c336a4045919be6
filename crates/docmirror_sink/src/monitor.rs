//! Replication lag check for process monitors.

use crate::error::SinkResult;
use crate::store::DocumentStore;
use docmirror_feed::tid::lag_seconds;
use docmirror_feed::{SourceLog, Tid};
use std::fmt;
use tracing::warn;

/// Outcome class of a lag check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// Caught up, or nothing to do.
    Ok,
    /// Behind by at least the warning threshold.
    Warning,
    /// Too far behind, or an inconsistent state.
    Error,
}

impl Status {
    /// Process exit code for this status.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Warning => 1,
            Self::Error => 2,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        })
    }
}

/// Warning and error thresholds, in seconds of lag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagThresholds {
    /// Lag at or above this is a warning.
    pub warning: f64,
    /// Lag at or above this is an error.
    pub error: f64,
}

impl LagThresholds {
    /// Creates thresholds.
    pub const fn new(warning: f64, error: f64) -> Self {
        Self { warning, error }
    }

    /// Classifies a lag.
    pub fn classify(&self, lag: f64) -> Status {
        if lag < self.warning {
            Status::Ok
        } else if lag < self.error {
            Status::Warning
        } else {
            Status::Error
        }
    }
}

/// Result of a lag check.
#[derive(Debug, Clone, PartialEq)]
pub struct LagReport {
    /// Outcome class.
    pub status: Status,
    /// Human-readable summary.
    pub message: String,
    /// Seconds between the checkpoint and the newest source commit, when
    /// both exist.
    pub lag: Option<f64>,
}

impl LagReport {
    fn new(status: Status, message: &str, lag: Option<f64>) -> Self {
        Self {
            status,
            message: message.to_string(),
            lag,
        }
    }

    /// Process exit code.
    pub fn exit_code(&self) -> u8 {
        self.status.exit_code()
    }

    /// The single status line, with the lag as a metric when measured.
    pub fn line(&self) -> String {
        match self.lag {
            Some(lag) => format!("{} | {lag:.3}", self.message),
            None => self.message.clone(),
        }
    }
}

impl fmt::Display for LagReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line())
    }
}

/// Compares the checkpoint of `client_id` with the newest source commit.
///
/// Reads only; nothing is created or committed.
pub fn check<S, D>(source: &mut S, store: &mut D, client_id: &str, thresholds: LagThresholds) -> SinkResult<LagReport>
where
    S: SourceLog + ?Sized,
    D: DocumentStore + ?Sized,
{
    if !store.checkpoint_table_exists()? {
        return Ok(anomaly(Status::Error, "Updater has not run"));
    }
    let checkpoint = store.load_checkpoint(client_id)?.filter(|tid| *tid >= 0);
    let newest = source.max_tid()?;
    let report = match (checkpoint, newest) {
        (None, None) => LagReport::new(Status::Ok, "No transactions", None),
        (Some(_), None) => anomaly(Status::Error, "Updater saw data but there was None"),
        (None, Some(_)) => anomaly(Status::Error, "Updater hasn't done anything"),
        (Some(checkpoint), Some(newest)) => compare(checkpoint, newest, thresholds),
    };
    Ok(report)
}

fn compare(checkpoint: Tid, newest: Tid, thresholds: LagThresholds) -> LagReport {
    if checkpoint > newest {
        return anomaly(Status::Error, "Updater is ahead");
    }
    let lag = lag_seconds(checkpoint, newest).unwrap_or(0.0).max(0.0);
    let status = thresholds.classify(lag);
    let message = match status {
        Status::Ok => "OK",
        Status::Warning => "Updater is behind",
        Status::Error => "Updater is too far behind",
    };
    LagReport::new(status, message, Some(lag))
}

fn anomaly(status: Status, message: &str) -> LagReport {
    warn!(%status, message, "monitor anomaly");
    LagReport::new(status, message, None)
}
