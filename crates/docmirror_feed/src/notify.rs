//! Change notifications and cooperative stopping.

use crate::error::{FeedError, FeedResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

/// Notification payload that tells live followers to finish.
pub const STOP_PAYLOAD: &str = "STOP";

/// The outcome of one wait for changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// New data was committed; carries the most recent payload (usually
    /// the committing tid as text).
    Changed(String),
    /// The wait timed out without a notification.
    Timeout,
    /// A stop was requested.
    Stop,
}

impl Notification {
    /// Collapses a burst of payloads into one notification. A stop
    /// anywhere in the burst wins.
    pub fn from_payloads<I>(payloads: I) -> Option<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut last = None;
        for payload in payloads {
            if payload == STOP_PAYLOAD {
                return Some(Self::Stop);
            }
            last = Some(payload);
        }
        last.map(Self::Changed)
    }
}

/// A push channel on which the source signals new commits.
pub trait Notifier {
    /// Start listening. Called once, before the feed's first live pull.
    fn listen(&mut self) -> FeedResult<()>;

    /// Wait up to `timeout` for a notification.
    fn wait(&mut self, timeout: Duration) -> FeedResult<Notification>;
}

impl<T: Notifier + ?Sized> Notifier for Box<T> {
    fn listen(&mut self) -> FeedResult<()> {
        (**self).listen()
    }

    fn wait(&mut self, timeout: Duration) -> FeedResult<Notification> {
        (**self).wait(timeout)
    }
}

/// A [`Notifier`] fed by an in-process channel of payload strings.
#[derive(Debug)]
pub struct ChannelNotifier {
    receiver: Receiver<String>,
}

impl ChannelNotifier {
    /// Wraps a receiver.
    pub fn new(receiver: Receiver<String>) -> Self {
        Self { receiver }
    }
}

impl Notifier for ChannelNotifier {
    fn listen(&mut self) -> FeedResult<()> {
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> FeedResult<Notification> {
        let first = match self.receiver.recv_timeout(timeout) {
            Ok(payload) => payload,
            Err(RecvTimeoutError::Timeout) => return Ok(Notification::Timeout),
            Err(RecvTimeoutError::Disconnected) => return Err(FeedError::Closed),
        };
        let mut burst = vec![first];
        loop {
            match self.receiver.try_recv() {
                Ok(payload) => burst.push(payload),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        Ok(Notification::from_payloads(burst).unwrap_or(Notification::Timeout))
    }
}

/// A shared flag that asks a live feed to finish after its current wait.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Creates a handle in the running state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
