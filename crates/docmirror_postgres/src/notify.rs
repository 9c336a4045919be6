//! LISTEN/NOTIFY as a [`Notifier`].

use crate::schema::{self, NOTIFY_CHANNEL, NOTIFY_TRIGGER, NOTIFY_TRIGGER_DDL};
use docmirror_feed::{FeedError, FeedResult, Notification, Notifier, STOP_PAYLOAD};
use postgres::fallible_iterator::FallibleIterator;
use postgres::{Client, NoTls};
use std::time::Duration;
use tracing::{debug, info};

/// Waits for commit notifications on a dedicated connection.
///
/// The notify trigger is installed on `object_state` by the first
/// [`Notifier::listen`] if it is missing.
pub struct PgNotifier {
    client: Client,
}

impl PgNotifier {
    /// Opens the notification connection.
    pub fn connect(dsn: &str) -> FeedResult<Self> {
        let client = Client::connect(dsn, NoTls).map_err(notify_error)?;
        Ok(Self::new(client))
    }

    /// Wraps an open connection. It should not be used for anything else.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Notifier for PgNotifier {
    fn listen(&mut self) -> FeedResult<()> {
        if !schema::trigger_exists(&mut self.client, NOTIFY_TRIGGER).map_err(notify_error)? {
            info!("installing notify trigger");
            self.client.batch_execute(NOTIFY_TRIGGER_DDL).map_err(notify_error)?;
        }
        self.client
            .batch_execute(&format!("listen {NOTIFY_CHANNEL}"))
            .map_err(notify_error)?;
        debug!(channel = NOTIFY_CHANNEL, "listening");
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> FeedResult<Notification> {
        let mut notifications = self.client.notifications();
        let Some(first) = notifications.timeout_iter(timeout).next().map_err(notify_error)? else {
            return Ok(Notification::Timeout);
        };
        let mut payloads = vec![first.payload().to_string()];
        let mut pending = notifications.iter();
        while let Some(next) = pending.next().map_err(notify_error)? {
            payloads.push(next.payload().to_string());
        }
        Ok(Notification::from_payloads(payloads).unwrap_or(Notification::Timeout))
    }
}

impl std::fmt::Debug for PgNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotifier").finish_non_exhaustive()
    }
}

/// Tells every waiting follower to stop.
///
/// Followers that are busy reading finish their current pull first.
pub fn stop_updates(client: &mut Client) -> FeedResult<()> {
    client
        .batch_execute(&format!("notify {NOTIFY_CHANNEL}, '{STOP_PAYLOAD}'"))
        .map_err(notify_error)
}

fn notify_error(err: postgres::Error) -> FeedError {
    FeedError::notify(err.to_string())
}
