//! Running a feed on a background thread.

use crate::error::FeedResult;
use crate::feed::ChangeFeed;
use crate::notify::StopHandle;
use crate::record::Record;
use crate::source::SourceLog;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// A feed running on its own thread.
///
/// Batches arrive on [`Follower::receiver`] as materialized vectors. The
/// channel is bounded, so a slow consumer holds the feed back.
#[derive(Debug)]
pub struct Follower {
    /// Completed batches.
    pub receiver: Receiver<Vec<Record>>,
    handle: JoinHandle<FeedResult<()>>,
    stop: StopHandle,
}

impl Follower {
    /// Asks the feed to finish after its current wait.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Waits for the feed thread to finish and returns its outcome.
    ///
    /// A panic on the feed thread is resumed on the caller.
    pub fn join(self) -> FeedResult<()> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Spawn `feed` on a thread, sending each batch over a channel holding at
/// most `capacity` batches.
///
/// The thread ends when the feed drains, a batch fails, or the receiver
/// is dropped.
pub fn follow_in_background<S>(mut feed: ChangeFeed<S>, capacity: usize) -> Follower
where
    S: SourceLog + Send + 'static,
{
    let (tx, receiver) = mpsc::sync_channel(capacity);
    let stop = feed.stop_handle();
    let handle = thread::spawn(move || {
        while let Some(batch) = feed.next_batch() {
            let records = batch.collect::<FeedResult<Vec<_>>>()?;
            if tx.send(records).is_err() {
                debug!("follower receiver dropped");
                break;
            }
        }
        Ok(())
    });
    Follower {
        receiver,
        handle,
        stop,
    }
}
