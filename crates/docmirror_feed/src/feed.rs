//! Transaction-atomic batches over a source log.
//!
//! A [`ChangeFeed`] reads a [`SourceLog`] in `(tid, object_id)` order and
//! hands out [`Batch`]es. A batch never splits a transaction: once it holds
//! `batch_limit` records it ends at the next tid boundary.
//!
//! The feed first catches up on committed history. With a [`Notifier`]
//! and no end tid it then goes live, pulling again after every
//! notification or poll timeout, until a stop is requested.
//!
//! # Usage
//!
//! ```rust
//! use docmirror_feed::{ChangeFeed, FeedConfig, MemoryLog};
//!
//! let log = MemoryLog::new();
//! log.commit(1, [(10, b"a".to_vec()), (11, b"b".to_vec())]).unwrap();
//!
//! let mut feed = ChangeFeed::new(log.clone(), FeedConfig::new());
//! while let Some(batch) = feed.next_batch() {
//!     for record in batch {
//!         let record = record.unwrap();
//!         assert_eq!(record.tid, 1);
//!     }
//! }
//! assert_eq!(feed.last_tid(), 1);
//! ```

use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::notify::{Notification, Notifier, StopHandle};
use crate::record::{LogPosition, Record, Tid, MAX_TID};
use crate::source::SourceLog;
use std::collections::VecDeque;
use tracing::{debug, error, info};

/// Where a feed is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Reading committed history.
    CatchingUp,
    /// Caught up and following notifications.
    Live,
    /// Finished; no more batches.
    Drained,
}

/// A pull-based feed of transaction-atomic batches.
pub struct ChangeFeed<S> {
    source: S,
    config: FeedConfig,
    /// Tid of the last record handed out.
    tid: Tid,
    state: FeedState,
    notifier: Option<Box<dyn Notifier + Send>>,
    stop: StopHandle,
    /// A live pull should happen before the next wait.
    pull_pending: bool,
}

impl<S: SourceLog> ChangeFeed<S> {
    /// Creates a feed that starts after `config.start_tid`.
    pub fn new(source: S, config: FeedConfig) -> Self {
        Self {
            source,
            tid: config.start_tid,
            config,
            state: FeedState::CatchingUp,
            notifier: None,
            stop: StopHandle::new(),
            pull_pending: false,
        }
    }

    /// Follow new commits through `notifier` once caught up.
    ///
    /// Ignored when the configuration has an end tid.
    #[must_use]
    pub fn with_notifier<N>(mut self, notifier: N) -> Self
    where
        N: Notifier + Send + 'static,
    {
        self.notifier = Some(Box::new(notifier));
        self
    }

    /// Use an existing stop handle instead of a fresh one.
    #[must_use]
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// A handle that ends a live feed after its current wait.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Tid of the last record handed out, or the start tid.
    pub fn last_tid(&self) -> Tid {
        self.tid
    }

    /// Current life-cycle state.
    pub fn state(&self) -> FeedState {
        self.state
    }

    /// The configuration.
    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Mutable access to the source, for queries between batches.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Consumes the feed, returning its source.
    pub fn into_source(self) -> S {
        self.source
    }

    fn follows(&self) -> bool {
        self.config.end_tid.is_none() && self.notifier.is_some()
    }

    fn through(&self) -> Tid {
        self.config.end_tid.unwrap_or(MAX_TID)
    }

    fn fetch(&mut self, after: LogPosition) -> FeedResult<Vec<Record>> {
        let (tid, through) = (self.tid, self.through());
        self.source
            .fetch_page(after, through, self.config.page_size)
            .map_err(|err| {
                error!(tid, error = %err, "reading updates failed");
                err
            })
    }

    /// Returns the next batch, or `None` once the feed is drained.
    ///
    /// A live feed blocks here until new records arrive or it is stopped.
    /// Source and notification failures surface as the batch's only item.
    pub fn next_batch(&mut self) -> Option<Batch<'_, S>> {
        loop {
            match self.state {
                FeedState::Drained => return None,
                FeedState::CatchingUp => {
                    let page = match self.fetch(LogPosition::after_tid(self.tid)) {
                        Ok(page) => page,
                        Err(err) => return Some(Batch::failed(self, err)),
                    };
                    if !page.is_empty() {
                        return Some(Batch::new(self, page));
                    }
                    if !self.follows() {
                        debug!(tid = self.tid, "feed drained");
                        self.state = FeedState::Drained;
                        return None;
                    }
                    if let Some(notifier) = self.notifier.as_mut() {
                        if let Err(err) = notifier.listen() {
                            self.state = FeedState::Drained;
                            return Some(Batch::failed(self, err));
                        }
                    }
                    info!(tid = self.tid, "caught up, following changes");
                    self.state = FeedState::Live;
                    self.pull_pending = true;
                }
                FeedState::Live => {
                    if self.stop.is_stopped() {
                        self.state = FeedState::Drained;
                        return None;
                    }
                    if self.pull_pending {
                        self.pull_pending = false;
                        let page = match self.fetch(LogPosition::after_tid(self.tid)) {
                            Ok(page) => page,
                            Err(err) => return Some(Batch::failed(self, err)),
                        };
                        if !page.is_empty() {
                            self.pull_pending = true;
                            return Some(Batch::new(self, page));
                        }
                        continue;
                    }
                    let timeout = self.config.poll_timeout;
                    let Some(notifier) = self.notifier.as_mut() else {
                        self.state = FeedState::Drained;
                        return None;
                    };
                    match notifier.wait(timeout) {
                        Ok(Notification::Changed(_) | Notification::Timeout) => {
                            self.pull_pending = true;
                        }
                        Ok(Notification::Stop) => {
                            debug!(tid = self.tid, "stop notification received");
                            self.state = FeedState::Drained;
                            return None;
                        }
                        Err(err) => {
                            error!(error = %err, "waiting for notifications failed");
                            self.state = FeedState::Drained;
                            return Some(Batch::failed(self, err));
                        }
                    }
                }
            }
        }
    }
}

impl<S> std::fmt::Debug for ChangeFeed<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("tid", &self.tid)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One transaction-atomic batch of records.
///
/// Iterating advances the owning feed's tid. Dropping a batch partway
/// through a transaction skips the rest of that transaction on the next
/// pull.
pub struct Batch<'a, S: SourceLog> {
    feed: &'a mut ChangeFeed<S>,
    page: VecDeque<Record>,
    position: LogPosition,
    current_tid: Option<Tid>,
    yielded: usize,
    /// The source has no records past the buffered page.
    exhausted: bool,
    error: Option<FeedError>,
    done: bool,
}

impl<'a, S: SourceLog> Batch<'a, S> {
    fn new(feed: &'a mut ChangeFeed<S>, page: Vec<Record>) -> Self {
        let exhausted = page.len() < feed.config.page_size;
        let position = LogPosition::after_tid(feed.tid);
        Self {
            feed,
            page: page.into(),
            position,
            current_tid: None,
            yielded: 0,
            exhausted,
            error: None,
            done: false,
        }
    }

    fn failed(feed: &'a mut ChangeFeed<S>, error: FeedError) -> Self {
        let mut batch = Self::new(feed, Vec::new());
        batch.error = Some(error);
        batch
    }

    /// Number of records yielded so far.
    pub fn len(&self) -> usize {
        self.yielded
    }

    /// Returns true if nothing has been yielded yet.
    pub fn is_empty(&self) -> bool {
        self.yielded == 0
    }

    /// Tid of the transaction being read.
    pub fn current_tid(&self) -> Option<Tid> {
        self.current_tid
    }
}

impl<S: SourceLog> Iterator for Batch<'_, S> {
    type Item = FeedResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(err) = self.error.take() {
            self.done = true;
            return Some(Err(err));
        }
        if self.page.is_empty() {
            if self.exhausted {
                self.done = true;
                return None;
            }
            match self.feed.fetch(self.position) {
                Ok(page) => {
                    self.exhausted = page.len() < self.feed.config.page_size;
                    self.page = page.into();
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        let Some(record) = self.page.pop_front() else {
            self.done = true;
            return None;
        };
        if self.current_tid != Some(record.tid) {
            // A batch always takes its first transaction.
            if self.yielded > 0 && self.yielded >= self.feed.config.batch_limit {
                self.done = true;
                return None;
            }
            self.current_tid = Some(record.tid);
            self.feed.tid = record.tid;
        }
        self.position = LogPosition::after_record(&record);
        self.yielded += 1;
        Some(Ok(record))
    }
}

impl<S: SourceLog> std::fmt::Debug for Batch<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("current_tid", &self.current_tid)
            .field("yielded", &self.yielded)
            .field("buffered", &self.page.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryLog;
    use std::collections::HashSet;

    /// A source that fails every read.
    struct BrokenLog;

    impl SourceLog for BrokenLog {
        fn fetch_page(&mut self, after: LogPosition, _: Tid, _: usize) -> FeedResult<Vec<Record>> {
            Err(FeedError::source(after.tid, "connection reset"))
        }

        fn max_tid(&mut self) -> FeedResult<Option<Tid>> {
            Ok(None)
        }

        fn live_object_ids(&mut self, _: &[u64]) -> FeedResult<HashSet<u64>> {
            Ok(HashSet::new())
        }
    }

    fn batch_sizes<S: SourceLog>(feed: &mut ChangeFeed<S>) -> Vec<usize> {
        let mut sizes = Vec::new();
        while let Some(batch) = feed.next_batch() {
            sizes.push(batch.map(|r| r.unwrap()).count());
        }
        sizes
    }

    #[test]
    fn empty_log_drains_immediately() {
        let mut feed = ChangeFeed::new(MemoryLog::new(), FeedConfig::new());
        assert!(feed.next_batch().is_none());
        assert_eq!(feed.state(), FeedState::Drained);
        assert_eq!(feed.last_tid(), -1);
    }

    #[test]
    fn batches_end_on_transaction_boundaries() {
        let log = MemoryLog::new();
        for tid in 1..=4 {
            log.commit(tid, (0..3).map(|i| (tid as u64 * 10 + i, vec![]))).unwrap();
        }
        let config = FeedConfig::new().batch_limit(4).page_size(2);
        let mut feed = ChangeFeed::new(log, config);
        assert_eq!(batch_sizes(&mut feed), vec![6, 6]);
        assert_eq!(feed.last_tid(), 4);
    }

    #[test]
    fn start_and_end_tids_bound_the_scan() {
        let log = MemoryLog::new();
        for tid in 1..=5 {
            log.commit(tid, [(tid as u64, vec![])]).unwrap();
        }
        let config = FeedConfig::new().start_tid(1).end_tid(Some(3));
        let mut feed = ChangeFeed::new(log, config).with_notifier(MemoryLog::new().subscribe());
        let batch: Vec<_> = feed.next_batch().unwrap().map(|r| r.unwrap().tid).collect();
        assert_eq!(batch, vec![2, 3]);
        assert!(feed.next_batch().is_none());
    }

    #[test]
    fn dropped_batch_resumes_after_its_tid() {
        let log = MemoryLog::new();
        log.commit(1, [(1, vec![]), (2, vec![])]).unwrap();
        log.commit(2, [(3, vec![])]).unwrap();
        let mut feed = ChangeFeed::new(log, FeedConfig::new());
        {
            let mut batch = feed.next_batch().unwrap();
            assert_eq!(batch.next().unwrap().unwrap().object_id, 1);
        }
        let rest: Vec<_> = feed.next_batch().unwrap().map(|r| r.unwrap().object_id).collect();
        assert_eq!(rest, vec![3]);
    }

    #[test]
    fn source_errors_surface_in_the_batch() {
        let mut feed = ChangeFeed::new(BrokenLog, FeedConfig::new().start_tid(7));
        let mut batch = feed.next_batch().unwrap();
        match batch.next() {
            Some(Err(FeedError::Source { tid, .. })) => assert_eq!(tid, 7),
            other => panic!("expected source error, got {other:?}"),
        }
        assert!(batch.next().is_none());
    }

    #[test]
    fn stop_handle_ends_live_feed() {
        let log = MemoryLog::new();
        log.commit(1, [(1, vec![])]).unwrap();
        let mut feed = ChangeFeed::new(log.clone(), FeedConfig::new()).with_notifier(log.subscribe());
        assert_eq!(feed.next_batch().unwrap().count(), 1);
        feed.stop_handle().stop();
        assert!(feed.next_batch().is_none());
        assert_eq!(feed.state(), FeedState::Drained);
    }
}
