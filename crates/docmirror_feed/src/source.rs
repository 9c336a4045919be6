//! The source log seam and an in-memory implementation.

use crate::error::{FeedError, FeedResult};
use crate::notify::{ChannelNotifier, STOP_PAYLOAD};
use crate::record::{LogPosition, Record, Tid};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use tracing::debug;

/// An append-only log of object revisions, ordered by tid.
///
/// Only the current revision of each object is visible: when an object is
/// rewritten, its earlier revisions drop out of reads.
pub trait SourceLog {
    /// Read up to `limit` current records after `after` with
    /// `tid <= through`, ordered by `(tid, object_id)`.
    fn fetch_page(&mut self, after: LogPosition, through: Tid, limit: usize) -> FeedResult<Vec<Record>>;

    /// The highest committed tid, or `None` for an empty log.
    fn max_tid(&mut self) -> FeedResult<Option<Tid>>;

    /// The subset of `object_ids` that still exist in the log.
    fn live_object_ids(&mut self, object_ids: &[u64]) -> FeedResult<HashSet<u64>>;
}

impl<T: SourceLog + ?Sized> SourceLog for &mut T {
    fn fetch_page(&mut self, after: LogPosition, through: Tid, limit: usize) -> FeedResult<Vec<Record>> {
        (**self).fetch_page(after, through, limit)
    }

    fn max_tid(&mut self) -> FeedResult<Option<Tid>> {
        (**self).max_tid()
    }

    fn live_object_ids(&mut self, object_ids: &[u64]) -> FeedResult<HashSet<u64>> {
        (**self).live_object_ids(object_ids)
    }
}

impl<T: SourceLog + ?Sized> SourceLog for Box<T> {
    fn fetch_page(&mut self, after: LogPosition, through: Tid, limit: usize) -> FeedResult<Vec<Record>> {
        (**self).fetch_page(after, through, limit)
    }

    fn max_tid(&mut self) -> FeedResult<Option<Tid>> {
        (**self).max_tid()
    }

    fn live_object_ids(&mut self, object_ids: &[u64]) -> FeedResult<HashSet<u64>> {
        (**self).live_object_ids(object_ids)
    }
}

#[derive(Default)]
struct LogInner {
    /// Stored revisions in commit order.
    revisions: Vec<Record>,
    /// Current tid per object.
    current: HashMap<u64, Tid>,
    last_tid: Option<Tid>,
    keep_history: bool,
    subscribers: Vec<Sender<String>>,
}

/// A thread-safe in-memory source log.
///
/// Clones share the same log, so one handle can feed a [`crate::ChangeFeed`]
/// while another commits.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<RwLock<LogInner>>,
}

impl MemoryLog {
    /// Creates an empty log that keeps only current revisions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty log that keeps every revision.
    pub fn with_history() -> Self {
        let log = Self::default();
        log.inner.write().keep_history = true;
        log
    }

    /// Returns true if the log keeps superseded revisions.
    pub fn keeps_history(&self) -> bool {
        self.inner.read().keep_history
    }

    /// Commit a transaction writing `objects` at `tid` and notify
    /// subscribers.
    ///
    /// # Errors
    ///
    /// Fails if `tid` is not greater than every earlier tid.
    pub fn commit<I>(&self, tid: Tid, objects: I) -> FeedResult<()>
    where
        I: IntoIterator<Item = (u64, Vec<u8>)>,
    {
        let mut inner = self.inner.write();
        if inner.last_tid.is_some_and(|last| tid <= last) {
            return Err(FeedError::source(tid, "tid does not increase"));
        }
        for (object_id, raw) in objects {
            if !inner.keep_history {
                inner.revisions.retain(|r| r.object_id != object_id);
            }
            inner.revisions.push(Record::new(tid, object_id, raw));
            inner.current.insert(object_id, tid);
        }
        inner.last_tid = Some(tid);
        let payload = tid.to_string();
        inner.subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        debug!(tid, "committed to memory log");
        Ok(())
    }

    /// Remove every revision of an object, as packing a deleted object
    /// would.
    pub fn delete(&self, object_id: u64) {
        let mut inner = self.inner.write();
        inner.revisions.retain(|r| r.object_id != object_id);
        inner.current.remove(&object_id);
    }

    /// Subscribe to commit notifications.
    pub fn subscribe(&self) -> ChannelNotifier {
        let (tx, rx) = mpsc::channel();
        self.inner.write().subscribers.push(tx);
        ChannelNotifier::new(rx)
    }

    /// Tell every live follower to stop.
    pub fn stop_followers(&self) {
        let mut inner = self.inner.write();
        inner.subscribers.retain(|tx| tx.send(STOP_PAYLOAD.to_string()).is_ok());
    }

    /// Number of stored revisions, including superseded ones.
    pub fn revision_count(&self) -> usize {
        self.inner.read().revisions.len()
    }

    /// Number of objects with a current revision.
    pub fn object_count(&self) -> usize {
        self.inner.read().current.len()
    }
}

impl SourceLog for MemoryLog {
    fn fetch_page(&mut self, after: LogPosition, through: Tid, limit: usize) -> FeedResult<Vec<Record>> {
        let inner = self.inner.read();
        let mut page: Vec<Record> = inner
            .revisions
            .iter()
            .filter(|r| r.tid <= through && after.precedes(r))
            .filter(|r| inner.current.get(&r.object_id) == Some(&r.tid))
            .cloned()
            .collect();
        page.sort_by_key(|r| (r.tid, r.object_id));
        page.truncate(limit);
        Ok(page)
    }

    fn max_tid(&mut self) -> FeedResult<Option<Tid>> {
        Ok(self.inner.read().current.values().copied().max())
    }

    fn live_object_ids(&mut self, object_ids: &[u64]) -> FeedResult<HashSet<u64>> {
        let inner = self.inner.read();
        Ok(object_ids
            .iter()
            .copied()
            .filter(|oid| inner.current.contains_key(oid))
            .collect())
    }
}

impl std::fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MemoryLog")
            .field("revisions", &inner.revisions.len())
            .field("last_tid", &inner.last_tid)
            .field("keep_history", &inner.keep_history)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_current_revisions_are_read() {
        for mut log in [MemoryLog::new(), MemoryLog::with_history()] {
            log.commit(1, [(1, b"a".to_vec()), (2, b"b".to_vec())]).unwrap();
            log.commit(2, [(1, b"c".to_vec())]).unwrap();
            let page = log.fetch_page(LogPosition::after_tid(-1), 10, 100).unwrap();
            assert_eq!(page, vec![Record::new(1, 2, *b"b"), Record::new(2, 1, *b"c")]);
            assert_eq!(log.max_tid().unwrap(), Some(2));
        }
        let history = MemoryLog::with_history();
        history.commit(1, [(1, vec![])]).unwrap();
        history.commit(2, [(1, vec![])]).unwrap();
        assert_eq!(history.revision_count(), 2);
        assert_eq!(history.object_count(), 1);
    }

    #[test]
    fn pages_respect_position_bound_and_limit() {
        let mut log = MemoryLog::new();
        log.commit(1, (0..5).map(|i| (i, vec![]))).unwrap();
        log.commit(2, [(9, vec![])]).unwrap();
        let after = LogPosition {
            tid: 1,
            object_id: Some(1),
        };
        let page = log.fetch_page(after, 1, 2).unwrap();
        let ids: Vec<_> = page.iter().map(|r| r.object_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn tids_must_increase() {
        let log = MemoryLog::new();
        log.commit(5, []).unwrap();
        assert!(log.commit(5, []).is_err());
    }

    #[test]
    fn deleted_objects_are_not_live() {
        let mut log = MemoryLog::new();
        log.commit(1, [(1, vec![]), (2, vec![])]).unwrap();
        log.delete(2);
        let live = log.live_object_ids(&[1, 2, 3]).unwrap();
        assert_eq!(live, HashSet::from([1]));
        assert_eq!(log.max_tid().unwrap(), Some(1));
    }

    #[test]
    fn commits_notify_subscribers() {
        use crate::notify::{Notification, Notifier};
        use std::time::Duration;

        let log = MemoryLog::new();
        let mut notifier = log.subscribe();
        log.commit(7, []).unwrap();
        assert_eq!(
            notifier.wait(Duration::from_millis(10)).unwrap(),
            Notification::Changed("7".into())
        );
        log.stop_followers();
        assert_eq!(notifier.wait(Duration::from_millis(10)).unwrap(), Notification::Stop);
    }
}
