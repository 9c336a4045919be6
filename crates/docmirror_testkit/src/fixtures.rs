//! Test fixtures: stored-record builders and populated logs.

use crate::pickle::PickleWriter;
use chrono::{TimeDelta, TimeZone, Utc};
use docmirror_feed::tid::timestamp_to_tid;
use docmirror_feed::{MemoryLog, Tid};

/// Builds a stored record: a `(class, None)` class pickle followed by a
/// state pickle written by `state`. Both pickles share one memo, as they
/// do when a database pickles an object.
pub fn record<F>(protocol: u8, module: &str, name: &str, state: F) -> Vec<u8>
where
    F: FnOnce(&mut PickleWriter),
{
    let mut w = PickleWriter::new(protocol);
    w.global(module, name);
    w.memoize();
    w.none().tuple_n(2);
    w.memoize();
    w.stop();
    if protocol >= 2 {
        w.raw(&[0x80, protocol]);
    }
    state(&mut w);
    w.finish()
}

/// A record whose state is a flat dict of integer fields.
pub fn dict_record(module: &str, name: &str, fields: &[(&str, i64)]) -> Vec<u8> {
    record(3, module, name, |w| {
        w.empty_dict();
        w.memoize();
        if !fields.is_empty() {
            w.mark();
            for (key, value) in fields {
                w.str(key).int(*value);
            }
            w.setitems();
        }
    })
}

/// A B-tree bucket record, skipped by the default predicate.
pub fn btree_record() -> Vec<u8> {
    record(3, "BTrees.OOBTree", "OOBucket", |w| {
        w.none();
    })
}

/// The tid of a commit `seconds` after 2024-01-01T00:00:00Z.
pub fn tid_at(seconds: f64) -> Tid {
    let base = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid base time");
    let offset = TimeDelta::microseconds((seconds * 1_000_000.0) as i64);
    timestamp_to_tid(base + offset)
}

/// Commits `count` objects in transactions of `per_tid`, one second apart,
/// with object ids counting up from 1. Each object is a `app.Item` record
/// with state `{"n": i}`. Returns the tids used.
pub fn populate_log(log: &MemoryLog, count: usize, per_tid: usize) -> Vec<Tid> {
    let per_tid = per_tid.max(1);
    let mut tids = Vec::new();
    let ids: Vec<u64> = (1..=count as u64).collect();
    for (i, chunk) in ids.chunks(per_tid).enumerate() {
        let tid = tid_at(i as f64);
        let objects = chunk
            .iter()
            .map(|&oid| (oid, dict_record("app", "Item", &[("n", oid as i64)])));
        log.commit(tid, objects).expect("tids increase");
        tids.push(tid);
    }
    tids
}

/// A log holding `count` objects in transactions of `per_tid`.
pub fn populated_log(count: usize, per_tid: usize) -> MemoryLog {
    let log = MemoryLog::new();
    populate_log(&log, count, per_tid);
    log
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populate_groups_by_tid() {
        let log = MemoryLog::new();
        let tids = populate_log(&log, 10, 4);
        assert_eq!(tids.len(), 3);
        assert!(tids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(log.object_count(), 10);
    }

    #[test]
    fn record_has_two_pickles() {
        let raw = dict_record("app", "Item", &[("n", 1)]);
        assert_eq!(raw.iter().filter(|&&b| b == b'.').count(), 2);
        assert!(raw.starts_with(b"\x80\x03capp\nItem\n"));
    }
}
