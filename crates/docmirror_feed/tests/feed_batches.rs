//! Batch and live-follow behavior of the change feed.

use docmirror_feed::{
    follow_in_background, ChangeFeed, FeedConfig, FeedState, MemoryLog, Record, SourceLog, Tid,
};
use docmirror_testkit::prelude::*;
use proptest::prelude::*;
use std::thread;
use std::time::Duration;

fn collect_batches<S: SourceLog>(feed: &mut ChangeFeed<S>) -> Vec<Vec<Record>> {
    let mut batches = Vec::new();
    while let Some(batch) = feed.next_batch() {
        batches.push(batch.collect::<Result<Vec<_>, _>>().unwrap());
    }
    batches
}

#[test]
fn soft_limit_closes_batches_on_tid_boundaries() {
    let log = populated_log(99, 7);
    let mut feed = ChangeFeed::new(log, FeedConfig::new().batch_limit(20));
    let sizes: Vec<usize> = collect_batches(&mut feed).iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![21, 21, 21, 21, 15]);
    assert_eq!(feed.state(), FeedState::Drained);
}

#[test]
fn paging_does_not_change_batches() {
    for page_size in [1, 3, 7, 100] {
        let log = populated_log(99, 7);
        let config = FeedConfig::new().batch_limit(20).page_size(page_size);
        let mut feed = ChangeFeed::new(log, config);
        let sizes: Vec<usize> = collect_batches(&mut feed).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![21, 21, 21, 21, 15], "page size {page_size}");
    }
}

#[test]
fn resumes_after_last_tid() {
    let log = MemoryLog::new();
    let tids = populate_log(&log, 30, 10);
    let mut feed = ChangeFeed::new(log.clone(), FeedConfig::new().start_tid(tids[0]));
    let batches = collect_batches(&mut feed);
    let ids: Vec<u64> = batches.concat().iter().map(|r| r.object_id).collect();
    assert_eq!(ids, (11..=30).collect::<Vec<_>>());
    assert_eq!(feed.last_tid(), tids[2]);
}

#[test]
fn end_tid_is_inclusive() {
    let log = MemoryLog::new();
    let tids = populate_log(&log, 30, 10);
    let mut feed = ChangeFeed::new(log, FeedConfig::new().end_tid(Some(tids[1])));
    let records = collect_batches(&mut feed).concat();
    assert_eq!(records.len(), 20);
    assert!(records.iter().all(|r| r.tid <= tids[1]));
}

#[test]
fn live_feed_picks_up_new_commits_until_stopped() {
    let log = populated_log(5, 5);
    let feed = ChangeFeed::new(log.clone(), FeedConfig::new().poll_timeout(Duration::from_secs(5)))
        .with_notifier(log.subscribe());
    let follower = follow_in_background(feed, 4);

    let first = follower.receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.len(), 5);

    let tid = tid_at(60.0);
    log.commit(tid, [(100, dict_record("app", "Item", &[("n", 100)]))])
        .unwrap();
    let second = follower.receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second.iter().map(|r| (r.tid, r.object_id)).collect::<Vec<_>>(), vec![(tid, 100)]);

    log.stop_followers();
    follower.join().unwrap();
}

#[test]
fn stop_handle_ends_follower_after_poll_timeout() {
    let log = populated_log(3, 3);
    let feed = ChangeFeed::new(log.clone(), FeedConfig::new().poll_timeout(Duration::from_millis(20)))
        .with_notifier(log.subscribe());
    let follower = follow_in_background(feed, 1);
    assert_eq!(follower.receiver.recv_timeout(Duration::from_secs(5)).unwrap().len(), 3);
    follower.stop();
    thread::sleep(Duration::from_millis(50));
    follower.join().unwrap();
}

#[test]
fn rewritten_objects_appear_once_at_their_new_tid() {
    let log = populated_log(4, 2);
    let tid = tid_at(30.0);
    log.commit(tid, [(1, dict_record("app", "Item", &[("n", -1)]))])
        .unwrap();
    let mut feed = ChangeFeed::new(log, FeedConfig::new());
    let records = collect_batches(&mut feed).concat();
    let seen: Vec<(u64, Tid)> = records.iter().map(|r| (r.object_id, r.tid)).collect();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen.last(), Some(&(1, tid)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn batches_never_split_a_transaction(
        sizes in transaction_sizes_strategy(),
        limit in 1usize..40,
        page_size in 1usize..16,
    ) {
        let log = MemoryLog::new();
        let mut oid = 0u64;
        for (i, size) in sizes.iter().enumerate() {
            let objects: Vec<_> = (0..*size).map(|_| { oid += 1; (oid, vec![1u8]) }).collect();
            log.commit(tid_at(i as f64), objects).unwrap();
        }
        let config = FeedConfig::new().batch_limit(limit).page_size(page_size);
        let mut feed = ChangeFeed::new(log, config);
        let batches = collect_batches(&mut feed);

        let total: usize = batches.iter().map(Vec::len).sum();
        prop_assert_eq!(total, sizes.iter().sum::<usize>());

        let mut last_tid_of_previous: Option<Tid> = None;
        for batch in &batches {
            prop_assert!(!batch.is_empty());
            let first = batch[0].tid;
            if let Some(prev) = last_tid_of_previous {
                prop_assert!(first > prev);
            }
            let tids_in_batch: Vec<Tid> = batch.iter().map(|r| r.tid).collect();
            prop_assert!(tids_in_batch.windows(2).all(|w| w[0] <= w[1]));
            let last = tids_in_batch[tids_in_batch.len() - 1];
            let without_last = batch.iter().filter(|r| r.tid != last).count();
            prop_assert!(without_last < limit);
            last_tid_of_previous = Some(last);
        }
    }
}

#[test]
fn zero_batch_limit_still_drains() {
    let log = MemoryLog::new();
    log.commit(1, [(1, vec![]), (2, vec![])]).unwrap();
    log.commit(2, [(3, vec![])]).unwrap();

    let mut feed = ChangeFeed::new(log.clone(), FeedConfig::new().batch_limit(0));
    assert_eq!(feed.config().batch_limit, 1);
    let sizes: Vec<usize> = collect_batches(&mut feed).iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 1]);
    assert_eq!(feed.last_tid(), 2);

    let mut config = FeedConfig::new();
    config.batch_limit = 0;
    let mut feed = ChangeFeed::new(log, config);
    let sizes: Vec<usize> = collect_batches(&mut feed).iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 1]);
    assert_eq!(feed.state(), FeedState::Drained);
}
