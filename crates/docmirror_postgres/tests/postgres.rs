//! Round trips against a live database.
//!
//! Run with `DOCMIRROR_TEST_DSN=postgresql://... cargo test -- --ignored`.
//! The tests drop and recreate `object_state`, `newt` and
//! `newt_follow_progress` in the target database.

use docmirror_feed::{ChangeFeed, FeedConfig, SourceLog, Tid};
use docmirror_postgres::{connect, schema, stop_updates, PgNotifier, PgSource, PgStore};
use docmirror_sink::monitor::check;
use docmirror_sink::{DocumentStore, GcMode, LagThresholds, SinkError, Status, Updater, UpdaterConfig};
use docmirror_testkit::prelude::*;
use parking_lot::{Mutex, MutexGuard};
use postgres::Client;
use std::thread;
use std::time::{Duration, Instant};

const CLIENT: &str = "docmirror.updater";

static DATABASE: Mutex<()> = Mutex::new(());

fn dsn() -> String {
    std::env::var("DOCMIRROR_TEST_DSN").expect("DOCMIRROR_TEST_DSN is not set")
}

/// Resets the schema and returns a connection plus a guard serializing
/// the tests.
fn fresh_database() -> (Client, MutexGuard<'static, ()>) {
    let guard = DATABASE.lock();
    let mut client = connect(&dsn()).unwrap();
    client
        .batch_execute(
            "drop table if exists newt, newt_follow_progress, object_state cascade;
             drop function if exists newt_notify_object_state_changed() cascade;
             drop function if exists newt_delete_on_state_delete() cascade;
             create table object_state (zoid bigint primary key, tid bigint, state bytea);",
        )
        .unwrap();
    (client, guard)
}

fn store_objects(client: &mut Client, tid: Tid, objects: &[(i64, Vec<u8>)]) {
    let mut tx = client.transaction().unwrap();
    for (zoid, state) in objects {
        tx.execute("delete from object_state where zoid = $1", &[zoid])
            .unwrap();
        tx.execute(
            "insert into object_state (zoid, tid, state) values ($1, $2, $3)",
            &[zoid, &tid, state],
        )
        .unwrap();
    }
    tx.commit().unwrap();
}

fn item(n: i64) -> Vec<u8> {
    dict_record("app", "Item", &[("n", n)])
}

fn search(client: &mut Client, condition: &str) -> Vec<i64> {
    let sql = format!("select zoid from newt where {condition} order by zoid");
    client
        .query(sql.as_str(), &[])
        .unwrap()
        .iter()
        .map(|row| row.get(0))
        .collect()
}

fn checkpoint(client: &mut Client) -> Option<Tid> {
    client
        .query_opt("select tid from newt_follow_progress where id = $1", &[&CLIENT])
        .ok()
        .flatten()
        .map(|row| row.get(0))
}

fn wait_for_checkpoint(client: &mut Client, tid: Tid) {
    let deadline = Instant::now() + Duration::from_secs(9);
    while checkpoint(client) != Some(tid) {
        assert!(Instant::now() < deadline, "waiting for {tid}");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
#[ignore]
fn updater_mirrors_object_state() {
    let (mut client, _guard) = fresh_database();
    store_objects(&mut client, tid_at(1.0), &[(1, item(1)), (2, item(2))]);
    store_objects(&mut client, tid_at(2.0), &[(2, item(22)), (3, btree_record())]);

    let source = PgSource::connect(&dsn()).unwrap();
    assert!(!source.keeps_history());
    let store = PgStore::connect(&dsn()).unwrap();
    let summary = Updater::new(source, store, UpdaterConfig::new())
        .run()
        .unwrap();
    assert_eq!(summary.records, 3);
    assert_eq!(summary.skipped, 1);

    assert_eq!(search(&mut client, r#"state @> '{"n": 1}'::jsonb"#), vec![1]);
    assert_eq!(search(&mut client, r#"state @> '{"n": 22}'::jsonb"#), vec![2]);
    assert_eq!(search(&mut client, "true"), vec![1, 2]);
    assert_eq!(checkpoint(&mut client), Some(tid_at(2.0)));
}

#[test]
#[ignore]
fn source_pages_by_tid_and_object() {
    let (mut client, _guard) = fresh_database();
    store_objects(&mut client, 5, &[(1, item(1)), (2, item(2)), (3, item(3))]);
    store_objects(&mut client, 6, &[(4, item(4))]);

    let mut source = PgSource::connect(&dsn()).unwrap();
    let mut seen = Vec::new();
    {
        let config = FeedConfig::new().page_size(2);
        let mut feed = ChangeFeed::new(&mut source, config);
        while let Some(batch) = feed.next_batch() {
            for record in batch {
                let record = record.unwrap();
                seen.push((record.tid, record.object_id));
            }
        }
    }
    assert_eq!(seen, vec![(5, 1), (5, 2), (5, 3), (6, 4)]);
    assert_eq!(source.max_tid().unwrap(), Some(6));
    let live = source.live_object_ids(&[1, 4, 9]).unwrap();
    assert_eq!(live.len(), 2);
}

#[test]
#[ignore]
fn follower_picks_up_commits_until_stopped() {
    let (mut client, _guard) = fresh_database();
    store_objects(&mut client, tid_at(1.0), &[(1, item(1))]);

    let handle = thread::spawn(|| {
        let source = PgSource::connect(&dsn()).unwrap();
        let store = PgStore::connect(&dsn()).unwrap();
        let notifier = PgNotifier::connect(&dsn()).unwrap();
        let config = UpdaterConfig::new().poll_timeout(Duration::from_secs(1));
        Updater::new(source, store, config).with_notifier(notifier).run()
    });

    wait_for_checkpoint(&mut client, tid_at(1.0));
    store_objects(&mut client, tid_at(3.0), &[(1, item(3))]);
    wait_for_checkpoint(&mut client, tid_at(3.0));
    assert_eq!(search(&mut client, r#"state @> '{"n": 3}'::jsonb"#), vec![1]);
    assert!(schema::trigger_exists(&mut client, schema::NOTIFY_TRIGGER).unwrap());

    let deadline = Instant::now() + Duration::from_secs(9);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "follower did not stop");
        stop_updates(&mut client).unwrap();
        thread::sleep(Duration::from_millis(200));
    }
    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.last_tid, tid_at(3.0));
}

#[test]
#[ignore]
fn legacy_trigger_is_detected_and_removed() {
    let (mut client, _guard) = fresh_database();
    client
        .batch_execute(
            "create function newt_delete_on_state_delete() returns trigger
             as $$ begin return OLD; end; $$ language plpgsql;
             create trigger newt_delete_on_state_delete_trigger
               after delete on object_state for each row
               execute procedure newt_delete_on_state_delete();",
        )
        .unwrap();

    let source = PgSource::connect(&dsn()).unwrap();
    let store = PgStore::connect(&dsn()).unwrap();
    let err = Updater::new(source, store, UpdaterConfig::new())
        .run()
        .unwrap_err();
    assert!(matches!(err, SinkError::ConfigInconsistency { .. }));

    let source = PgSource::connect(&dsn()).unwrap();
    let store = PgStore::connect(&dsn()).unwrap();
    let config = UpdaterConfig::new()
        .remove_legacy_trigger(true)
        .gc(GcMode::Only);
    Updater::new(source, store, config).run().unwrap();
    assert!(!schema::trigger_exists(&mut client, schema::LEGACY_TRIGGER).unwrap());
}

#[test]
#[ignore]
fn monitor_reads_checkpoint_and_source() {
    let (mut client, _guard) = fresh_database();
    let mut source = PgSource::connect(&dsn()).unwrap();
    let mut store = PgStore::connect(&dsn()).unwrap();
    let thresholds = LagThresholds::new(1.0, 99.0);

    let report = check(&mut source, &mut store, CLIENT, thresholds).unwrap();
    assert_eq!(report.line(), "Updater has not run");
    store.rollback().unwrap();

    store_objects(&mut client, tid_at(60.0), &[(1, item(1))]);
    store.save_checkpoint(CLIENT, tid_at(10.0)).unwrap();
    store.commit().unwrap();
    let report = check(&mut source, &mut store, CLIENT, thresholds).unwrap();
    store.rollback().unwrap();
    assert_eq!(report.status, Status::Warning);
    assert_eq!(report.line(), "Updater is behind | 50.000");
}
