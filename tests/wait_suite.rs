use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[path = "common.rs"]
mod common;

use common::{CleanSnapshotWaiter, apply_and_commit, logical_manager, ts, wait_for_waiters};
use rivet_mvcc::{Clock, HybridClock, MvccError, MvccManager, Timestamp};

#[test]
fn clean_snapshot_without_in_flights_returns_immediately() {
    let (clock, mgr) = logical_manager();
    clock.update(ts(10)).unwrap();

    let snap = mgr
        .wait_for_clean_snapshot_at(ts(10), Instant::now())
        .unwrap();
    assert!(snap.is_clean());
    assert!(snap.is_committed(ts(10)));
    assert!(!snap.is_committed(ts(11)));
    assert_eq!(mgr.num_waiters(), 0);

    // Nothing may start at or before the timestamp a reader has seen clean.
    assert_eq!(mgr.start_transaction(), ts(11));
}

#[test]
fn clean_snapshot_waits_for_the_clock() {
    let (clock, mgr) = logical_manager();

    let waiter = CleanSnapshotWaiter::spawn(mgr.clone(), ts(5));
    thread::sleep(Duration::from_millis(20));
    assert!(!waiter.has_result());
    assert_eq!(mgr.no_new_transactions_at_or_before(), Timestamp::MIN);

    clock.update(ts(5)).unwrap();
    let snap = waiter.join();
    assert_eq!(snap.to_string(), "committed={T|T < 6}");
    assert_eq!(mgr.start_transaction(), ts(6));
}

#[test]
fn clean_snapshot_ahead_of_hybrid_clock_times_out() {
    let clock = Arc::new(HybridClock::new(Duration::from_millis(1)));
    let mgr = MvccManager::new(clock.clone());
    let ahead = HybridClock::compose(HybridClock::physical_micros(clock.now()) + 3_000_000, 0);

    let err = mgr
        .wait_for_clean_snapshot_at(ahead, Instant::now())
        .unwrap_err();
    assert!(matches!(err, MvccError::TimedOut { target, .. } if target == ahead));
    assert_eq!(mgr.no_new_transactions_at_or_before(), Timestamp::MIN);

    // The manager keeps issuing timestamps from the clock.
    let t = mgr.start_transaction();
    assert!(t < ahead);
    mgr.abort_transaction(t);
}

#[test]
fn clean_snapshot_waits_for_earlier_in_flights() {
    let (clock, mgr) = logical_manager();
    let tx1 = mgr.start_transaction();
    let tx2 = mgr.start_transaction();
    let read_at = clock.now();
    assert_eq!(read_at, ts(3));

    let waiter = CleanSnapshotWaiter::spawn(mgr.clone(), read_at);
    wait_for_waiters(&mgr, 1);
    assert!(!waiter.has_result());

    apply_and_commit(&mgr, tx1);
    assert_eq!(mgr.num_waiters(), 1);
    assert!(!waiter.has_result());

    apply_and_commit(&mgr, tx2);
    assert_eq!(mgr.num_waiters(), 0);

    let snap = waiter.join();
    assert!(snap.is_committed(tx1));
    assert!(snap.is_committed(tx2));
    assert_eq!(snap.to_string(), "committed={T|T < 4}");
}

#[test]
fn clean_snapshot_ignores_later_in_flights() {
    let (_, mgr) = logical_manager();
    let tx1 = mgr.start_transaction();
    let tx2 = mgr.start_transaction();
    let tx3 = mgr.start_transaction();

    let waiter = CleanSnapshotWaiter::spawn(mgr.clone(), tx2);
    wait_for_waiters(&mgr, 1);

    apply_and_commit(&mgr, tx1);
    assert_eq!(mgr.num_waiters(), 1);
    assert!(!waiter.has_result());

    apply_and_commit(&mgr, tx2);
    let snap = waiter.join();
    assert!(snap.is_committed(tx1));
    assert!(snap.is_committed(tx2));
    assert!(!snap.is_committed(tx3));
    assert_eq!(snap.all_committed_before(), tx3);

    apply_and_commit(&mgr, tx3);
    assert_eq!(mgr.take_snapshot().to_string(), "committed={T|T < 4}");
}

#[test]
fn aborted_predecessor_releases_clean_waiter() {
    let (_, mgr) = logical_manager();
    let tx1 = mgr.start_transaction();
    let tx2 = mgr.start_transaction();

    let waiter = CleanSnapshotWaiter::spawn(mgr.clone(), tx2);
    wait_for_waiters(&mgr, 1);

    apply_and_commit(&mgr, tx2);
    assert!(!waiter.has_result());

    mgr.abort_transaction(tx1);
    let snap = waiter.join();
    assert!(snap.is_committed(tx2));
    assert!(snap.is_clean());
    assert_eq!(snap.all_committed_before(), ts(3));
    assert_eq!(mgr.num_in_flight(), 0);
}

#[test]
fn clean_snapshot_times_out() {
    let (_, mgr) = logical_manager();
    let tx1 = mgr.start_transaction();

    let err = mgr
        .wait_for_clean_snapshot_at(tx1, Instant::now())
        .unwrap_err();
    match err {
        MvccError::TimedOut { target, .. } => assert_eq!(target, tx1),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mgr.num_waiters(), 0);

    // The failed wait left nothing behind.
    apply_and_commit(&mgr, tx1);
    assert_eq!(mgr.take_snapshot().to_string(), "committed={T|T < 2}");
}

#[test]
fn applying_wait_returns_when_nothing_applies() {
    let (_, mgr) = logical_manager();
    mgr.wait_for_applying_transactions_to_commit();

    // Reserved transactions are not waited for.
    let _tx1 = mgr.start_transaction();
    mgr.wait_for_applying_transactions_to_commit();
    assert_eq!(mgr.num_waiters(), 0);
}

#[test]
fn applying_wait_blocks_until_commit() {
    let (_, mgr) = logical_manager();
    let tx1 = mgr.start_transaction();
    let tx2 = mgr.start_transaction();
    mgr.start_applying_transaction(tx1);

    let waiting = {
        let mgr = mgr.clone();
        thread::spawn(move || mgr.wait_for_applying_transactions_to_commit())
    };
    wait_for_waiters(&mgr, 1);

    mgr.abort_transaction(tx2);
    assert_eq!(mgr.num_waiters(), 1);

    mgr.commit_transaction(tx1);
    assert_eq!(mgr.num_waiters(), 0);
    waiting.join().unwrap();
}

#[test]
fn applying_wait_ignores_transactions_applied_later() {
    let (_, mgr) = logical_manager();
    let tx1 = mgr.start_transaction();
    mgr.start_applying_transaction(tx1);

    let waiting = {
        let mgr = mgr.clone();
        thread::spawn(move || mgr.wait_for_applying_transactions_to_commit())
    };
    wait_for_waiters(&mgr, 1);

    let tx2 = mgr.start_transaction();
    mgr.start_applying_transaction(tx2);

    mgr.commit_transaction(tx1);
    waiting.join().unwrap();
    assert_eq!(mgr.num_in_flight(), 1);

    mgr.commit_transaction(tx2);
    assert_eq!(mgr.take_snapshot().to_string(), "committed={T|T < 3}");
}
