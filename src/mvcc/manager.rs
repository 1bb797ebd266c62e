use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, ClockError};
use crate::types::Timestamp;

use super::snapshot::Snapshot;

/// Recoverable failures. Illegal state transitions are bugs in the caller and
/// panic instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MvccError {
    #[error("timed out after {waited:?} waiting for a clean snapshot at {target}")]
    TimedOut { target: Timestamp, waited: Duration },
    #[error("timestamp {0} is already in flight")]
    AlreadyInFlight(Timestamp),
    #[error("timestamp {0} is already committed")]
    AlreadyCommitted(Timestamp),
    #[error("timestamp {ts} is at or below the safe time {safe_time}")]
    BelowSafeTime {
        ts: Timestamp,
        safe_time: Timestamp,
    },
    #[error(transparent)]
    Clock(#[from] ClockError),
}

/// State of a transaction that has not committed or aborted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Reserved,
    Applying,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Reserved => f.write_str("Reserved"),
            TxnState::Applying => f.write_str("Applying"),
        }
    }
}

#[derive(Debug)]
enum WaitFor {
    /// Nothing at or before the timestamp is in flight.
    CleanAt(Timestamp),
    /// None of these (applying) timestamps is in flight.
    Committed(BTreeSet<Timestamp>),
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    wait_for: WaitFor,
}

#[derive(Debug)]
struct MvccState {
    in_flight: BTreeMap<Timestamp, TxnState>,
    /// Watermark, out-of-order commits and upper bound of what has committed.
    cur_snap: Snapshot,
    /// No reservation may be made at or below this timestamp.
    no_new_transactions_at_or_before: Timestamp,
    committed_count: u64,
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
}

impl MvccState {
    fn new() -> Self {
        Self {
            in_flight: BTreeMap::new(),
            cur_snap: Snapshot::default(),
            no_new_transactions_at_or_before: Timestamp::MIN,
            committed_count: 0,
            waiters: Vec::new(),
            next_waiter_id: 0,
        }
    }

    fn earliest_in_flight(&self) -> Option<Timestamp> {
        self.in_flight.keys().next().copied()
    }

    fn any_in_flight_at_or_before(&self, ts: Timestamp) -> bool {
        self.in_flight.range(..=ts).next().is_some()
    }

    fn check_reservable(&self, ts: Timestamp) -> Result<(), MvccError> {
        if self.in_flight.contains_key(&ts) {
            return Err(MvccError::AlreadyInFlight(ts));
        }
        if self.cur_snap.is_committed(ts) {
            return Err(MvccError::AlreadyCommitted(ts));
        }
        if ts <= self.no_new_transactions_at_or_before {
            return Err(MvccError::BelowSafeTime {
                ts,
                safe_time: self.no_new_transactions_at_or_before,
            });
        }
        Ok(())
    }

    /// Smallest value the clock must move past for a fresh reading to be
    /// reservable.
    fn reservation_floor(&self) -> Timestamp {
        let latest_in_flight = self
            .in_flight
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Timestamp::MIN);
        self.no_new_transactions_at_or_before
            .max(self.cur_snap.none_committed_at_or_after().decremented())
            .max(latest_in_flight)
    }

    fn reserve(&mut self, ts: Timestamp) {
        self.in_flight.insert(ts, TxnState::Reserved);
    }

    fn raise_no_new_transactions(&mut self, ts: Timestamp) {
        if self.no_new_transactions_at_or_before < ts {
            self.no_new_transactions_at_or_before = ts;
        }
    }

    /// Moves the watermark to the earliest in-flight timestamp, bounded by the
    /// point past which no new transactions may start.
    fn adjust_clean_time(&mut self) {
        let bound = self.no_new_transactions_at_or_before.incremented();
        let watermark = match self.earliest_in_flight() {
            Some(earliest) if earliest < bound => earliest,
            _ => bound,
        };
        if watermark > self.cur_snap.all_committed_before() {
            trace!(
                from = %self.cur_snap.all_committed_before(),
                to = %watermark,
                "advancing clean time"
            );
            self.cur_snap.advance_all_committed_before(watermark);
        }
    }

    fn check_committable(&self, ts: Timestamp) {
        match self.in_flight.get(&ts) {
            None => panic!("trying to remove timestamp which isn't in the in-flight set: {ts}"),
            Some(TxnState::Reserved) => panic!(
                "trying to commit a transaction which never entered APPLYING state: {ts}"
            ),
            Some(TxnState::Applying) => {}
        }
    }

    fn commit(&mut self, ts: Timestamp) {
        self.check_committable(ts);
        self.in_flight.remove(&ts);
        self.cur_snap.add_committed(ts);
        self.committed_count += 1;
    }

    /// Declares everything at or before `ts` resolved: no later reservation
    /// may land there, so the watermark can move past it.
    fn mark_clean(&mut self, ts: Timestamp) {
        if ts == Timestamp::MAX {
            return;
        }
        self.raise_no_new_transactions(ts);
        self.adjust_clean_time();
    }

    fn is_done_waiting(&self, wait_for: &WaitFor) -> bool {
        match wait_for {
            WaitFor::CleanAt(ts) => !self.any_in_flight_at_or_before(*ts),
            WaitFor::Committed(pending) => {
                pending.iter().all(|ts| !self.in_flight.contains_key(ts))
            }
        }
    }

    /// Unregisters every satisfied waiter. The caller broadcasts afterwards.
    fn release_finished_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|waiter| self.is_done_waiting(&waiter.wait_for));
        self.waiters = pending;
        for waiter in done {
            trace!(id = waiter.id, wait_for = ?waiter.wait_for, "releasing waiter");
            if let WaitFor::CleanAt(ts) = waiter.wait_for {
                self.mark_clean(ts);
            }
        }
    }

    fn register_waiter(&mut self, wait_for: WaitFor) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        self.waiters.push(Waiter { id, wait_for });
        id
    }

    fn has_waiter(&self, id: u64) -> bool {
        self.waiters.iter().any(|waiter| waiter.id == id)
    }

    fn remove_waiter(&mut self, id: u64) {
        self.waiters.retain(|waiter| waiter.id != id);
    }
}

/// Tracks in-flight write transactions for one partition and hands out
/// visibility snapshots.
///
/// Lifecycle of a transaction, keyed by its timestamp:
///
/// ```text
/// (absent) --start_transaction*--> Reserved --start_applying_transaction--> Applying
/// Reserved --abort_transaction--> (absent)
/// Applying --commit_transaction / offline_commit_transaction--> (absent, committed)
/// ```
///
/// Any other transition panics: it means the calling code is broken and
/// continuing would corrupt visibility.
pub struct MvccManager<C: Clock + ?Sized> {
    clock: Arc<C>,
    state: Mutex<MvccState>,
    state_changed: Condvar,
}

impl<C: Clock + ?Sized> MvccManager<C> {
    pub fn new(clock: Arc<C>) -> Self {
        Self {
            clock,
            state: Mutex::new(MvccState::new()),
            state_changed: Condvar::new(),
        }
    }

    pub fn clock(&self) -> &Arc<C> {
        &self.clock
    }

    /// Reserves the next clock reading. Readings are taken under the manager
    /// lock, so concurrent callers always get distinct, increasing timestamps.
    pub fn start_transaction(&self) -> Timestamp {
        self.reserve_from_clock(|clock| clock.now())
    }

    /// Reserves a timestamp from the top of the clock's uncertainty window.
    ///
    /// The caller must commit-wait with [`Clock::wait_until_after`] before
    /// committing, so that real-time order matches timestamp order.
    pub fn start_transaction_at_latest(&self) -> Timestamp {
        self.reserve_from_clock(|clock| clock.now_latest())
    }

    /// Reserves an explicit timestamp, e.g. when replaying a logged transaction.
    pub fn start_transaction_at(&self, ts: Timestamp) -> Result<(), MvccError> {
        let mut state = self.state.lock();
        state.check_reservable(ts)?;
        state.reserve(ts);
        debug!(%ts, "reserved transaction at explicit timestamp");
        Ok(())
    }

    /// Reads the clock until it yields a reservable value, moving it past the
    /// reservation floor between reads.
    ///
    /// Panics when the clock refuses to move past the floor or stops
    /// advancing; either way no timestamp can be issued and retrying under the
    /// lock would stall every other caller.
    /// Checks whether [`Self::start_transaction_at`] would accept `ts`,
    /// without reserving it.
    pub fn check_reservable_at(&self, ts: Timestamp) -> Result<(), MvccError> {
        self.state.lock().check_reservable(ts)
    }

    fn reserve_from_clock(&self, read: impl Fn(&C) -> Timestamp) -> Timestamp {
        let mut state = self.state.lock();
        let mut previous: Option<Timestamp> = None;
        loop {
            let ts = read(self.clock.as_ref());
            if state.check_reservable(ts).is_ok() {
                state.reserve(ts);
                debug!(%ts, "reserved transaction");
                return ts;
            }
            if previous.is_some_and(|previous| ts <= previous) {
                panic!("clock did not advance past {ts}: cannot reserve a new timestamp");
            }
            previous = Some(ts);

            let floor = state.reservation_floor();
            if let Err(err) = self.clock.update(floor) {
                panic!("cannot move the clock past reservation floor {floor}: {err}");
            }
        }
    }

    pub fn start_applying_transaction(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        match state.in_flight.get_mut(&ts) {
            None => panic!("cannot mark timestamp {ts} as APPLYING: not in the in-flight map"),
            Some(txn_state @ TxnState::Reserved) => *txn_state = TxnState::Applying,
            Some(TxnState::Applying) => {
                panic!("cannot mark timestamp {ts} as APPLYING: wrong state: Applying")
            }
        }
        debug!(%ts, "transaction applying");
    }

    /// Commits an applying transaction and advances the clean time.
    ///
    /// No new transaction may start at or before a committed timestamp, so
    /// committing the earliest in-flight transaction coalesces every
    /// contiguous out-of-order commit into the watermark.
    ///
    /// Panics if `ts` is ahead of the clock: a transaction reserved with
    /// [`Self::start_transaction_at_latest`] must commit-wait first.
    pub fn commit_transaction(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        state.check_committable(ts);
        if ts > self.clock.peek() {
            panic!("trying to commit a transaction with a future timestamp: {ts}");
        }
        state.commit(ts);
        state.raise_no_new_transactions(ts);
        state.adjust_clean_time();
        state.release_finished_waiters();
        debug!(%ts, snapshot = %state.cur_snap, "committed transaction");
        drop(state);
        self.state_changed.notify_all();
    }

    /// Commits without moving the safe-time bound. Used during replay, where
    /// commit order need not match timestamp order; the replay driver moves
    /// the bound explicitly with [`Self::offline_adjust_safe_time`].
    pub fn offline_commit_transaction(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        state.commit(ts);
        state.adjust_clean_time();
        state.release_finished_waiters();
        debug!(%ts, snapshot = %state.cur_snap, "committed transaction offline");
        drop(state);
        self.state_changed.notify_all();
    }

    /// Declares that no transaction will start at or before `safe_time` and
    /// coalesces the watermark accordingly. Only moves forward.
    pub fn offline_adjust_safe_time(&self, safe_time: Timestamp) {
        let mut state = self.state.lock();
        state.raise_no_new_transactions(safe_time);
        state.adjust_clean_time();
        state.release_finished_waiters();
        debug!(%safe_time, snapshot = %state.cur_snap, "adjusted safe time");
        drop(state);
        self.state_changed.notify_all();
    }

    /// Drops a reserved transaction. The watermark does not move.
    ///
    /// The timestamp is not reused, but once later commits carry the
    /// watermark past it, snapshots report it as committed like every other
    /// timestamp below the watermark. Nothing was written at it, so readers
    /// find no data there.
    pub fn abort_transaction(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        match state.in_flight.get(&ts) {
            None => panic!("trying to remove timestamp which isn't in the in-flight set: {ts}"),
            Some(TxnState::Applying) => {
                panic!("transaction with timestamp {ts} cannot be aborted in state Applying")
            }
            Some(TxnState::Reserved) => {}
        }
        state.in_flight.remove(&ts);
        state.release_finished_waiters();
        debug!(%ts, "aborted transaction");
        drop(state);
        self.state_changed.notify_all();
    }

    pub fn take_snapshot(&self) -> Snapshot {
        self.state.lock().cur_snap.clone()
    }

    /// Blocks until the clock has passed `ts` and nothing at or before `ts` is
    /// in flight, then returns a snapshot whose watermark lies past `ts`.
    ///
    /// Returns [`MvccError::TimedOut`] once `deadline` passes; the manager is
    /// left as it was.
    pub fn wait_for_clean_snapshot_at(
        &self,
        ts: Timestamp,
        deadline: Instant,
    ) -> Result<Snapshot, MvccError> {
        let started = Instant::now();
        if ts != Timestamp::MAX {
            // Nothing may be reserved at or below a clean timestamp, so the
            // clock has to be past it first.
            self.clock
                .wait_until_after(ts, deadline)
                .map_err(|err| match err {
                    ClockError::TimedOut { .. } => {
                        let waited = started.elapsed();
                        warn!(%ts, ?waited, "timed out waiting for the clock");
                        MvccError::TimedOut { target: ts, waited }
                    }
                    other => MvccError::Clock(other),
                })?;
        }

        let mut state = self.state.lock();
        if !state.any_in_flight_at_or_before(ts) {
            state.mark_clean(ts);
            return Ok(state.cur_snap.clone());
        }

        let id = state.register_waiter(WaitFor::CleanAt(ts));
        debug!(%ts, id, "waiting for clean snapshot");
        loop {
            let timed_out = self
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out();
            if !state.has_waiter(id) {
                return Ok(state.cur_snap.clone());
            }
            if timed_out {
                state.remove_waiter(id);
                let waited = started.elapsed();
                warn!(%ts, ?waited, "timed out waiting for clean snapshot");
                return Err(MvccError::TimedOut { target: ts, waited });
            }
        }
    }

    /// Blocks until every transaction applying at the time of the call has
    /// committed. Transactions that start applying later are not waited for.
    pub fn wait_for_applying_transactions_to_commit(&self) {
        let mut state = self.state.lock();
        let applying: BTreeSet<Timestamp> = state
            .in_flight
            .iter()
            .filter(|(_, txn_state)| **txn_state == TxnState::Applying)
            .map(|(ts, _)| *ts)
            .collect();
        if applying.is_empty() {
            return;
        }

        debug!(count = applying.len(), "waiting for applying transactions");
        let id = state.register_waiter(WaitFor::Committed(applying));
        while state.has_waiter(id) {
            self.state_changed.wait(&mut state);
        }
    }

    /// Largest timestamp a read can use without a later commit changing what
    /// it sees.
    pub fn max_safe_time_to_read_at(&self) -> Timestamp {
        let state = self.state.lock();
        if state.committed_count == 0 {
            return Timestamp::MIN;
        }
        if let Some(earliest) = state.earliest_in_flight() {
            return earliest.decremented();
        }
        self.clock.now().max(state.no_new_transactions_at_or_before)
    }

    /// True when no in-flight transaction has a timestamp at or before `ts`.
    pub fn are_all_transactions_committed(&self, ts: Timestamp) -> bool {
        !self.state.lock().any_in_flight_at_or_before(ts)
    }

    /// Number of callers blocked in one of the wait operations.
    pub fn num_waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn num_in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn committed_count(&self) -> u64 {
        self.state.lock().committed_count
    }

    pub fn no_new_transactions_at_or_before(&self) -> Timestamp {
        self.state.lock().no_new_transactions_at_or_before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LogicalClock;

    fn manager() -> MvccManager<LogicalClock> {
        MvccManager::new(Arc::new(LogicalClock::default()))
    }

    fn ts(value: u64) -> Timestamp {
        Timestamp::new(value)
    }

    #[test]
    fn watermark_tracks_earliest_in_flight() {
        let mgr = manager();
        let t1 = mgr.start_transaction();
        let t2 = mgr.start_transaction();
        let t3 = mgr.start_transaction();

        mgr.start_applying_transaction(t2);
        mgr.commit_transaction(t2);
        {
            let state = mgr.state.lock();
            assert_eq!(state.cur_snap.all_committed_before(), t1);
            assert_eq!(state.no_new_transactions_at_or_before, t2);
        }

        mgr.abort_transaction(t1);
        // Aborting does not move the watermark by itself.
        assert_eq!(mgr.take_snapshot().all_committed_before(), t1);

        mgr.start_applying_transaction(t3);
        mgr.commit_transaction(t3);
        assert_eq!(mgr.take_snapshot().to_string(), "committed={T|T < 4}");
    }

    #[test]
    fn reservation_floor_covers_holes_and_in_flight() {
        let mgr = manager();
        mgr.start_transaction_at(ts(40)).unwrap();
        mgr.start_transaction_at(ts(30)).unwrap();
        mgr.start_applying_transaction(ts(30));
        mgr.offline_commit_transaction(ts(30));

        let state = mgr.state.lock();
        assert_eq!(state.reservation_floor(), ts(40));
    }

    #[test]
    fn start_transaction_skips_past_safe_time() {
        let mgr = manager();
        mgr.offline_adjust_safe_time(ts(50));
        assert_eq!(mgr.start_transaction(), ts(51));
    }

    #[test]
    fn start_transaction_skips_replayed_timestamps() {
        let mgr = manager();
        mgr.start_transaction_at(ts(1)).unwrap();
        mgr.start_transaction_at(ts(2)).unwrap();
        assert_eq!(mgr.start_transaction(), ts(3));
    }

    #[test]
    fn explicit_reservation_errors() {
        let mgr = manager();
        let t1 = mgr.start_transaction();
        assert_eq!(
            mgr.start_transaction_at(t1),
            Err(MvccError::AlreadyInFlight(t1))
        );

        mgr.start_applying_transaction(t1);
        mgr.commit_transaction(t1);
        assert_eq!(
            mgr.start_transaction_at(t1),
            Err(MvccError::AlreadyCommitted(t1))
        );

        mgr.offline_adjust_safe_time(ts(10));
        assert_eq!(
            mgr.start_transaction_at(ts(10)),
            Err(MvccError::AlreadyCommitted(ts(10)))
        );
    }

    #[test]
    fn explicit_reservation_below_safe_time_is_rejected() {
        let mgr = manager();
        mgr.start_transaction_at(ts(5)).unwrap();
        mgr.offline_adjust_safe_time(ts(10));
        // The watermark is pinned at 5, but 7 is already declared safe.
        assert_eq!(
            mgr.start_transaction_at(ts(7)),
            Err(MvccError::BelowSafeTime {
                ts: ts(7),
                safe_time: ts(10)
            })
        );
    }

    #[test]
    fn timed_out_waiter_is_unregistered() {
        let mgr = manager();
        let t1 = mgr.start_transaction();
        let err = mgr
            .wait_for_clean_snapshot_at(t1, Instant::now() + Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, MvccError::TimedOut { .. }));
        assert_eq!(mgr.num_waiters(), 0);
        assert_eq!(mgr.no_new_transactions_at_or_before(), Timestamp::MIN);
    }

    #[test]
    fn clean_wait_ahead_of_clock_leaves_safe_time_alone() {
        let mgr = manager();
        let err = mgr
            .wait_for_clean_snapshot_at(ts(1_000), Instant::now() + Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, MvccError::TimedOut { target, .. } if target == ts(1_000)));
        assert_eq!(mgr.no_new_transactions_at_or_before(), Timestamp::MIN);
        assert_eq!(mgr.num_waiters(), 0);
        assert_eq!(mgr.start_transaction(), ts(1));
    }

    #[test]
    fn commit_at_clock_reading_is_allowed() {
        let mgr = manager();
        let t1 = mgr.start_transaction();
        assert_eq!(mgr.clock().peek(), t1);
        mgr.start_applying_transaction(t1);
        mgr.commit_transaction(t1);
        assert!(mgr.take_snapshot().is_committed(t1));
    }

    #[test]
    fn txn_state_display() {
        assert_eq!(TxnState::Reserved.to_string(), "Reserved");
        assert_eq!(TxnState::Applying.to_string(), "Applying");
    }
}
