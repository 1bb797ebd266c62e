use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rivet_mvcc::{Clock, LogicalClock, MvccManager, Snapshot, Timestamp};

pub type TestManager = MvccManager<LogicalClock>;

/// Manager over a logical clock whose first reading is 1.
#[allow(dead_code)]
pub fn logical_manager() -> (Arc<LogicalClock>, Arc<TestManager>) {
    let clock = Arc::new(LogicalClock::starting_at(Timestamp::INITIAL));
    let manager = Arc::new(MvccManager::new(clock.clone()));
    (clock, manager)
}

#[allow(dead_code)]
pub fn ts(value: u64) -> Timestamp {
    Timestamp::new(value)
}

#[allow(dead_code)]
pub fn apply_and_commit<C: Clock + ?Sized>(manager: &MvccManager<C>, ts: Timestamp) {
    manager.start_applying_transaction(ts);
    manager.commit_transaction(ts);
}

/// Deadline far enough away that reaching it means the test is broken.
#[allow(dead_code)]
pub fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

/// Background thread blocked in `wait_for_clean_snapshot_at`, recording the
/// snapshot it eventually gets.
#[allow(dead_code)]
pub struct CleanSnapshotWaiter {
    result: Arc<Mutex<Option<Snapshot>>>,
    handle: JoinHandle<()>,
}

#[allow(dead_code)]
impl CleanSnapshotWaiter {
    pub fn spawn(manager: Arc<TestManager>, at: Timestamp) -> Self {
        let result = Arc::new(Mutex::new(None));
        let handle = {
            let result = result.clone();
            thread::spawn(move || {
                let snapshot = manager
                    .wait_for_clean_snapshot_at(at, far_deadline())
                    .expect("clean snapshot before deadline");
                *result.lock() = Some(snapshot);
            })
        };
        Self { result, handle }
    }

    pub fn has_result(&self) -> bool {
        self.result.lock().is_some()
    }

    pub fn join(self) -> Snapshot {
        self.handle.join().expect("waiter thread panicked");
        self.result
            .lock()
            .take()
            .expect("waiter stored a snapshot")
    }
}

/// Polls until `manager` reports `expected` blocked waiters.
#[allow(dead_code)]
pub fn wait_for_waiters(manager: &TestManager, expected: usize) {
    let deadline = far_deadline();
    while manager.num_waiters() != expected {
        assert!(Instant::now() < deadline, "waiter never registered");
        thread::sleep(Duration::from_millis(1));
    }
}
