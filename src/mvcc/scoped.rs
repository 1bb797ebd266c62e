use std::thread;

use tracing::error;

use crate::clock::Clock;
use crate::types::Timestamp;

use super::manager::{MvccManager, TxnState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Open(TxnState),
    Finished,
}

/// Write transaction bound to a lexical scope.
///
/// Reserves a timestamp on construction. If the handle goes out of scope
/// while still reserved (early return, `?`, unwinding), the reservation is
/// aborted so it cannot pin the watermark forever.
pub struct ScopedWriteTransaction<'a, C: Clock + ?Sized> {
    manager: &'a MvccManager<C>,
    timestamp: Timestamp,
    progress: Progress,
}

impl<'a, C: Clock + ?Sized> ScopedWriteTransaction<'a, C> {
    pub fn new(manager: &'a MvccManager<C>) -> Self {
        let timestamp = manager.start_transaction();
        Self {
            manager,
            timestamp,
            progress: Progress::Open(TxnState::Reserved),
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn start_applying(&mut self) {
        self.manager.start_applying_transaction(self.timestamp);
        self.progress = Progress::Open(TxnState::Applying);
    }

    pub fn commit(&mut self) {
        self.manager.commit_transaction(self.timestamp);
        self.progress = Progress::Finished;
    }

    pub fn abort(&mut self) {
        self.manager.abort_transaction(self.timestamp);
        self.progress = Progress::Finished;
    }
}

impl<C: Clock + ?Sized> Drop for ScopedWriteTransaction<'_, C> {
    fn drop(&mut self) {
        match self.progress {
            Progress::Finished => {}
            Progress::Open(TxnState::Reserved) => self.manager.abort_transaction(self.timestamp),
            Progress::Open(TxnState::Applying) => {
                // An applying transaction can only commit; leaving the scope
                // without committing leaks it.
                if thread::panicking() {
                    error!(ts = %self.timestamp, "applying transaction dropped during unwind");
                } else {
                    panic!(
                        "transaction with timestamp {} dropped while applying",
                        self.timestamp
                    );
                }
            }
        }
    }
}
