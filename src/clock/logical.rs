use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::types::Timestamp;

use super::{Clock, ClockError};

/// Pure counter clock. Every reading is the previous one plus one.
///
/// Used for tests and for log replay, where timestamps carry no relation to
/// wall-clock time.
#[derive(Debug)]
pub struct LogicalClock {
    /// Last value handed out (or folded in through `update`).
    last: Mutex<u64>,
    advanced: Condvar,
    max_regression: Option<u64>,
}

impl LogicalClock {
    /// Creates a clock whose first `now()` returns `first`.
    pub fn starting_at(first: Timestamp) -> Self {
        Self {
            last: Mutex::new(first.value().saturating_sub(1)),
            advanced: Condvar::new(),
            max_regression: None,
        }
    }

    /// Rejects updates that lie more than `limit` behind the current value.
    pub fn with_max_regression(mut self, limit: u64) -> Self {
        self.max_regression = Some(limit);
        self
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::starting_at(Timestamp::INITIAL)
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> Timestamp {
        let mut last = self.last.lock();
        *last = last.saturating_add(1);
        let ts = Timestamp::new(*last);
        drop(last);
        self.advanced.notify_all();
        ts
    }

    fn peek(&self) -> Timestamp {
        Timestamp::new(*self.last.lock())
    }

    fn update(&self, ts: Timestamp) -> Result<(), ClockError> {
        let mut last = self.last.lock();
        if ts.value() > *last {
            trace!(from = *last, to = %ts, "logical clock updated");
            *last = ts.value();
            drop(last);
            self.advanced.notify_all();
            return Ok(());
        }

        if let Some(limit) = self.max_regression {
            if *last - ts.value() > limit {
                return Err(ClockError::Regression {
                    requested: ts,
                    current: Timestamp::new(*last),
                    limit,
                });
            }
        }
        Ok(())
    }

    fn wait_until_after(&self, ts: Timestamp, deadline: Instant) -> Result<(), ClockError> {
        let started = Instant::now();
        let mut last = self.last.lock();
        while *last < ts.value() {
            if self.advanced.wait_until(&mut last, deadline).timed_out() && *last < ts.value() {
                return Err(ClockError::TimedOut {
                    target: ts,
                    waited: started.elapsed(),
                });
            }
        }
        Ok(())
    }
}
