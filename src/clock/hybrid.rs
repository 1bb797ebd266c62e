use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::Timestamp;

use super::{Clock, ClockError};

/// Number of low bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 12;

/// Wall-clock backed clock with a bounded uncertainty window.
///
/// A reading packs physical microseconds since the Unix epoch in the high bits
/// and a logical counter in the low [`LOGICAL_BITS`] bits, so several readings
/// inside the same microsecond stay strictly increasing.
#[derive(Debug)]
pub struct HybridClock {
    last: Mutex<u64>,
    max_error: Duration,
}

impl HybridClock {
    pub fn new(max_error: Duration) -> Self {
        Self {
            last: Mutex::new(0),
            max_error,
        }
    }

    pub fn max_error(&self) -> Duration {
        self.max_error
    }

    /// Packs a physical microsecond reading and a logical counter.
    pub fn compose(physical_micros: u64, logical: u64) -> Timestamp {
        Timestamp::new((physical_micros << LOGICAL_BITS) | (logical & logical_mask()))
    }

    /// Physical microseconds encoded in `ts`.
    pub fn physical_micros(ts: Timestamp) -> u64 {
        ts.value() >> LOGICAL_BITS
    }

    fn max_error_micros(&self) -> u64 {
        u64::try_from(self.max_error.as_micros()).unwrap_or(u64::MAX)
    }
}

fn logical_mask() -> u64 {
    (1u64 << LOGICAL_BITS) - 1
}

fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl Clock for HybridClock {
    fn now(&self) -> Timestamp {
        let physical = Self::compose(wall_micros(), 0).value();
        let mut last = self.last.lock();
        *last = if physical > *last {
            physical
        } else {
            last.saturating_add(1)
        };
        Timestamp::new(*last)
    }

    fn peek(&self) -> Timestamp {
        let physical = Self::compose(wall_micros(), 0).value();
        Timestamp::new(physical.max(*self.last.lock()))
    }

    fn now_latest(&self) -> Timestamp {
        let now = self.now();
        Timestamp::new(now.value().saturating_add(self.max_error_micros() << LOGICAL_BITS))
    }

    fn update(&self, ts: Timestamp) -> Result<(), ClockError> {
        let mut last = self.last.lock();
        let reference = Self::compose(wall_micros(), 0).value().max(*last);
        let bound = Timestamp::new(
            reference
                .saturating_add(self.max_error_micros() << LOGICAL_BITS)
                .saturating_add(logical_mask()),
        );
        if ts > bound {
            warn!(requested = %ts, %bound, "rejecting clock update beyond max error");
            return Err(ClockError::TooFarAhead {
                requested: ts,
                bound,
            });
        }
        if ts.value() > *last {
            *last = ts.value();
        }
        Ok(())
    }

    fn wait_until_after(&self, ts: Timestamp, deadline: Instant) -> Result<(), ClockError> {
        let started = Instant::now();
        let target_micros = Self::physical_micros(ts).saturating_add(self.max_error_micros());
        loop {
            let now_micros = wall_micros();
            if now_micros > target_micros {
                debug!(%ts, waited = ?started.elapsed(), "commit-wait finished");
                return Ok(());
            }
            let remaining = Duration::from_micros(target_micros - now_micros + 1);
            let current = Instant::now();
            if current + remaining > deadline {
                return Err(ClockError::TimedOut {
                    target: ts,
                    waited: started.elapsed(),
                });
            }
            thread::sleep(remaining);
        }
    }
}
