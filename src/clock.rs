//! Timestamp sources consumed by the MVCC manager.
//!
//! The manager only relies on the [`Clock`] contract. Two implementations ship
//! with the crate: a deterministic [`LogicalClock`] and a [`HybridClock`] that
//! folds wall-clock microseconds together with a logical counter.

mod hybrid;
mod logical;

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::types::Timestamp;

pub use hybrid::HybridClock;
pub use logical::LogicalClock;

/// Errors surfaced by clock implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("timed out after {waited:?} waiting for the clock to pass {target}")]
    TimedOut { target: Timestamp, waited: Duration },
    #[error("refusing to move clock from {current} back to {requested} (limit {limit})")]
    Regression {
        requested: Timestamp,
        current: Timestamp,
        limit: u64,
    },
    #[error("timestamp {requested} is beyond the clock's maximum error (upper bound {bound})")]
    TooFarAhead {
        requested: Timestamp,
        bound: Timestamp,
    },
}

/// Source of transaction timestamps.
pub trait Clock: Send + Sync {
    /// Returns a timestamp strictly greater than any previously returned one.
    fn now(&self) -> Timestamp;

    /// Latest time the clock has reached, without advancing it. Nothing the
    /// clock has issued is greater.
    fn peek(&self) -> Timestamp;

    /// Upper bound of the clock's uncertainty window. A timestamp drawn here is
    /// in the future relative to any clock reading taken concurrently elsewhere.
    fn now_latest(&self) -> Timestamp {
        self.now()
    }

    /// Folds an externally observed timestamp into the clock so later readings
    /// are strictly greater than `ts`.
    fn update(&self, ts: Timestamp) -> Result<(), ClockError>;

    /// Blocks until every clock in the system is guaranteed to read past `ts`,
    /// or `deadline` passes.
    fn wait_until_after(&self, ts: Timestamp, deadline: Instant) -> Result<(), ClockError>;
}
