use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical time value identifying a transaction's position in the commit order.
///
/// Timestamps are totally ordered. Three values are reserved:
/// [`Timestamp::MIN`] sorts before everything the clock can issue,
/// [`Timestamp::INITIAL`] is the first value a fresh clock hands out, and
/// [`Timestamp::MAX`] sorts after everything.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);
    pub const INITIAL: Timestamp = Timestamp(1);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Next timestamp, saturating at [`Timestamp::MAX`].
    pub const fn incremented(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Previous timestamp, saturating at [`Timestamp::MIN`].
    pub const fn decremented(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
