use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Immutable description of which timestamps are committed at one instant.
///
/// A timestamp is committed if it lies below `all_committed_before`, or if it
/// was committed out of order and is listed in `committed`. Nothing at or past
/// `none_committed_at_or_after` is committed.
///
/// Snapshots own their data. Once taken they can be cloned and shared across
/// readers without any coordination with the manager that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub(crate) all_committed_before: Timestamp,
    pub(crate) committed: BTreeSet<Timestamp>,
    pub(crate) none_committed_at_or_after: Timestamp,
}

impl Snapshot {
    pub fn new(
        all_committed_before: Timestamp,
        committed: impl IntoIterator<Item = Timestamp>,
        none_committed_at_or_after: Timestamp,
    ) -> Self {
        Self {
            all_committed_before,
            committed: committed.into_iter().collect(),
            none_committed_at_or_after,
        }
    }

    /// Snapshot in which every timestamp counts as committed.
    pub fn all_committed() -> Self {
        Self::new(Timestamp::MAX, [], Timestamp::MAX)
    }

    /// Snapshot in which nothing is committed.
    pub fn none_committed() -> Self {
        Self::new(Timestamp::MIN, [], Timestamp::MIN)
    }

    /// Snapshot that sees exactly the timestamps below `ts`.
    ///
    /// Used to read at a known-safe historical point without a live manager.
    pub fn clean_at(ts: Timestamp) -> Self {
        Self::new(ts, [], ts)
    }

    pub fn all_committed_before(&self) -> Timestamp {
        self.all_committed_before
    }

    pub fn none_committed_at_or_after(&self) -> Timestamp {
        self.none_committed_at_or_after
    }

    /// Timestamps committed out of order, in ascending order.
    pub fn committed_holes(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.committed.iter().copied()
    }

    /// True when the snapshot has no out-of-order commits.
    pub fn is_clean(&self) -> bool {
        self.committed.is_empty()
    }

    pub fn is_committed(&self, ts: Timestamp) -> bool {
        if ts < self.all_committed_before {
            return true;
        }
        if ts >= self.none_committed_at_or_after {
            return false;
        }
        self.committed.contains(&ts)
    }

    pub fn may_have_committed_transactions_at_or_after(&self, ts: Timestamp) -> bool {
        ts < self.none_committed_at_or_after
    }

    /// False only when every timestamp at or before `ts` is provably committed.
    ///
    /// When the watermark itself sits on a committed hole (the last in-flight
    /// transaction committed and nothing later exists to advance the
    /// watermark to), a query at the watermark reports nothing uncommitted.
    pub fn may_have_uncommitted_transactions_at_or_before(&self, ts: Timestamp) -> bool {
        ts > self.all_committed_before
            || (ts == self.all_committed_before && !self.committed.contains(&ts))
    }

    /// Adds an out-of-order commit, widening the upper bound when needed.
    pub(crate) fn add_committed(&mut self, ts: Timestamp) {
        if self.is_committed(ts) {
            return;
        }
        self.committed.insert(ts);
        if self.none_committed_at_or_after <= ts {
            self.none_committed_at_or_after = ts.incremented();
        }
    }

    /// Moves the watermark forward and drops holes that fall below it.
    pub(crate) fn advance_all_committed_before(&mut self, watermark: Timestamp) {
        if watermark <= self.all_committed_before {
            return;
        }
        self.all_committed_before = watermark;
        self.committed = self.committed.split_off(&watermark);
        if self.none_committed_at_or_after < watermark {
            self.none_committed_at_or_after = watermark;
        }
    }
}

impl Default for Snapshot {
    /// Fresh manager state: nothing committed before the first issued timestamp.
    fn default() -> Self {
        Self::clean_at(Timestamp::INITIAL)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "committed={{T|T < {}", self.all_committed_before)?;
        if !self.committed.is_empty() {
            f.write_str(" or (T in {")?;
            for (idx, ts) in self.committed.iter().enumerate() {
                if idx > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{ts}")?;
            }
            f.write_str("})")?;
        }
        f.write_str("}")
    }
}
