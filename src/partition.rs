use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{ConfigError, MvccConfig};
use crate::mvcc::{MvccError, MvccManager, Snapshot};
use crate::types::Timestamp;

/// Outcome of replaying logged commits into a fresh partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub replayed: usize,
    /// Highest replayed timestamp, now the partition's safe time.
    pub safe_time: Option<Timestamp>,
}

/// High-level partition abstraction composing configuration, clock and MVCC
/// bookkeeping.
pub struct Partition {
    config: MvccConfig,
    manager: Arc<MvccManager<dyn Clock>>,
}

impl Partition {
    pub fn new(config: MvccConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock = config.clock.build()?;
        Ok(Self::with_clock(config, clock))
    }

    /// Builds a partition around an externally owned clock.
    pub fn with_clock(config: MvccConfig, clock: Arc<dyn Clock>) -> Self {
        info!(partition = %config.partition_id, clock = ?config.clock.kind, "partition created");
        Self {
            config,
            manager: Arc::new(MvccManager::new(clock)),
        }
    }

    pub fn config(&self) -> &MvccConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<MvccManager<dyn Clock>> {
        &self.manager
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.manager.clock()
    }

    /// Re-applies transactions recovered from the log.
    ///
    /// Recovered commits may arrive in any order, so they are committed
    /// offline and the watermark only moves once, to the highest replayed
    /// timestamp, after every record is in. The whole batch is validated and
    /// the clock advanced before the manager is touched; a rejected batch
    /// leaves the partition as it was.
    pub fn replay(
        &self,
        committed: impl IntoIterator<Item = Timestamp>,
    ) -> Result<ReplaySummary, MvccError> {
        let records: Vec<Timestamp> = committed.into_iter().collect();
        let mut seen = BTreeSet::new();
        for &ts in &records {
            if !seen.insert(ts) {
                warn!(partition = %self.config.partition_id, %ts, "duplicate replay record");
                return Err(MvccError::AlreadyCommitted(ts));
            }
            self.manager.check_reservable_at(ts)?;
        }

        let safe_time = seen.last().copied();
        if let Some(safe_time) = safe_time {
            self.clock().update(safe_time)?;
            for &ts in &records {
                self.manager.start_transaction_at(ts)?;
                self.manager.start_applying_transaction(ts);
                self.manager.offline_commit_transaction(ts);
            }
            self.manager.offline_adjust_safe_time(safe_time);
        }

        let replayed = records.len();
        info!(
            partition = %self.config.partition_id,
            replayed,
            safe_time = ?safe_time,
            "replay finished"
        );
        Ok(ReplaySummary {
            replayed,
            safe_time,
        })
    }

    /// Waits for a clean snapshot at `ts` using the configured default deadline.
    pub fn wait_for_clean_snapshot_at(&self, ts: Timestamp) -> Result<Snapshot, MvccError> {
        let deadline = Instant::now() + self.config.default_wait_timeout();
        self.manager.wait_for_clean_snapshot_at(ts, deadline)
    }
}
