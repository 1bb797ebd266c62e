//! Core crate exports for rivet-mvcc.
//!
//! The modules exposed here cover MVCC visibility bookkeeping for a single
//! RivetDB partition: timestamps and the clocks that issue them, the manager
//! that tracks in-flight writes, and the snapshots readers use to decide what
//! they may see.

pub mod clock;
pub mod config;
pub mod mvcc;
pub mod partition;
pub mod types;

pub use clock::{Clock, ClockError, HybridClock, LogicalClock};
pub use config::{ClockConfig, ClockKind, ConfigError, MvccConfig};
pub use mvcc::{MvccError, MvccManager, ScopedWriteTransaction, Snapshot, TxnState};
pub use partition::{Partition, ReplaySummary};
pub use types::Timestamp;
