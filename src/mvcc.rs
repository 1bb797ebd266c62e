pub mod manager;
pub mod scoped;
pub mod snapshot;

pub use manager::{MvccError, MvccManager, TxnState};
pub use scoped::ScopedWriteTransaction;
pub use snapshot::Snapshot;
