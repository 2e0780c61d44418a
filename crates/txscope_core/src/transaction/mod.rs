//! Nested, reference-counted transactions.
//!
//! Any caller can ask its scope for "a transaction" without knowing whether
//! an ancestor already opened one:
//! - The first request on an effective thread borrows a connection and
//!   creates the transaction
//! - Later requests join it, pushing one nesting level each
//! - Only the outermost `commit()` commits the connection
//! - A level that closes without committing rolls back the whole unit
//! - Commit tasks run once, just before or just after the real commit

mod affinity;
mod registry;
mod state;
mod tasks;

pub use affinity::ThreadAffinityTable;
pub(crate) use registry::TransactionRegistry;
pub(crate) use state::TransactionInner;
pub use state::{Transaction, TransactionStatus};
pub use tasks::{CommitPhase, CommitTask, TaskKey};
