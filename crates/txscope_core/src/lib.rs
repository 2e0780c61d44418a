//! # txscope core
//!
//! Nested, reference-counted transactions on top of a connection source.
//!
//! This crate provides:
//! - Join-or-create transactions, one per effective thread and scope
//! - Commit/close pairing where only the outermost level really commits
//! - Pre-commit and post-commit tasks with per-key de-duplication
//! - Caller-supplied locks held per nesting level
//! - One-time session setup per physical connection
//! - Thread affinity for handing a transaction to a worker thread
//! - An emergency sweep that closes everything at shutdown
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use txscope_core::{CommitPhase, Scope};
//! use txscope_pool::MemorySource;
//!
//! let pool = Arc::new(MemorySource::new("main", 4));
//! let scope = Scope::new(pool.clone());
//!
//! let outer = scope.ensure_transaction(&[]).unwrap();
//! outer.execute("INSERT INTO users VALUES (1)").unwrap();
//!
//! // A nested request joins the same transaction.
//! let inner = scope.ensure_transaction(&[]).unwrap();
//! assert_eq!(inner.depth(), 2);
//! inner
//!     .add_commit_task("notify", CommitPhase::PostCommit, || Ok(()))
//!     .unwrap();
//! inner.commit().unwrap();
//! inner.close().unwrap();
//!
//! outer.commit().unwrap(); // the real commit
//! outer.close().unwrap();
//!
//! assert_eq!(pool.connections()[0].commit_count(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod identity;
mod lock;
mod manager;
mod scope;
mod stats;
mod transaction;
mod types;

pub use config::ScopeConfig;
pub use error::{CoreError, CoreResult};
pub use identity::{
    ConnectionIdentityCache, SessionInfo, SessionInitializer, UuidSessionInitializer,
};
pub use lock::{ScopeLock, SharedLock, TransactionLock};
pub use manager::ScopeManager;
pub use scope::Scope;
pub use stats::{ScopeStats, StatsSnapshot};
pub use transaction::{
    CommitPhase, CommitTask, TaskKey, ThreadAffinityTable, Transaction, TransactionStatus,
};
pub use types::TransactionId;
