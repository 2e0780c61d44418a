//! Error types for txscope core.

use crate::transaction::CommitPhase;
use crate::types::TransactionId;
use std::thread::ThreadId;
use thiserror::Error;
use txscope_pool::PoolError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in txscope core operations.
///
/// Variants fall into three groups:
/// - protocol violations (a caller broke the begin/commit/close contract),
///   see [`CoreError::is_protocol_violation`]
/// - connection source failures, surfaced unchanged and never retried
/// - aborts, where work was rolled back instead of committed
#[derive(Debug, Error)]
pub enum CoreError {
    /// Connection source or driver error.
    #[error("connection source error: {0}")]
    Pool(#[from] PoolError),

    /// An operation needed an active transaction and there is none.
    #[error("no active transaction for {operation}")]
    NoActiveTransaction {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// `commit()` was called again without the matching `close()`.
    #[error("{txn} was already committed; call close() before committing again")]
    AlreadyCommitted {
        /// The transaction.
        txn: TransactionId,
    },

    /// A nested scope committed but never closed before its parent committed.
    #[error("{txn} has a nested scope that committed but was never closed (depth {depth})")]
    UnclosedNestedScope {
        /// The transaction.
        txn: TransactionId,
        /// Depth at the time of the failed commit.
        depth: usize,
    },

    /// The transaction was aborted and can no longer commit.
    #[error("{txn} aborted: {reason}")]
    TransactionAborted {
        /// The transaction.
        txn: TransactionId,
        /// Reason for abort.
        reason: String,
    },

    /// `begin_transaction` was called while a transaction is active.
    #[error("a transaction is already active in scope '{scope}'")]
    TransactionAlreadyActive {
        /// Name of the scope.
        scope: String,
    },

    /// `close()` was called more times than the transaction was opened.
    #[error("{txn} closed more times than it was opened")]
    CloseUnderflow {
        /// The transaction.
        txn: TransactionId,
    },

    /// The thread already shares another thread's connections.
    #[error("thread {thread:?} is already sharing connections")]
    AlreadySharing {
        /// The borrowing thread.
        thread: ThreadId,
    },

    /// The thread is not sharing connections.
    #[error("thread {thread:?} is not sharing connections")]
    NotSharing {
        /// The thread.
        thread: ThreadId,
    },

    /// A deferred commit task failed.
    #[error("{phase:?} task '{key}' failed: {source}")]
    CommitTaskFailed {
        /// Key of the failed task.
        key: String,
        /// Phase the task ran in.
        phase: CommitPhase,
        /// The task's error.
        #[source]
        source: Box<CoreError>,
    },

    /// No scope is registered under the name.
    #[error("scope not found: {name}")]
    ScopeNotFound {
        /// Name of the scope.
        name: String,
    },

    /// A scope with the name is already registered.
    #[error("scope already registered: {name}")]
    DuplicateScope {
        /// Name of the scope.
        name: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a transaction aborted error.
    pub fn transaction_aborted(txn: TransactionId, reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            txn,
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the error means the caller broke the transaction
    /// protocol. These are bugs in the calling code and are never retried.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::NoActiveTransaction { .. }
                | Self::AlreadyCommitted { .. }
                | Self::UnclosedNestedScope { .. }
                | Self::TransactionAlreadyActive { .. }
                | Self::CloseUnderflow { .. }
                | Self::AlreadySharing { .. }
                | Self::NotSharing { .. }
                | Self::InvalidOperation { .. }
        )
    }
}
