//! Scope statistics.
//!
//! Counters for monitoring how a scope uses its connection source.
//!
//! # Usage
//!
//! ```rust,ignore
//! let scope = Scope::new(source);
//! scope.in_transaction(&[], |txn| Ok(()))?;
//!
//! let stats = scope.stats();
//! println!("Committed: {}", stats.transactions_committed);
//! println!("Session inits: {}", stats.session_inits);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Scope statistics.
///
/// All counters are atomic and can be read while transactions are in
/// progress. Values are monotonically increasing.
#[derive(Debug, Default)]
pub struct ScopeStats {
    // Transaction counters
    /// Outermost transactions created.
    transactions_started: AtomicU64,
    /// Nested `ensure_transaction` calls that joined an existing transaction.
    transactions_joined: AtomicU64,
    /// Real commits issued to a connection.
    transactions_committed: AtomicU64,
    /// Transactions rolled back instead of committed.
    transactions_aborted: AtomicU64,
    /// Transactions closed by an emergency sweep.
    forced_closes: AtomicU64,

    // Connection counters
    /// Connections borrowed from the source.
    connections_acquired: AtomicU64,
    /// One-time session initializations that ran.
    session_inits: AtomicU64,
    /// Acquisitions that found the connection in the identity cache.
    identity_cache_hits: AtomicU64,

    // Task counters
    /// Commit tasks executed, deferred or immediate.
    commit_tasks_run: AtomicU64,
}

impl ScopeStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_join(&self) {
        self.transactions_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forced_close(&self) {
        self.forced_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_acquired(&self) {
        self.connections_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_init(&self) {
        self.session_inits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identity_cache_hit(&self) {
        self.identity_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_task(&self) {
        self.commit_tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of outermost transactions created.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the number of joins into an existing transaction.
    pub fn transactions_joined(&self) -> u64 {
        self.transactions_joined.load(Ordering::Relaxed)
    }

    /// Returns the number of real commits.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of rolled back transactions.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Returns the number of forcibly closed transactions.
    pub fn forced_closes(&self) -> u64 {
        self.forced_closes.load(Ordering::Relaxed)
    }

    /// Returns the number of connections borrowed.
    pub fn connections_acquired(&self) -> u64 {
        self.connections_acquired.load(Ordering::Relaxed)
    }

    /// Returns the number of session initializations.
    pub fn session_inits(&self) -> u64 {
        self.session_inits.load(Ordering::Relaxed)
    }

    /// Returns the number of identity cache hits.
    pub fn identity_cache_hits(&self) -> u64 {
        self.identity_cache_hits.load(Ordering::Relaxed)
    }

    /// Returns the number of commit tasks executed.
    pub fn commit_tasks_run(&self) -> u64 {
        self.commit_tasks_run.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_started: self.transactions_started(),
            transactions_joined: self.transactions_joined(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            forced_closes: self.forced_closes(),
            connections_acquired: self.connections_acquired(),
            session_inits: self.session_inits(),
            identity_cache_hits: self.identity_cache_hits(),
            commit_tasks_run: self.commit_tasks_run(),
        }
    }
}

/// A point-in-time snapshot of scope statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Outermost transactions created.
    pub transactions_started: u64,
    /// Joins into an existing transaction.
    pub transactions_joined: u64,
    /// Real commits.
    pub transactions_committed: u64,
    /// Rolled back transactions.
    pub transactions_aborted: u64,
    /// Forcibly closed transactions.
    pub forced_closes: u64,
    /// Connections borrowed.
    pub connections_acquired: u64,
    /// Session initializations.
    pub session_inits: u64,
    /// Identity cache hits.
    pub identity_cache_hits: u64,
    /// Commit tasks executed.
    pub commit_tasks_run: u64,
}
