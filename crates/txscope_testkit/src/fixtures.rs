//! Test fixtures and scope helpers.
//!
//! Provides convenience functions for setting up scopes over an in-memory
//! pool and common test scenarios.

use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use txscope_core::{Scope, ScopeConfig, Transaction};
use txscope_pool::{ConnectionSource, MemoryConnection, MemorySource};

/// Acquire timeout used by test pools, short enough to surface deadlocks.
pub const TEST_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

static TRACING: Once = Once::new();

/// Installs a test-friendly `tracing` subscriber once per process.
///
/// Output goes through the test harness capture and is filtered by
/// `RUST_LOG` (default `warn`).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A scope over an in-memory pool, with the pool kept at hand for
/// inspection.
pub struct TestScope {
    /// The scope under test.
    pub scope: Scope,
    /// The pool backing the scope.
    pub pool: Arc<MemorySource>,
}

impl TestScope {
    /// Creates a scope over a pool of `capacity` connections.
    pub fn new(capacity: usize) -> Self {
        Self::with_config(capacity, ScopeConfig::default())
    }

    /// Creates a scope with custom configuration.
    pub fn with_config(capacity: usize, config: ScopeConfig) -> Self {
        init_tracing();
        let pool = Arc::new(
            MemorySource::new("test", capacity).with_acquire_timeout(TEST_ACQUIRE_TIMEOUT),
        );
        let scope = Scope::with_config(Arc::clone(&pool) as Arc<dyn ConnectionSource>, config);
        Self { scope, pool }
    }

    /// Returns the single physical connection of a one-connection pool.
    ///
    /// # Panics
    ///
    /// Panics unless the pool has opened exactly one connection.
    pub fn only_connection(&self) -> Arc<MemoryConnection> {
        let connections = self.pool.connections();
        assert_eq!(connections.len(), 1, "expected exactly one physical connection");
        Arc::clone(&connections[0])
    }

    /// Total real commits across all physical connections.
    pub fn total_commits(&self) -> u64 {
        self.pool.connections().iter().map(|c| c.commit_count()).sum()
    }

    /// Total rollbacks across all physical connections.
    pub fn total_rollbacks(&self) -> u64 {
        self.pool.connections().iter().map(|c| c.rollback_count()).sum()
    }

    /// Asserts that nothing is left open: no registered transaction on this
    /// thread and no borrowed connection.
    ///
    /// # Panics
    ///
    /// Panics if a transaction or connection leaked.
    pub fn assert_quiescent(&self) {
        assert!(
            !self.scope.is_transaction_active(),
            "transaction still active"
        );
        assert_eq!(self.scope.active_transactions(), 0, "transactions registered");
        assert_eq!(self.pool.outstanding(), 0, "connections still borrowed");
    }
}

impl std::ops::Deref for TestScope {
    type Target = Scope;

    fn deref(&self) -> &Self::Target {
        &self.scope
    }
}

/// Runs a test with a fresh one-connection scope.
///
/// # Example
///
/// ```rust
/// use txscope_testkit::with_test_scope;
///
/// with_test_scope(|ts| {
///     ts.in_transaction(&[], |txn| txn.execute("INSERT 1")).unwrap();
///     assert_eq!(ts.only_connection().commit_count(), 1);
/// });
/// ```
pub fn with_test_scope<F, R>(f: F) -> R
where
    F: FnOnce(&TestScope) -> R,
{
    let test_scope = TestScope::new(1);
    f(&test_scope)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Opens `depth` nested levels on the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if a level cannot be opened.
    pub fn open_levels(scope: &Scope, depth: usize) -> Vec<Transaction> {
        (0..depth)
            .map(|_| {
                scope
                    .ensure_transaction(&[])
                    .expect("Failed to open nesting level")
            })
            .collect()
    }

    /// Closes levels innermost first, committing each one before its close.
    ///
    /// # Panics
    ///
    /// Panics if any commit or close fails.
    pub fn commit_levels(levels: &[Transaction]) {
        for txn in levels.iter().rev() {
            txn.commit().expect("Failed to commit level");
            txn.close().expect("Failed to close level");
        }
    }
}
