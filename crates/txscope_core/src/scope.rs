//! Scope: one logical database target and its transactions.

use crate::config::ScopeConfig;
use crate::error::{CoreError, CoreResult};
use crate::identity::{ConnectionIdentityCache, SessionInfo, SessionInitializer, UuidSessionInitializer};
use crate::lock::{LockSet, SharedLock};
use crate::stats::{ScopeStats, StatsSnapshot};
use crate::transaction::{
    CommitPhase, TaskKey, ThreadAffinityTable, Transaction, TransactionInner, TransactionRegistry,
};
use crate::types::TransactionId;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use txscope_pool::{ConnectionSource, RawConnection, SharedConnection};

/// State shared between a scope and the transactions it hands out.
#[derive(Debug)]
pub(crate) struct ScopeShared {
    pub(crate) name: String,
    pub(crate) registry: TransactionRegistry,
    pub(crate) stats: ScopeStats,
}

/// The entry point for transactional work against one connection source.
///
/// A scope is created once at startup and lives as long as the process.
/// It provides:
/// - Join-or-create transactions per effective thread
/// - Borrowing connections outside of transactions
/// - Commit task scheduling
/// - One-time session setup per physical connection
/// - Thread affinity for handing a transaction to a worker thread
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use txscope_core::Scope;
/// use txscope_pool::MemorySource;
///
/// let scope = Scope::new(Arc::new(MemorySource::new("main", 4)));
///
/// scope
///     .in_transaction(&[], |txn| {
///         txn.execute("INSERT INTO t VALUES (1)")?;
///         Ok(())
///     })
///     .unwrap();
///
/// assert!(!scope.is_transaction_active());
/// ```
pub struct Scope {
    shared: Arc<ScopeShared>,
    source: Arc<dyn ConnectionSource>,
    config: ScopeConfig,
    affinity: Arc<ThreadAffinityTable>,
    sessions: ConnectionIdentityCache<SessionInfo>,
    initializer: Arc<dyn SessionInitializer>,
}

impl Scope {
    /// Creates a scope with default configuration.
    pub fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self::with_config(source, ScopeConfig::default())
    }

    /// Creates a scope with custom configuration.
    pub fn with_config(source: Arc<dyn ConnectionSource>, config: ScopeConfig) -> Self {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| source.name().to_string());
        Self {
            shared: Arc::new(ScopeShared {
                name,
                registry: TransactionRegistry::new(),
                stats: ScopeStats::new(),
            }),
            source,
            sessions: ConnectionIdentityCache::new(config.identity_cache_capacity),
            config,
            affinity: Arc::new(ThreadAffinityTable::new()),
            initializer: Arc::new(UuidSessionInitializer),
        }
    }

    /// Replaces the one-time session setup.
    #[must_use]
    pub fn with_initializer(mut self, initializer: Arc<dyn SessionInitializer>) -> Self {
        self.initializer = initializer;
        self
    }

    /// Uses a thread affinity table shared with other scopes.
    #[must_use]
    pub fn with_affinity(mut self, affinity: Arc<ThreadAffinityTable>) -> Self {
        self.affinity = affinity;
        self
    }

    /// Returns the scope name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    /// Returns the connection source.
    #[must_use]
    pub fn source(&self) -> &Arc<dyn ConnectionSource> {
        &self.source
    }

    /// Returns the thread affinity table this scope resolves threads with.
    #[must_use]
    pub fn affinity(&self) -> &Arc<ThreadAffinityTable> {
        &self.affinity
    }

    /// Returns a snapshot of the scope's counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Number of transactions currently registered across all threads.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.shared.registry.len()
    }

    /// Number of connections with cached session metadata.
    #[must_use]
    pub fn cached_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Drops cached sessions whose connections no longer exist.
    pub fn purge_sessions(&self) -> usize {
        self.sessions.purge()
    }

    /// Joins the transaction of the calling thread, or starts one.
    ///
    /// A new transaction borrows its connection first and acquires `locks`
    /// afterwards; a joined transaction already holds its connection, so
    /// only `locks` are acquired. Either way the returned handle has one new
    /// nesting level that must be closed.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be borrowed or session setup
    /// fails.
    pub fn ensure_transaction(&self, locks: &[SharedLock]) -> CoreResult<Transaction> {
        let thread = self.affinity.current();
        loop {
            if let Some(inner) = self.shared.registry.get(thread) {
                if let Some(txn) = self.join(inner, locks) {
                    return Ok(txn);
                }
                // Finishing on another thread; wait for it to unregister.
                thread::yield_now();
                continue;
            }
            match self.create(thread, locks) {
                Err(CoreError::TransactionAlreadyActive { .. }) => continue,
                result => return result,
            }
        }
    }

    /// Starts a new transaction on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `TransactionAlreadyActive` if the thread already has one, or
    /// an error if no connection can be borrowed.
    pub fn begin_transaction(&self, locks: &[SharedLock]) -> CoreResult<Transaction> {
        let thread = self.affinity.current();
        if self.shared.registry.get(thread).is_some() {
            return Err(CoreError::TransactionAlreadyActive {
                scope: self.name().to_string(),
            });
        }
        self.create(thread, locks)
    }

    /// Runs `f` inside a transaction level.
    ///
    /// The level commits if `f` succeeds and is closed on every path.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, from committing, or from closing.
    pub fn in_transaction<T, F>(&self, locks: &[SharedLock], f: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction) -> CoreResult<T>,
    {
        let txn = self.ensure_transaction(locks)?;
        let result = f(&txn).and_then(|value| txn.commit().map(|()| value));
        let closed = txn.close();

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                tracing::warn!(txn = %txn.id(), error = %close_err, "close failed after error");
                Err(err)
            }
        }
    }

    /// Returns the transaction active on the calling thread.
    #[must_use]
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.shared
            .registry
            .get(self.affinity.current())
            .map(|inner| Transaction::from_parts(inner, Arc::clone(&self.shared)))
    }

    /// Checks if the calling thread has an active transaction.
    #[must_use]
    pub fn is_transaction_active(&self) -> bool {
        self.shared
            .registry
            .get(self.affinity.current())
            .is_some()
    }

    /// Runs `f` against a connection.
    ///
    /// Inside a transaction this is the transaction's connection. Otherwise
    /// a connection is borrowed in auto-commit mode and returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or an error borrowing or returning the
    /// connection.
    pub fn with_connection<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&dyn RawConnection) -> CoreResult<T>,
    {
        if let Some(connection) = self
            .current_transaction()
            .and_then(|txn| txn.connection().ok())
        {
            return f(connection.as_ref());
        }

        let (connection, _) = self.open_connection()?;
        let result = f(connection.as_ref());
        let released = self.source.release(connection);
        let value = result?;
        released?;
        Ok(value)
    }

    /// Defers `action` into the calling thread's transaction, or runs it
    /// right away if there is none.
    ///
    /// # Errors
    ///
    /// Returns the action's error if it ran immediately, or the errors of
    /// [`Transaction::add_commit_task`].
    pub fn add_commit_task<F>(
        &self,
        key: impl Into<TaskKey>,
        phase: CommitPhase,
        action: F,
    ) -> CoreResult<bool>
    where
        F: FnOnce() -> CoreResult<()> + Send + 'static,
    {
        match self.current_transaction() {
            Some(txn) => txn.add_commit_task(key, phase, action),
            None => {
                self.shared.stats.record_commit_task();
                action()?;
                Ok(true)
            }
        }
    }

    /// Lets `borrower` observe the calling thread's transactions.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySharing` if `borrower` is already sharing.
    pub fn share_connections(&self, borrower: ThreadId) -> CoreResult<()> {
        self.affinity.share(borrower, thread::current().id())
    }

    /// Ends a redirect created by [`Scope::share_connections`].
    ///
    /// # Errors
    ///
    /// Returns `NotSharing` if `borrower` is not sharing.
    pub fn stop_sharing_connections(&self, borrower: ThreadId) -> CoreResult<()> {
        self.affinity.stop_sharing(borrower).map(|_| ())
    }

    /// Rolls back and unregisters every transaction of this scope.
    ///
    /// For emergency cleanup at shutdown only: nothing is committed and
    /// commit tasks are dropped. Returns the number of transactions closed.
    pub fn close_all_transactions(&self) -> usize {
        let drained = self.shared.registry.drain();
        let count = drained.len();
        for inner in drained {
            let txn = Transaction::from_parts(inner, Arc::clone(&self.shared));
            if let Err(err) = txn.force_close() {
                tracing::error!(txn = %txn.id(), error = %err, "forced close failed");
            }
        }
        count
    }

    fn join(&self, inner: Arc<TransactionInner>, locks: &[SharedLock]) -> Option<Transaction> {
        let id = inner.id();
        let level = LockSet::acquire(id, locks);
        match inner.push_level(level) {
            Ok(depth) => {
                self.shared.stats.record_transaction_join();
                tracing::trace!(txn = %id, depth, "joined transaction");
                Some(Transaction::from_parts(inner, Arc::clone(&self.shared)))
            }
            Err(level) => {
                level.release(id);
                None
            }
        }
    }

    fn create(&self, thread: ThreadId, locks: &[SharedLock]) -> CoreResult<Transaction> {
        // Connection first, then locks.
        let (connection, session) = self.open_connection()?;
        if let Err(err) = connection.begin() {
            self.release_quietly(connection);
            return Err(err.into());
        }

        let id = TransactionId::next();
        let level = LockSet::acquire(id, locks);
        let inner = Arc::new(TransactionInner::new(
            id,
            thread,
            connection,
            session,
            Arc::clone(&self.source),
            level,
            self.config.capture_creation_trace,
        ));

        if self
            .shared
            .registry
            .insert_if_absent(thread, Arc::clone(&inner))
            .is_err()
        {
            inner.abandon()?;
            return Err(CoreError::TransactionAlreadyActive {
                scope: self.name().to_string(),
            });
        }

        self.shared.stats.record_transaction_start();
        tracing::debug!(txn = %id, scope = %self.shared.name, "transaction started");
        Ok(Transaction::from_parts(inner, Arc::clone(&self.shared)))
    }

    /// Borrows a connection and makes sure its session is set up.
    fn open_connection(&self) -> CoreResult<(SharedConnection, SessionInfo)> {
        let connection = self.source.acquire()?;
        self.shared.stats.record_connection_acquired();

        let initializer = &self.initializer;
        let setup = self
            .sessions
            .get_or_try_insert_with(&connection, || initializer.initialize(connection.as_ref()));

        match setup {
            Ok((session, true)) => {
                self.shared.stats.record_identity_cache_hit();
                Ok((connection, session))
            }
            Ok((session, false)) => {
                self.shared.stats.record_session_init();
                tracing::debug!(
                    connection = connection.label(),
                    session = %session.session_id,
                    "initialized session"
                );
                Ok((connection, session))
            }
            Err(err) => {
                self.release_quietly(connection);
                Err(err)
            }
        }
    }

    fn release_quietly(&self, connection: SharedConnection) {
        let label = connection.label().to_string();
        if let Err(err) = self.source.release(connection) {
            tracing::warn!(connection = %label, error = %err, "failed to return connection");
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.shared.name)
            .field("active_transactions", &self.active_transactions())
            .field("cached_sessions", &self.cached_sessions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ScopeLock;
    use crate::transaction::TransactionStatus;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use txscope_pool::{MemoryConnection, MemorySource, PoolError};

    fn create_scope(capacity: usize) -> (Arc<MemorySource>, Scope) {
        let pool = Arc::new(
            MemorySource::new("test", capacity).with_acquire_timeout(Duration::from_millis(500)),
        );
        let scope = Scope::new(Arc::clone(&pool) as Arc<dyn ConnectionSource>);
        (pool, scope)
    }

    fn only_connection(pool: &MemorySource) -> Arc<MemoryConnection> {
        let connections = pool.connections();
        assert_eq!(connections.len(), 1);
        Arc::clone(&connections[0])
    }

    // === Lifecycle ===

    #[test]
    fn ensure_creates_and_outermost_commit_commits() {
        let (pool, scope) = create_scope(1);

        let txn = scope.ensure_transaction(&[]).unwrap();
        assert!(scope.is_transaction_active());
        assert_eq!(txn.depth(), 1);
        txn.execute("INSERT 1").unwrap();

        txn.commit().unwrap();
        txn.close().unwrap();

        let conn = only_connection(&pool);
        assert_eq!(conn.committed_statements(), vec!["INSERT 1"]);
        assert_eq!(conn.commit_count(), 1);
        assert_eq!(pool.outstanding(), 0);
        assert!(!scope.is_transaction_active());
        assert!(txn.is_closed());
        assert_eq!(txn.status(), TransactionStatus::Committed);
    }

    #[test]
    fn nested_requests_converge_on_one_transaction() {
        let (pool, scope) = create_scope(2);

        let outer = scope.ensure_transaction(&[]).unwrap();
        let inner = scope.ensure_transaction(&[]).unwrap();

        assert_eq!(outer, inner);
        assert_eq!(outer.depth(), 2);
        assert_eq!(pool.acquired_count(), 1);
        assert_eq!(
            txscope_pool::connection_addr(&outer.connection().unwrap()),
            txscope_pool::connection_addr(&inner.connection().unwrap())
        );

        inner.commit().unwrap();
        inner.close().unwrap();
        outer.commit().unwrap();
        outer.close().unwrap();
    }

    #[test]
    fn single_real_commit_at_every_depth() {
        for depth in 1..=6 {
            let (pool, scope) = create_scope(1);
            let levels: Vec<_> = (0..depth)
                .map(|_| scope.ensure_transaction(&[]).unwrap())
                .collect();
            let conn = only_connection(&pool);

            for (index, txn) in levels.iter().enumerate().rev() {
                txn.commit().unwrap();
                let expected = if index == 0 { 1 } else { 0 };
                assert_eq!(conn.commit_count(), expected, "depth {depth}, level {index}");
                txn.close().unwrap();
            }
            assert_eq!(conn.commit_count(), 1);
            assert_eq!(scope.stats().transactions_committed, 1);
        }
    }

    #[test]
    fn commit_then_close_decrements_once() {
        let (_pool, scope) = create_scope(1);
        let outer = scope.ensure_transaction(&[]).unwrap();
        let inner = scope.ensure_transaction(&[]).unwrap();
        assert_eq!(outer.depth(), 2);

        inner.commit().unwrap();
        assert_eq!(outer.depth(), 1);
        inner.close().unwrap();
        assert_eq!(outer.depth(), 1);
        assert!(outer.is_active());

        outer.commit().unwrap();
        outer.close().unwrap();
    }

    #[test]
    fn uncommitted_nested_scope_rolls_back_everything() {
        let (pool, scope) = create_scope(1);
        let outer = scope.ensure_transaction(&[]).unwrap();
        outer.execute("INSERT outer").unwrap();

        let inner = scope.ensure_transaction(&[]).unwrap();
        inner.execute("INSERT inner").unwrap();
        inner.close().unwrap();
        assert!(outer.is_aborted());

        let result = outer.commit();
        assert!(matches!(result, Err(CoreError::TransactionAborted { .. })));
        outer.close().unwrap();

        let conn = only_connection(&pool);
        assert_eq!(conn.commit_count(), 0);
        assert_eq!(conn.rollback_count(), 1);
        assert!(conn.committed_statements().is_empty());
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(outer.status(), TransactionStatus::RolledBack);
        assert!(!scope.is_transaction_active());
    }

    #[test]
    fn outermost_close_without_commit_rolls_back() {
        let (pool, scope) = create_scope(1);
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.execute("INSERT 1").unwrap();
        txn.close().unwrap();

        let conn = only_connection(&pool);
        assert_eq!(conn.rollback_count(), 1);
        assert_eq!(scope.stats().transactions_aborted, 1);
        assert_eq!(pool.outstanding(), 0);
    }

    // === Protocol violations ===

    #[test]
    fn commit_with_no_active_transaction_fails() {
        let (_pool, scope) = create_scope(1);
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.commit().unwrap();
        txn.close().unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, CoreError::NoActiveTransaction { .. }));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn second_commit_fails() {
        let (pool, scope) = create_scope(1);
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.commit().unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, CoreError::AlreadyCommitted { .. }));
        txn.close().unwrap();
        assert_eq!(only_connection(&pool).commit_count(), 1);
    }

    #[test]
    fn unclosed_nested_scope_fails_outer_commit() {
        let (pool, scope) = create_scope(1);
        let outer = scope.ensure_transaction(&[]).unwrap();
        let inner = scope.ensure_transaction(&[]).unwrap();
        inner.commit().unwrap();

        let err = outer.commit().unwrap_err();
        assert!(matches!(err, CoreError::UnclosedNestedScope { depth: 1, .. }));
        assert!(err.is_protocol_violation());
        assert_eq!(only_connection(&pool).commit_count(), 0);
    }

    #[test]
    fn extra_close_is_rejected() {
        let (_pool, scope) = create_scope(1);
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.commit().unwrap();
        txn.close().unwrap();

        let err = txn.close().unwrap_err();
        assert!(matches!(err, CoreError::CloseUnderflow { .. }));
    }

    #[test]
    fn begin_rejects_when_transaction_active() {
        let (_pool, scope) = create_scope(2);
        let txn = scope.begin_transaction(&[]).unwrap();

        let err = scope.begin_transaction(&[]).unwrap_err();
        assert!(matches!(err, CoreError::TransactionAlreadyActive { .. }));

        txn.close().unwrap();
        assert!(scope.begin_transaction(&[]).is_ok());
    }

    #[test]
    fn connection_source_failure_surfaces() {
        let (pool, scope) = create_scope(1);
        pool.fail_next_acquire();

        let err = scope.ensure_transaction(&[]).unwrap_err();
        assert!(matches!(err, CoreError::Pool(PoolError::Driver(_))));
        assert!(!err.is_protocol_violation());
        assert!(!scope.is_transaction_active());
    }

    #[test]
    fn pool_exhaustion_surfaces() {
        let pool = Arc::new(MemorySource::new("p", 1).with_acquire_timeout(Duration::from_millis(20)));
        let scope = Scope::new(Arc::clone(&pool) as Arc<dyn ConnectionSource>);
        let _held = pool.acquire().unwrap();

        let err = scope.ensure_transaction(&[]).unwrap_err();
        assert!(matches!(err, CoreError::Pool(PoolError::Exhausted { .. })));
    }

    #[test]
    fn failed_connection_commit_rolls_back() {
        let (pool, scope) = create_scope(1);
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.execute("INSERT 1").unwrap();
        only_connection(&pool).fail_next_commit();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, CoreError::Pool(PoolError::Driver(_))));
        assert_eq!(txn.status(), TransactionStatus::RolledBack);
        txn.close().unwrap();

        assert!(only_connection(&pool).committed_statements().is_empty());
        assert_eq!(pool.outstanding(), 0);
        assert!(!scope.is_transaction_active());
    }

    // === Commit tasks ===

    #[test]
    fn tasks_run_in_order_around_the_real_commit() {
        let (pool, scope) = create_scope(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.execute("INSERT row").unwrap();
        let conn = only_connection(&pool);

        for name in ["pre a", "pre b"] {
            let log = Arc::clone(&log);
            let conn = Arc::clone(&conn);
            txn.add_commit_task(name, CommitPhase::PreCommit, move || {
                assert!(conn.committed_statements().is_empty());
                assert_eq!(conn.pending_statements(), vec!["INSERT row"]);
                log.lock().push(name);
                Ok(())
            })
            .unwrap();
        }
        {
            let log = Arc::clone(&log);
            let conn = Arc::clone(&conn);
            txn.add_commit_task("post", CommitPhase::PostCommit, move || {
                assert_eq!(conn.committed_statements(), vec!["INSERT row"]);
                log.lock().push("post");
                Ok(())
            })
            .unwrap();
        }

        assert_eq!(txn.pending_tasks(CommitPhase::PreCommit), 2);
        txn.commit().unwrap();
        txn.close().unwrap();
        assert_eq!(*log.lock(), vec!["pre a", "pre b", "post"]);
    }

    #[test]
    fn equal_tasks_run_once() {
        let (_pool, scope) = create_scope(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let txn = scope.ensure_transaction(&[]).unwrap();

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            scope
                .add_commit_task("invalidate-cache", CommitPhase::PostCommit, move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        txn.commit().unwrap();
        txn.close().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_requeuing_its_own_key_runs_again() {
        let (_pool, scope) = create_scope(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let txn = scope.ensure_transaction(&[]).unwrap();

        let handle = txn.clone();
        let counter = Arc::clone(&runs);
        txn.add_commit_task("flush", CommitPhase::PreCommit, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let counter = Arc::clone(&counter);
            handle
                .add_commit_task("flush", CommitPhase::PreCommit, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .map(|_| ())
        })
        .unwrap();

        txn.commit().unwrap();
        txn.close().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pre_commit_task_can_write_through_the_transaction() {
        let (pool, scope) = create_scope(1);
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.execute("INSERT row").unwrap();

        let handle = txn.clone();
        txn.add_commit_task("audit", CommitPhase::PreCommit, move || {
            handle.execute("INSERT audit")
        })
        .unwrap();

        txn.commit().unwrap();
        txn.close().unwrap();
        assert_eq!(
            only_connection(&pool).committed_statements(),
            vec!["INSERT row", "INSERT audit"]
        );
    }

    #[test]
    fn pre_commit_task_joins_the_commit_in_progress() {
        let (pool, scope) = create_scope(1);
        let scope = Arc::new(scope);
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.execute("INSERT row").unwrap();

        let task_scope = Arc::clone(&scope);
        txn.add_commit_task("final", CommitPhase::PreCommit, move || {
            task_scope.in_transaction(&[], |nested| nested.execute("INSERT final"))
        })
        .unwrap();

        // Commit from a borrower thread so a hang fails the test instead of
        // blocking it.
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();
        let committing = txn.clone();
        let worker = thread::spawn(move || {
            go_rx.recv().unwrap();
            done_tx.send(committing.commit()).unwrap();
        });
        let borrower = worker.thread().id();
        scope.share_connections(borrower).unwrap();
        go_tx.send(()).unwrap();

        let committed = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("commit did not return");
        committed.unwrap();
        worker.join().unwrap();
        scope.stop_sharing_connections(borrower).unwrap();
        txn.close().unwrap();

        assert_eq!(
            only_connection(&pool).committed_statements(),
            vec!["INSERT row", "INSERT final"]
        );
        assert_eq!(txn.status(), TransactionStatus::Committed);
        assert_eq!(scope.active_transactions(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn uncommitted_level_inside_pre_commit_task_rolls_back() {
        let (pool, scope) = create_scope(1);
        let scope = Arc::new(scope);
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.execute("INSERT row").unwrap();

        let task_scope = Arc::clone(&scope);
        txn.add_commit_task("final", CommitPhase::PreCommit, move || {
            let nested = task_scope.ensure_transaction(&[])?;
            nested.execute("INSERT final")?;
            nested.close()
        })
        .unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, CoreError::TransactionAborted { .. }));
        txn.close().unwrap();

        let conn = only_connection(&pool);
        assert!(conn.committed_statements().is_empty());
        assert_eq!(conn.rollback_count(), 1);
        assert_eq!(pool.outstanding(), 0);
        assert!(!scope.is_transaction_active());
    }

    #[test]
    fn commit_inside_pre_commit_task_is_rejected() {
        let (_pool, scope) = create_scope(1);
        let txn = scope.ensure_transaction(&[]).unwrap();
        let seen = Arc::new(Mutex::new(None));

        let handle = txn.clone();
        let result = Arc::clone(&seen);
        txn.add_commit_task("again", CommitPhase::PreCommit, move || {
            *result.lock() = Some(handle.commit());
            Ok(())
        })
        .unwrap();

        txn.commit().unwrap();
        txn.close().unwrap();
        assert!(matches!(
            seen.lock().take(),
            Some(Err(CoreError::AlreadyCommitted { .. }))
        ));
    }

    #[test]
    fn task_without_transaction_runs_immediately() {
        let (_pool, scope) = create_scope(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        scope
            .add_commit_task("now", CommitPhase::PostCommit, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_are_dropped_on_rollback() {
        let (_pool, scope) = create_scope(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let txn = scope.ensure_transaction(&[]).unwrap();

        for phase in [CommitPhase::PreCommit, CommitPhase::PostCommit] {
            let counter = Arc::clone(&ran);
            txn.add_commit_task(TaskKey::anonymous(), phase, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        txn.close().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let err = txn
            .add_commit_task("late", CommitPhase::PostCommit, || Ok(()))
            .unwrap_err();
        assert!(matches!(err, CoreError::TransactionAborted { .. }));
    }

    #[test]
    fn failing_pre_commit_task_rolls_back() {
        let (pool, scope) = create_scope(1);
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.execute("INSERT 1").unwrap();
        txn.add_commit_task("check", CommitPhase::PreCommit, || {
            Err(CoreError::invalid_operation("constraint violated"))
        })
        .unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(
            err,
            CoreError::CommitTaskFailed {
                phase: CommitPhase::PreCommit,
                ..
            }
        ));
        txn.close().unwrap();

        let conn = only_connection(&pool);
        assert!(conn.committed_statements().is_empty());
        assert_eq!(conn.rollback_count(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn failing_post_commit_task_keeps_the_commit() {
        let (pool, scope) = create_scope(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let txn = scope.ensure_transaction(&[]).unwrap();
        txn.execute("INSERT 1").unwrap();
        txn.add_commit_task("bad", CommitPhase::PostCommit, || {
            Err(CoreError::invalid_operation("cache unavailable"))
        })
        .unwrap();
        let counter = Arc::clone(&ran);
        txn.add_commit_task("good", CommitPhase::PostCommit, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, CoreError::CommitTaskFailed { .. }));
        txn.close().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(only_connection(&pool).committed_statements(), vec!["INSERT 1"]);
    }

    // === Locks ===

    #[test]
    fn nested_locks_release_as_levels_pop() {
        let (_pool, scope) = create_scope(1);
        let outer_lock = Arc::new(ScopeLock::new("outer"));
        let inner_lock = Arc::new(ScopeLock::new("inner"));

        let outer = scope
            .ensure_transaction(&[Arc::clone(&outer_lock) as SharedLock])
            .unwrap();
        let inner = scope
            .ensure_transaction(&[Arc::clone(&inner_lock) as SharedLock])
            .unwrap();
        assert_eq!(inner_lock.owner(), Some(outer.id()));

        inner.commit().unwrap();
        assert_eq!(inner_lock.owner(), None);
        assert_eq!(outer_lock.owner(), Some(outer.id()));
        inner.close().unwrap();

        outer.commit().unwrap();
        assert_eq!(outer_lock.owner(), None);
        outer.close().unwrap();
    }

    #[test]
    fn locks_release_when_closed_without_commit() {
        let (_pool, scope) = create_scope(1);
        let lock = Arc::new(ScopeLock::new("l"));
        let txn = scope
            .ensure_transaction(&[Arc::clone(&lock) as SharedLock])
            .unwrap();
        txn.close().unwrap();
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn same_lock_at_two_levels_is_reentrant() {
        let (_pool, scope) = create_scope(1);
        let lock = Arc::new(ScopeLock::new("l"));
        let shared = Arc::clone(&lock) as SharedLock;

        let outer = scope.ensure_transaction(&[Arc::clone(&shared)]).unwrap();
        let inner = scope.ensure_transaction(&[shared]).unwrap();
        assert_eq!(lock.hold_count(), 2);

        inner.commit().unwrap();
        inner.close().unwrap();
        assert_eq!(lock.hold_count(), 1);
        outer.commit().unwrap();
        outer.close().unwrap();
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn transactions_on_different_threads_serialize_on_a_lock() {
        let (pool, scope) = create_scope(2);
        let lock = ScopeLock::shared("table");
        let counter = Arc::new(AtomicUsize::new(0));

        thread::scope(|s| {
            for _ in 0..4 {
                let scope = &scope;
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                s.spawn(move || {
                    for _ in 0..10 {
                        scope
                            .in_transaction(&[Arc::clone(&lock)], |txn| {
                                let before = counter.load(Ordering::SeqCst);
                                txn.execute("UPDATE t")?;
                                counter.store(before + 1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), 40);
        assert_eq!(scope.stats().transactions_committed, 40);
        assert_eq!(pool.outstanding(), 0);
    }

    // === Thread affinity ===

    #[test]
    fn shared_thread_sees_donor_transaction() {
        let (_pool, scope) = create_scope(2);
        let txn = scope.ensure_transaction(&[]).unwrap();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel();

        thread::scope(|s| {
            let scope = &scope;
            let worker = s.spawn(move || {
                go_rx.recv().unwrap();
                let label = scope
                    .current_transaction()
                    .map(|t| t.connection().unwrap().label().to_string());
                seen_tx.send(label).unwrap();
                go_rx.recv().unwrap();
                scope.current_transaction().map(|t| t.id())
            });

            let worker_id = worker.thread().id();
            scope.share_connections(worker_id).unwrap();
            go_tx.send(()).unwrap();
            assert_eq!(
                seen_rx.recv().unwrap(),
                Some(txn.connection().unwrap().label().to_string())
            );

            scope.stop_sharing_connections(worker_id).unwrap();
            go_tx.send(()).unwrap();
            assert_eq!(worker.join().unwrap(), None);
        });

        txn.commit().unwrap();
        txn.close().unwrap();
    }

    #[test]
    fn borrower_joins_instead_of_opening_a_second_connection() {
        let (pool, scope) = create_scope(2);
        let txn = scope.ensure_transaction(&[]).unwrap();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        thread::scope(|s| {
            let scope = &scope;
            let worker = s.spawn(move || {
                go_rx.recv().unwrap();
                scope.in_transaction(&[], |nested| {
                    assert_eq!(nested.depth(), 2);
                    nested.execute("INSERT from worker")
                })
            });
            let worker_id = worker.thread().id();
            scope.share_connections(worker_id).unwrap();
            go_tx.send(()).unwrap();
            worker.join().unwrap().unwrap();
            scope.stop_sharing_connections(worker_id).unwrap();
        });

        assert_eq!(pool.acquired_count(), 1);
        txn.commit().unwrap();
        txn.close().unwrap();
        assert_eq!(
            only_connection(&pool).committed_statements(),
            vec!["INSERT from worker"]
        );
    }

    #[test]
    fn sharing_twice_is_rejected() {
        let (_pool, scope) = create_scope(1);
        let other = thread::spawn(|| thread::current().id()).join().unwrap();
        scope.share_connections(other).unwrap();

        let err = scope.share_connections(other).unwrap_err();
        assert!(matches!(err, CoreError::AlreadySharing { .. }));
        scope.stop_sharing_connections(other).unwrap();
        assert!(scope.stop_sharing_connections(other).is_err());
    }

    // === Connections and sessions ===

    #[test]
    fn session_setup_runs_once_per_physical_connection() {
        let (_pool, scope) = create_scope(1);

        let sessions: Vec<String> = (0..3)
            .map(|_| {
                scope
                    .in_transaction(&[], |txn| Ok(txn.session().session_id.clone()))
                    .unwrap()
            })
            .collect();

        assert!(sessions.iter().all(|s| s == &sessions[0]));
        let stats = scope.stats();
        assert_eq!(stats.session_inits, 1);
        assert_eq!(stats.identity_cache_hits, 2);
    }

    #[test]
    fn retired_connection_reinitializes_exactly_once_more() {
        let (pool, scope) = create_scope(1);
        scope.in_transaction(&[], |_| Ok(())).unwrap();
        assert_eq!(scope.stats().session_inits, 1);

        assert_eq!(pool.retire_idle(), 1);
        assert_eq!(scope.purge_sessions(), 1);

        scope.in_transaction(&[], |_| Ok(())).unwrap();
        scope.in_transaction(&[], |_| Ok(())).unwrap();
        assert_eq!(scope.stats().session_inits, 2);
        assert_eq!(scope.cached_sessions(), 1);
    }

    #[test]
    fn custom_initializer_prepares_connection() {
        let pool = Arc::new(MemorySource::new("p", 1));
        let inits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&inits);
        let scope = Scope::new(Arc::clone(&pool) as Arc<dyn ConnectionSource>).with_initializer(
            Arc::new(move |conn: &dyn RawConnection| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                conn.execute("SET search_path = app")?;
                Ok(SessionInfo::new(format!("session-{n}")))
            }),
        );

        for _ in 0..2 {
            scope
                .in_transaction(&[], |txn| {
                    assert_eq!(txn.session().session_id, "session-0");
                    Ok(())
                })
                .unwrap();
        }

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(
            only_connection(&pool).committed_statements(),
            vec!["SET search_path = app"]
        );
    }

    #[test]
    fn failed_session_setup_returns_connection() {
        let pool = Arc::new(MemorySource::new("p", 1));
        let scope = Scope::new(Arc::clone(&pool) as Arc<dyn ConnectionSource>).with_initializer(
            Arc::new(|_: &dyn RawConnection| -> CoreResult<SessionInfo> {
                Err(CoreError::invalid_operation("unsupported server version"))
            }),
        );

        assert!(scope.ensure_transaction(&[]).is_err());
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(scope.cached_sessions(), 0);
    }

    #[test]
    fn with_connection_uses_transaction_connection() {
        let (pool, scope) = create_scope(2);
        let txn = scope.ensure_transaction(&[]).unwrap();

        scope.with_connection(|conn| Ok(conn.execute("INSERT inside")?)).unwrap();
        assert_eq!(pool.acquired_count(), 1);

        txn.close().unwrap();
        assert!(pool.connections()[0].committed_statements().is_empty());
    }

    #[test]
    fn with_connection_borrows_outside_transaction() {
        let (pool, scope) = create_scope(1);

        scope.with_connection(|conn| Ok(conn.execute("SELECT 1")?)).unwrap();

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(only_connection(&pool).committed_statements(), vec!["SELECT 1"]);
    }

    #[test]
    fn in_transaction_rolls_back_on_error() {
        let (pool, scope) = create_scope(1);

        let result: CoreResult<()> = scope.in_transaction(&[], |txn| {
            txn.execute("INSERT 1")?;
            Err(CoreError::invalid_operation("validation failed"))
        });

        assert!(result.is_err());
        assert!(only_connection(&pool).committed_statements().is_empty());
        assert!(!scope.is_transaction_active());
    }

    // === Emergency sweep ===

    #[test]
    fn close_all_transactions_releases_everything() {
        let (pool, scope) = create_scope(1);
        let lock = Arc::new(ScopeLock::new("l"));
        let outer = scope
            .ensure_transaction(&[Arc::clone(&lock) as SharedLock])
            .unwrap();
        let _inner = scope.ensure_transaction(&[]).unwrap();
        outer.execute("INSERT 1").unwrap();

        assert_eq!(scope.close_all_transactions(), 1);

        assert_eq!(lock.owner(), None);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(only_connection(&pool).rollback_count(), 1);
        assert_eq!(scope.stats().forced_closes, 1);
        assert!(matches!(
            outer.commit(),
            Err(CoreError::NoActiveTransaction { .. })
        ));
        assert!(matches!(outer.close(), Err(CoreError::CloseUnderflow { .. })));
    }

    #[test]
    fn dropped_transaction_returns_its_connection() {
        let (pool, scope) = create_scope(1);
        let txn = scope.ensure_transaction(&[]).unwrap();
        assert_eq!(scope.close_all_transactions(), 1);
        drop(txn);
        assert_eq!(pool.outstanding(), 0);
    }
}
