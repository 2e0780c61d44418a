//! Transaction state machine.

use crate::error::{CoreError, CoreResult};
use crate::identity::SessionInfo;
use crate::lock::LockSet;
use crate::scope::ScopeShared;
use crate::transaction::tasks::{CommitPhase, CommitTask, CommitTasks, TaskKey};
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use txscope_pool::{ConnectionSource, SharedConnection};

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Open; nested scopes may join, commit and close.
    Active,
    /// The outermost commit is running pre-commit tasks and the real commit.
    Committing,
    /// The connection committed and went back to its source.
    Committed,
    /// The work was discarded and the connection went back to its source.
    RolledBack,
}

impl TransactionStatus {
    fn is_finished(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

struct TransactionState {
    status: TransactionStatus,
    connection: Option<SharedConnection>,
    /// One lock set per open nesting level; the length is the depth.
    levels: Vec<LockSet>,
    aborted: bool,
    /// Closes still owed for commits that already popped their level.
    closes_to_ignore: usize,
    /// OS thread running the outermost commit, while `Committing`.
    committer: Option<ThreadId>,
    pre_commit: CommitTasks,
    post_commit: CommitTasks,
}

/// Shared state of one transaction, referenced by the registry and by every
/// [`Transaction`] handle.
pub(crate) struct TransactionInner {
    id: TransactionId,
    /// Effective thread the transaction is registered under.
    thread: ThreadId,
    session: SessionInfo,
    source: Arc<dyn ConnectionSource>,
    created_at: Instant,
    creation_trace: Option<Backtrace>,
    state: Mutex<TransactionState>,
}

impl TransactionInner {
    pub(crate) fn new(
        id: TransactionId,
        thread: ThreadId,
        connection: SharedConnection,
        session: SessionInfo,
        source: Arc<dyn ConnectionSource>,
        first_level: LockSet,
        capture_trace: bool,
    ) -> Self {
        Self {
            id,
            thread,
            session,
            source,
            created_at: Instant::now(),
            creation_trace: capture_trace.then(Backtrace::capture),
            state: Mutex::new(TransactionState {
                status: TransactionStatus::Active,
                connection: Some(connection),
                levels: vec![first_level],
                aborted: false,
                closes_to_ignore: 0,
                committer: None,
                pre_commit: CommitTasks::default(),
                post_commit: CommitTasks::default(),
            }),
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    /// Pushes a nesting level onto an open transaction.
    ///
    /// While pre-commit tasks run, only the committing thread may join.
    /// Hands the level back to anyone else, or if the transaction finished
    /// in the meantime.
    pub(crate) fn push_level(&self, level: LockSet) -> Result<usize, LockSet> {
        let mut state = self.state.lock();
        let open = match state.status {
            TransactionStatus::Active => true,
            TransactionStatus::Committing => state.committer == Some(thread::current().id()),
            TransactionStatus::Committed | TransactionStatus::RolledBack => false,
        };
        if !open {
            return Err(level);
        }
        state.levels.push(level);
        Ok(state.levels.len())
    }

    /// Releases locks and connection of a transaction that never got
    /// registered.
    pub(crate) fn abandon(&self) -> CoreResult<()> {
        let (levels, connection) = {
            let mut state = self.state.lock();
            state.status = TransactionStatus::RolledBack;
            (
                std::mem::take(&mut state.levels),
                state.connection.take(),
            )
        };
        for level in levels.into_iter().rev() {
            level.release(self.id);
        }
        connection.map_or(Ok(()), |conn| self.discard(conn))
    }

    /// Rolls the connection back and returns it to the source.
    fn discard(&self, connection: SharedConnection) -> CoreResult<()> {
        let rolled_back = connection.rollback();
        if let Err(err) = &rolled_back {
            tracing::error!(
                txn = %self.id,
                connection = connection.label(),
                error = %err,
                "rollback failed"
            );
        }
        self.source.release(connection)?;
        rolled_back.map_err(CoreError::from)
    }

    fn trace(&self) -> Option<&Backtrace> {
        self.creation_trace
            .as_ref()
            .filter(|trace| trace.status() == BacktraceStatus::Captured)
    }
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let Some(connection) = state.connection.take() else {
            return;
        };
        let levels = std::mem::take(&mut state.levels);
        tracing::error!(
            txn = %self.id,
            depth = levels.len(),
            trace = ?self.trace(),
            "transaction dropped while holding a connection, rolling back"
        );
        for level in levels.into_iter().rev() {
            level.release(self.id);
        }
        if let Err(err) = self.discard(connection) {
            tracing::error!(txn = %self.id, error = %err, "failed to return connection");
        }
    }
}

impl fmt::Debug for TransactionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionInner")
            .field("id", &self.id)
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

/// A handle to the transaction active on an effective thread.
///
/// Every `ensure_transaction` call returns a handle to the same underlying
/// transaction and adds one nesting level. Each level follows the same
/// convention on every exit path:
///
/// ```rust,ignore
/// let txn = scope.ensure_transaction(&[])?;
/// txn.execute("UPDATE ...")?;
/// txn.commit()?; // only the outermost level really commits
/// txn.close()?;  // always; after commit() it only pays back the credit
/// ```
///
/// A level that closes without committing aborts the whole transaction:
/// the connection is rolled back once the outermost level closes, and any
/// later `commit()` fails.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
    scope: Arc<ScopeShared>,
}

impl Transaction {
    pub(crate) fn from_parts(inner: Arc<TransactionInner>, scope: Arc<ScopeShared>) -> Self {
        Self { inner, scope }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Returns the name of the owning scope.
    #[must_use]
    pub fn scope_name(&self) -> &str {
        &self.scope.name
    }

    /// Returns the effective thread the transaction belongs to.
    #[must_use]
    pub fn owner_thread(&self) -> ThreadId {
        self.inner.thread
    }

    /// Returns the session metadata of the transaction's connection.
    #[must_use]
    pub fn session(&self) -> &SessionInfo {
        &self.inner.session
    }

    /// Returns the number of open nesting levels.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.state.lock().levels.len()
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    /// Checks if the transaction is still open.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// Checks if a nested scope failed and the transaction can only roll back.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().aborted
    }

    /// Checks if the transaction finished and every level has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        let state = self.inner.state.lock();
        state.status.is_finished() && state.closes_to_ignore == 0
    }

    /// How long ago the transaction was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    /// Returns the backtrace captured at creation, if one was recorded.
    #[must_use]
    pub fn creation_trace(&self) -> Option<String> {
        self.inner.trace().map(ToString::to_string)
    }

    /// Returns the number of tasks waiting for the given phase.
    #[must_use]
    pub fn pending_tasks(&self, phase: CommitPhase) -> usize {
        let state = self.inner.state.lock();
        match phase {
            CommitPhase::PreCommit => state.pre_commit.len(),
            CommitPhase::PostCommit => state.post_commit.len(),
        }
    }

    /// Returns the transaction's connection for issuing statements.
    ///
    /// The connection stays owned by the transaction: callers must never
    /// commit, roll back or release it themselves.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveTransaction` once the connection has been committed
    /// or rolled back.
    pub fn connection(&self) -> CoreResult<SharedConnection> {
        self.inner
            .state
            .lock()
            .connection
            .clone()
            .ok_or(CoreError::NoActiveTransaction {
                operation: "connection",
            })
    }

    /// Issues a statement on the transaction's connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has no connection or the driver
    /// rejects the statement.
    pub fn execute(&self, statement: &str) -> CoreResult<()> {
        self.connection()?.execute(statement)?;
        Ok(())
    }

    /// Defers `action` until just before or just after the real commit.
    ///
    /// Returns false if a task with the same key is already queued for the
    /// phase. Once the transaction has committed the action runs right away.
    ///
    /// # Errors
    ///
    /// Returns `TransactionAborted` if the transaction rolled back, or the
    /// action's error if it ran immediately.
    pub fn add_commit_task<F>(
        &self,
        key: impl Into<TaskKey>,
        phase: CommitPhase,
        action: F,
    ) -> CoreResult<bool>
    where
        F: FnOnce() -> CoreResult<()> + Send + 'static,
    {
        self.add_task(CommitTask::new(key, action), phase)
    }

    /// Queues a prepared [`CommitTask`]. See [`Transaction::add_commit_task`].
    ///
    /// # Errors
    ///
    /// Same as [`Transaction::add_commit_task`].
    pub fn add_task(&self, task: CommitTask, phase: CommitPhase) -> CoreResult<bool> {
        let mut state = self.inner.state.lock();
        match state.status {
            TransactionStatus::Active | TransactionStatus::Committing => {
                let key = task.key().clone();
                let queued = match phase {
                    CommitPhase::PreCommit => state.pre_commit.push(task),
                    CommitPhase::PostCommit => state.post_commit.push(task),
                };
                if !queued {
                    tracing::trace!(txn = %self.id(), task = %key, "duplicate commit task ignored");
                }
                Ok(queued)
            }
            TransactionStatus::Committed => {
                drop(state);
                self.scope.stats.record_commit_task();
                task.run()?;
                Ok(true)
            }
            TransactionStatus::RolledBack => Err(CoreError::transaction_aborted(
                self.id(),
                "cannot add commit tasks to a rolled back transaction",
            )),
        }
    }

    /// Commits the current nesting level.
    ///
    /// Nested levels only pop their level; the outermost level runs the
    /// pre-commit tasks, commits the connection, returns it to the source,
    /// unregisters the transaction and runs the post-commit tasks. Every
    /// `commit()` must be followed by exactly one `close()`.
    ///
    /// A pre-commit task running on the committing thread may open nested
    /// levels with `ensure_transaction`; they join the commit in progress.
    /// If such a level closes without committing, or is left open, the
    /// whole transaction rolls back.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The transaction already finished (`NoActiveTransaction`)
    /// - `commit()` was already called without its `close()`
    ///   (`AlreadyCommitted`, or `UnclosedNestedScope` if a nested level is
    ///   still waiting to be closed)
    /// - A nested scope closed without committing (`TransactionAborted`)
    /// - A pre-commit task, a level it opened, or the connection commit
    ///   fails; the work is rolled back
    /// - A post-commit task fails; the commit stands
    pub fn commit(&self) -> CoreResult<()> {
        let id = self.id();
        let mut state = self.inner.state.lock();

        if state.closes_to_ignore > 0 {
            let depth = state.levels.len();
            return Err(if depth == 0 {
                CoreError::AlreadyCommitted { txn: id }
            } else {
                CoreError::UnclosedNestedScope { txn: id, depth }
            });
        }
        // A level opened by a pre-commit task commits into the running commit.
        let joined_while_committing =
            state.status == TransactionStatus::Committing && !state.levels.is_empty();
        match state.status {
            TransactionStatus::Active => {}
            TransactionStatus::Committing if joined_while_committing => {}
            TransactionStatus::Committing => return Err(CoreError::AlreadyCommitted { txn: id }),
            TransactionStatus::Committed | TransactionStatus::RolledBack => {
                return Err(CoreError::NoActiveTransaction {
                    operation: "commit",
                })
            }
        }
        if state.aborted {
            return Err(CoreError::transaction_aborted(
                id,
                "a nested scope closed without committing",
            ));
        }
        let Some(level) = state.levels.pop() else {
            return Err(CoreError::NoActiveTransaction {
                operation: "commit",
            });
        };

        if !state.levels.is_empty() || joined_while_committing {
            state.closes_to_ignore += 1;
            let depth = state.levels.len();
            drop(state);
            level.release(id);
            tracing::trace!(txn = %id, depth, "nested commit, deferring to outermost scope");
            return Ok(());
        }

        state.status = TransactionStatus::Committing;
        state.committer = Some(thread::current().id());
        drop(state);

        let result = self.complete_commit(level);
        let mut state = self.inner.state.lock();
        state.committer = None;
        state.closes_to_ignore += 1;
        result
    }

    fn complete_commit(&self, level: LockSet) -> CoreResult<()> {
        let id = self.id();

        // Tasks are popped one at a time so a task may queue another one,
        // even under its own key.
        let connection = loop {
            let mut state = self.inner.state.lock();
            if state.aborted || !state.levels.is_empty() {
                let reason = if state.aborted {
                    "a scope opened by a pre-commit task closed without committing"
                } else {
                    "a scope opened by a pre-commit task was left open"
                };
                drop(state);
                if let Err(rollback_err) = self.roll_back(Some(level)) {
                    tracing::error!(
                        txn = %id,
                        error = %rollback_err,
                        "rollback after aborted pre-commit"
                    );
                }
                return Err(CoreError::transaction_aborted(id, reason));
            }
            let Some(task) = state.pre_commit.pop_front() else {
                break state.connection.take();
            };
            drop(state);

            let key = task.key().to_string();
            self.scope.stats.record_commit_task();
            if let Err(err) = task.run() {
                tracing::warn!(txn = %id, task = %key, error = %err, "pre-commit task failed");
                if let Err(rollback_err) = self.roll_back(Some(level)) {
                    tracing::error!(txn = %id, error = %rollback_err, "rollback after failed task");
                }
                return Err(CoreError::CommitTaskFailed {
                    key,
                    phase: CommitPhase::PreCommit,
                    source: Box::new(err),
                });
            }
        };

        let Some(connection) = connection else {
            level.release(id);
            return Err(CoreError::transaction_aborted(
                id,
                "connection was closed while committing",
            ));
        };

        if let Err(err) = connection.commit() {
            tracing::error!(txn = %id, error = %err, "commit failed, rolling back");
            {
                let mut state = self.inner.state.lock();
                state.status = TransactionStatus::RolledBack;
                state.aborted = true;
                state.post_commit.clear();
            }
            if let Err(discard_err) = self.inner.discard(connection) {
                tracing::error!(txn = %id, error = %discard_err, "failed to return connection");
            }
            level.release(id);
            self.deregister();
            self.scope.stats.record_transaction_abort();
            return Err(err.into());
        }

        let released = self.inner.source.release(connection);
        self.inner.state.lock().status = TransactionStatus::Committed;
        level.release(id);
        self.deregister();
        self.scope.stats.record_transaction_commit();
        tracing::debug!(txn = %id, scope = %self.scope.name, "committed");

        let mut first_error = released.err().map(CoreError::from);
        loop {
            let task = self.inner.state.lock().post_commit.pop_front();
            let Some(task) = task else { break };

            let key = task.key().to_string();
            self.scope.stats.record_commit_task();
            if let Err(err) = task.run() {
                tracing::warn!(txn = %id, task = %key, error = %err, "post-commit task failed");
                first_error.get_or_insert(CoreError::CommitTaskFailed {
                    key,
                    phase: CommitPhase::PostCommit,
                    source: Box::new(err),
                });
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Closes the current nesting level.
    ///
    /// After `commit()` this only consumes the credit `commit()` left
    /// behind. Without a preceding `commit()` the level's locks are
    /// released and the whole transaction is marked aborted; when the
    /// outermost level closes, the connection is rolled back and returned.
    ///
    /// # Errors
    ///
    /// Returns `CloseUnderflow` if every level has already been closed, or
    /// an error from rolling back the connection.
    pub fn close(&self) -> CoreResult<()> {
        let id = self.id();
        let mut state = self.inner.state.lock();

        if state.closes_to_ignore > 0 {
            state.closes_to_ignore -= 1;
            return Ok(());
        }
        let joined_while_committing =
            state.status == TransactionStatus::Committing && !state.levels.is_empty();
        if state.status != TransactionStatus::Active && !joined_while_committing {
            return Err(CoreError::CloseUnderflow { txn: id });
        }
        let Some(level) = state.levels.pop() else {
            return Err(CoreError::CloseUnderflow { txn: id });
        };

        let newly_aborted = !state.aborted;
        state.aborted = true;
        let depth = state.levels.len();
        drop(state);

        if newly_aborted {
            tracing::warn!(txn = %id, depth, "scope closed without commit, transaction aborted");
        }
        if depth > 0 || joined_while_committing {
            level.release(id);
            return Ok(());
        }
        self.roll_back(Some(level))
    }

    /// Rolls back, unregisters and returns the connection.
    fn roll_back(&self, level: Option<LockSet>) -> CoreResult<()> {
        let id = self.id();
        let (connection, leftover, dropped) = {
            let mut state = self.inner.state.lock();
            state.status = TransactionStatus::RolledBack;
            state.aborted = true;
            let dropped = state.pre_commit.clear() + state.post_commit.clear();
            (
                state.connection.take(),
                std::mem::take(&mut state.levels),
                dropped,
            )
        };

        for nested in leftover.into_iter().rev() {
            nested.release(id);
        }
        if let Some(level) = level {
            level.release(id);
        }
        self.deregister();
        self.scope.stats.record_transaction_abort();
        tracing::warn!(txn = %id, scope = %self.scope.name, dropped_tasks = dropped, "rolled back");

        connection.map_or(Ok(()), |conn| self.inner.discard(conn))
    }

    /// Tears the transaction down without committing, whatever its depth.
    pub(crate) fn force_close(&self) -> CoreResult<()> {
        let id = self.id();
        let (levels, connection) = {
            let mut state = self.inner.state.lock();
            if state.status.is_finished() && state.connection.is_none() {
                return Ok(());
            }
            state.status = TransactionStatus::RolledBack;
            state.aborted = true;
            state.closes_to_ignore = 0;
            state.pre_commit.clear();
            state.post_commit.clear();
            (
                std::mem::take(&mut state.levels),
                state.connection.take(),
            )
        };

        tracing::error!(
            txn = %id,
            scope = %self.scope.name,
            depth = levels.len(),
            age = ?self.age(),
            trace = ?self.inner.trace(),
            "forcibly closing transaction"
        );
        for level in levels.into_iter().rev() {
            level.release(id);
        }
        self.deregister();
        self.scope.stats.record_forced_close();
        self.scope.stats.record_transaction_abort();

        connection.map_or(Ok(()), |conn| self.inner.discard(conn))
    }

    fn deregister(&self) {
        self.scope.registry.remove(self.inner.thread, self.id());
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("scope", &self.scope.name)
            .field("status", &state.status)
            .field("depth", &state.levels.len())
            .field("aborted", &state.aborted)
            .finish_non_exhaustive()
    }
}
