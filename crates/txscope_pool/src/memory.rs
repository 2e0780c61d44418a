//! In-memory connection source for testing.

use crate::error::{PoolError, PoolResult};
use crate::source::{connection_addr, ConnectionSource, RawConnection, SharedConnection};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct ConnectionState {
    in_transaction: bool,
    pending: Vec<String>,
    committed: Vec<String>,
    commits: u64,
    rollbacks: u64,
    fail_next_commit: bool,
}

/// An in-memory connection that records every statement it receives.
///
/// Statements issued inside a unit of work stay pending until `commit`;
/// `rollback` discards them. Statements issued in auto-commit mode are
/// committed immediately.
///
/// Equality compares labels only. Two connections with the same label are
/// `==` but remain distinct connections, which is exactly what an identity
/// keyed cache has to cope with.
#[derive(Debug)]
pub struct MemoryConnection {
    label: String,
    state: Mutex<ConnectionState>,
}

impl MemoryConnection {
    /// Creates a new connection with the given label.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(ConnectionState::default()),
        }
    }

    /// Returns all statements that have been committed.
    #[must_use]
    pub fn committed_statements(&self) -> Vec<String> {
        self.state.lock().committed.clone()
    }

    /// Returns statements issued in the current, uncommitted unit of work.
    #[must_use]
    pub fn pending_statements(&self) -> Vec<String> {
        self.state.lock().pending.clone()
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    /// Number of rollbacks.
    #[must_use]
    pub fn rollback_count(&self) -> u64 {
        self.state.lock().rollbacks
    }

    /// Whether a unit of work is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.state.lock().in_transaction
    }

    /// Makes the next `commit` fail with a driver error.
    ///
    /// The pending work is discarded, as a real driver would after a failed
    /// commit.
    pub fn fail_next_commit(&self) {
        self.state.lock().fail_next_commit = true;
    }
}

impl PartialEq for MemoryConnection {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
    }
}

impl RawConnection for MemoryConnection {
    fn label(&self) -> &str {
        &self.label
    }

    fn begin(&self) -> PoolResult<()> {
        let mut state = self.state.lock();
        if state.in_transaction {
            return Err(PoolError::driver(format!(
                "connection '{}' is already in a transaction",
                self.label
            )));
        }
        state.in_transaction = true;
        Ok(())
    }

    fn execute(&self, statement: &str) -> PoolResult<()> {
        let mut state = self.state.lock();
        if state.in_transaction {
            state.pending.push(statement.to_string());
        } else {
            state.committed.push(statement.to_string());
        }
        Ok(())
    }

    fn commit(&self) -> PoolResult<()> {
        let mut state = self.state.lock();
        if !state.in_transaction {
            return Err(PoolError::driver(format!(
                "connection '{}' has no transaction to commit",
                self.label
            )));
        }
        state.in_transaction = false;
        if std::mem::take(&mut state.fail_next_commit) {
            state.pending.clear();
            return Err(PoolError::driver(format!(
                "commit failed on connection '{}'",
                self.label
            )));
        }
        let pending = std::mem::take(&mut state.pending);
        state.committed.extend(pending);
        state.commits += 1;
        Ok(())
    }

    fn rollback(&self) -> PoolResult<()> {
        let mut state = self.state.lock();
        state.pending.clear();
        state.in_transaction = false;
        state.rollbacks += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Every physical connection the pool currently owns.
    all: Vec<Arc<MemoryConnection>>,
    /// Connections ready to be handed out.
    idle: Vec<Arc<MemoryConnection>>,
    outstanding: usize,
    opened: u64,
    acquired: u64,
    released: u64,
    fail_next_acquire: bool,
    closed: bool,
}

/// A bounded, in-memory connection pool.
///
/// This source is suitable for:
/// - Unit and integration tests of transaction behavior
/// - Exercising pool exhaustion and connection recycling
///
/// Released connections are recycled: the next `acquire` returns the same
/// allocation again, so identity-keyed caches see a hit.
///
/// # Example
///
/// ```rust
/// use txscope_pool::{ConnectionSource, MemorySource};
///
/// let pool = MemorySource::new("test", 2);
/// let conn = pool.acquire().unwrap();
/// conn.execute("SELECT 1").unwrap();
/// pool.release(conn).unwrap();
/// assert_eq!(pool.outstanding(), 0);
/// ```
#[derive(Debug)]
pub struct MemorySource {
    name: String,
    capacity: usize,
    acquire_timeout: Duration,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl MemorySource {
    /// Default time `acquire` waits for a free connection.
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a pool that opens at most `capacity` connections.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    /// Sets how long `acquire` waits before reporting exhaustion.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Returns the pool's maximum number of physical connections.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of connections currently borrowed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Number of physical connections opened over the pool's lifetime.
    #[must_use]
    pub fn opened_count(&self) -> u64 {
        self.state.lock().opened
    }

    /// Total successful acquisitions.
    #[must_use]
    pub fn acquired_count(&self) -> u64 {
        self.state.lock().acquired
    }

    /// Total releases.
    #[must_use]
    pub fn released_count(&self) -> u64 {
        self.state.lock().released
    }

    /// Returns handles to every physical connection the pool owns.
    ///
    /// Useful for inspecting statements and commit counts in tests.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        self.state.lock().all.clone()
    }

    /// Makes the next `acquire` fail with a driver error.
    pub fn fail_next_acquire(&self) {
        self.state.lock().fail_next_acquire = true;
    }

    /// Closes every idle connection for good.
    ///
    /// Borrowed connections are unaffected. Returns the number of
    /// connections retired.
    pub fn retire_idle(&self) -> usize {
        let mut state = self.state.lock();
        let idle = std::mem::take(&mut state.idle);
        state
            .all
            .retain(|conn| !idle.iter().any(|retired| Arc::ptr_eq(conn, retired)));
        tracing::debug!(pool = %self.name, retired = idle.len(), "retired idle connections");
        idle.len()
    }

    /// Shuts the pool down. Waiting and future `acquire` calls fail.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.idle.clear();
        self.available.notify_all();
    }
}

impl ConnectionSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&self) -> PoolResult<SharedConnection> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if std::mem::take(&mut state.fail_next_acquire) {
                return Err(PoolError::driver(format!(
                    "failed to open connection to '{}'",
                    self.name
                )));
            }

            if let Some(conn) = state.idle.pop() {
                state.outstanding += 1;
                state.acquired += 1;
                return Ok(conn);
            }

            if state.all.len() < self.capacity {
                state.opened += 1;
                let conn = Arc::new(MemoryConnection::new(format!(
                    "{}-{}",
                    self.name, state.opened
                )));
                state.all.push(Arc::clone(&conn));
                state.outstanding += 1;
                state.acquired += 1;
                return Ok(conn);
            }

            if self
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(PoolError::Exhausted {
                    timeout: self.acquire_timeout,
                });
            }
        }
    }

    fn release(&self, connection: SharedConnection) -> PoolResult<()> {
        let addr = connection_addr(&connection);
        let mut state = self.state.lock();

        let owned = state
            .all
            .iter()
            .find(|conn| Arc::as_ptr(conn) as *const () as usize == addr)
            .cloned();
        let Some(conn) = owned else {
            return Err(PoolError::ForeignConnection {
                label: connection.label().to_string(),
            });
        };

        if conn.in_transaction() {
            tracing::warn!(
                connection = conn.label(),
                "connection returned with an open transaction, rolling back"
            );
            conn.rollback()?;
        }

        state.outstanding = state.outstanding.saturating_sub(1);
        state.released += 1;
        if !state.closed {
            state.idle.push(conn);
        }
        self.available.notify_one();
        Ok(())
    }
}
