//! Caller-supplied locks held for the duration of a nesting level.
//!
//! Locks are owned by a *transaction*, not by a thread. A worker thread that
//! shares another thread's transaction may release what the donor acquired.
//!
//! Locks are always taken **after** the transaction's connection. With a
//! fixed global order (connection, then locks) a thread holding a lock can
//! never wait on the pool while the pool's last connection waits on that
//! lock.

use crate::types::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// An in-process lock that a transaction holds for one nesting level.
pub trait TransactionLock: Send + Sync + fmt::Debug {
    /// Name used in log output.
    fn name(&self) -> &str;

    /// Blocks until `owner` holds the lock.
    ///
    /// Acquiring a lock the owner already holds must not block.
    fn acquire(&self, owner: TransactionId);

    /// Releases one hold of `owner` on the lock.
    fn release(&self, owner: TransactionId);
}

/// A shared handle to a transaction lock.
pub type SharedLock = Arc<dyn TransactionLock>;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<TransactionId>,
    holds: usize,
}

/// A lock that is reentrant per transaction.
///
/// Nested levels of one transaction may take the same lock again; other
/// transactions block until every hold has been released.
#[derive(Debug)]
pub struct ScopeLock {
    name: String,
    state: Mutex<LockState>,
    released: Condvar,
}

impl ScopeLock {
    /// Creates an unheld lock.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Creates an unheld lock behind a [`SharedLock`] handle.
    #[must_use]
    pub fn shared(name: impl Into<String>) -> SharedLock {
        Arc::new(Self::new(name))
    }

    /// Returns the transaction currently holding the lock.
    #[must_use]
    pub fn owner(&self) -> Option<TransactionId> {
        self.state.lock().owner
    }

    /// Returns how many times the owner holds the lock.
    #[must_use]
    pub fn hold_count(&self) -> usize {
        self.state.lock().holds
    }

    /// Acquires the lock if it is free or already held by `owner`.
    pub fn try_acquire(&self, owner: TransactionId) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(owner);
                state.holds = 1;
                true
            }
            Some(current) if current == owner => {
                state.holds += 1;
                true
            }
            Some(_) => false,
        }
    }
}

impl TransactionLock for ScopeLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&self, owner: TransactionId) {
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(owner);
                    state.holds = 1;
                    return;
                }
                Some(current) if current == owner => {
                    state.holds += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    fn release(&self, owner: TransactionId) {
        let mut state = self.state.lock();
        if state.owner != Some(owner) {
            tracing::error!(
                lock = %self.name,
                %owner,
                holder = ?state.owner,
                "release of a lock the transaction does not hold"
            );
            return;
        }
        state.holds -= 1;
        if state.holds == 0 {
            state.owner = None;
            self.released.notify_all();
        }
    }
}

/// The locks taken by one nesting level of a transaction.
#[derive(Debug, Default)]
pub(crate) struct LockSet {
    locks: Vec<SharedLock>,
}

impl LockSet {
    /// Acquires `locks` in order on behalf of `owner`.
    pub(crate) fn acquire(owner: TransactionId, locks: &[SharedLock]) -> Self {
        for lock in locks {
            tracing::trace!(lock = lock.name(), %owner, "acquiring lock");
            lock.acquire(owner);
        }
        Self {
            locks: locks.to_vec(),
        }
    }

    /// Releases every lock in reverse acquisition order.
    pub(crate) fn release(self, owner: TransactionId) {
        for lock in self.locks.iter().rev() {
            tracing::trace!(lock = lock.name(), %owner, "releasing lock");
            lock.release(owner);
        }
    }
}
