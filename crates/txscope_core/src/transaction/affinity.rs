//! Thread affinity: letting one thread stand in for another.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::thread::{self, ThreadId};

/// Redirects "current thread" lookups from a borrower thread to a donor.
///
/// A request thread that hands work to a background worker calls
/// `share(worker, donor)`; until `stop_sharing(worker)` the worker resolves
/// to the donor and therefore sees the donor's transaction. Entries are
/// only created and removed explicitly.
#[derive(Debug, Default)]
pub struct ThreadAffinityTable {
    redirects: RwLock<HashMap<ThreadId, ThreadId>>,
}

impl ThreadAffinityTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `thread` to the thread whose transactions it observes.
    #[must_use]
    pub fn effective_thread(&self, thread: ThreadId) -> ThreadId {
        self.redirects.read().get(&thread).copied().unwrap_or(thread)
    }

    /// Resolves the calling thread.
    #[must_use]
    pub fn current(&self) -> ThreadId {
        self.effective_thread(thread::current().id())
    }

    /// Makes `borrower` observe `donor`'s transactions.
    ///
    /// Redirects always point at a thread that is not itself a borrower: if
    /// the donor is borrowing, `borrower` is pointed at the donor's donor,
    /// and threads already borrowing from `borrower` are repointed at the
    /// new donor.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySharing` if `borrower` already has a redirect, and
    /// `InvalidOperation` if it would redirect to itself.
    pub fn share(&self, borrower: ThreadId, donor: ThreadId) -> CoreResult<()> {
        let mut redirects = self.redirects.write();
        if redirects.contains_key(&borrower) {
            return Err(CoreError::AlreadySharing { thread: borrower });
        }
        let donor = redirects.get(&donor).copied().unwrap_or(donor);
        if donor == borrower {
            return Err(CoreError::invalid_operation(
                "a thread cannot share its own connections with itself",
            ));
        }
        for target in redirects.values_mut() {
            if *target == borrower {
                *target = donor;
            }
        }
        redirects.insert(borrower, donor);
        tracing::debug!(?borrower, ?donor, "sharing connections");
        Ok(())
    }

    /// Removes the redirect for `borrower` and returns its donor.
    ///
    /// # Errors
    ///
    /// Returns `NotSharing` if `borrower` has no redirect.
    pub fn stop_sharing(&self, borrower: ThreadId) -> CoreResult<ThreadId> {
        let donor = self
            .redirects
            .write()
            .remove(&borrower)
            .ok_or(CoreError::NotSharing { thread: borrower })?;
        tracing::debug!(?borrower, ?donor, "stopped sharing connections");
        Ok(donor)
    }

    /// Returns true if `thread` currently borrows another thread's identity.
    #[must_use]
    pub fn is_sharing(&self, thread: ThreadId) -> bool {
        self.redirects.read().contains_key(&thread)
    }

    /// Number of active redirects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.redirects.read().len()
    }

    /// Returns true if no thread is sharing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
