//! Effective-thread to transaction registry.

use crate::transaction::state::TransactionInner;
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

/// Maps each effective thread to its single active transaction.
///
/// One mutex guards every lookup, insert and removal, so a transaction
/// being created or torn down on its owner thread is never half-visible to
/// a borrower thread that resolves to the same owner.
#[derive(Debug, Default)]
pub(crate) struct TransactionRegistry {
    active: Mutex<HashMap<ThreadId, Arc<TransactionInner>>>,
}

impl TransactionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the transaction registered for `thread`.
    pub(crate) fn get(&self, thread: ThreadId) -> Option<Arc<TransactionInner>> {
        self.active.lock().get(&thread).cloned()
    }

    /// Registers `txn` for `thread` unless another transaction got there
    /// first, in which case that transaction is returned.
    pub(crate) fn insert_if_absent(
        &self,
        thread: ThreadId,
        txn: Arc<TransactionInner>,
    ) -> Result<(), Arc<TransactionInner>> {
        let mut active = self.active.lock();
        if let Some(existing) = active.get(&thread) {
            return Err(Arc::clone(existing));
        }
        active.insert(thread, txn);
        Ok(())
    }

    /// Removes the registration for `thread` if it still belongs to `id`.
    pub(crate) fn remove(&self, thread: ThreadId, id: TransactionId) -> bool {
        let mut active = self.active.lock();
        if active.get(&thread).is_some_and(|txn| txn.id() == id) {
            active.remove(&thread);
            true
        } else {
            false
        }
    }

    /// Removes and returns every registered transaction.
    pub(crate) fn drain(&self) -> Vec<Arc<TransactionInner>> {
        self.active.lock().drain().map(|(_, txn)| txn).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.active.lock().len()
    }
}
