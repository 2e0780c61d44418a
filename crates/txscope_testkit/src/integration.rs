//! Cross-crate integration test helpers.
//!
//! Provides utilities for testing the transaction manager against the
//! in-memory pool, including a reference model of the commit/close
//! protocol.

use crate::fixtures::TestScope;
use crate::generators::ScopeOp;
use txscope_core::{Scope, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelStatus {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct ModelTxn {
    depth: usize,
    closes_to_ignore: usize,
    status: ModelStatus,
    aborted: bool,
}

#[derive(Debug, Default)]
struct Model {
    current: Option<ModelTxn>,
    commits: u64,
    rollbacks: u64,
}

impl Model {
    fn is_active(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|t| t.status == ModelStatus::Active)
    }

    fn open(&mut self) {
        match &mut self.current {
            Some(txn) if txn.status == ModelStatus::Active => txn.depth += 1,
            _ => {
                self.current = Some(ModelTxn {
                    depth: 1,
                    closes_to_ignore: 0,
                    status: ModelStatus::Active,
                    aborted: false,
                });
            }
        }
    }

    fn commit(&mut self) -> bool {
        let Some(txn) = &mut self.current else {
            return false;
        };
        if txn.closes_to_ignore > 0 || txn.status != ModelStatus::Active || txn.aborted {
            return false;
        }
        txn.depth -= 1;
        txn.closes_to_ignore += 1;
        if txn.depth == 0 {
            txn.status = ModelStatus::Committed;
            self.commits += 1;
        }
        true
    }

    fn close(&mut self) -> bool {
        let Some(txn) = &mut self.current else {
            return false;
        };
        if txn.closes_to_ignore > 0 {
            txn.closes_to_ignore -= 1;
            return true;
        }
        if txn.status != ModelStatus::Active {
            return false;
        }
        txn.depth -= 1;
        txn.aborted = true;
        if txn.depth == 0 {
            txn.status = ModelStatus::RolledBack;
            self.rollbacks += 1;
        }
        true
    }
}

/// A test harness that drives a scope and a reference model side by side.
///
/// Every operation is applied to both and the outcomes are compared.
pub struct ScopeHarness {
    /// The scope under test.
    pub ts: TestScope,
    handle: Option<Transaction>,
    model: Model,
}

impl ScopeHarness {
    /// Creates a harness over a one-connection pool.
    pub fn new() -> Self {
        Self {
            ts: TestScope::new(1),
            handle: None,
            model: Model::default(),
        }
    }

    /// Applies one operation and checks it against the model.
    ///
    /// # Panics
    ///
    /// Panics if the scope and the model disagree.
    pub fn apply(&mut self, op: ScopeOp) {
        match op {
            ScopeOp::Open => {
                let txn = self
                    .ts
                    .ensure_transaction(&[])
                    .expect("Failed to open level");
                self.model.open();
                self.handle = Some(txn);
            }
            ScopeOp::Commit => {
                let expected = self.model.commit();
                if let Some(txn) = &self.handle {
                    let actual = txn.commit();
                    assert_eq!(actual.is_ok(), expected, "commit returned {actual:?}");
                }
            }
            ScopeOp::Close => {
                let expected = self.model.close();
                if let Some(txn) = &self.handle {
                    let actual = txn.close();
                    assert_eq!(actual.is_ok(), expected, "close returned {actual:?}");
                }
            }
        }
        self.verify();
    }

    /// Applies a sequence of operations.
    pub fn apply_all(&mut self, ops: &[ScopeOp]) {
        for &op in ops {
            self.apply(op);
        }
    }

    /// Verifies that commits, rollbacks and depth match the model.
    ///
    /// # Panics
    ///
    /// Panics on any mismatch.
    pub fn verify(&self) {
        assert_eq!(self.ts.total_commits(), self.model.commits, "commit count");
        assert_eq!(self.ts.total_rollbacks(), self.model.rollbacks, "rollback count");
        assert_eq!(self.ts.is_transaction_active(), self.model.is_active());
        if let (Some(txn), Some(model)) = (&self.handle, &self.model.current) {
            assert_eq!(txn.depth(), model.depth, "nesting depth");
        }
        if !self.model.is_active() {
            assert_eq!(self.ts.pool.outstanding(), 0, "connection leaked");
        }
    }

    /// Sweeps whatever is still open and checks nothing leaked.
    ///
    /// # Panics
    ///
    /// Panics if the sweep closes an unexpected number of transactions.
    pub fn finish(self) {
        let expected = usize::from(self.model.is_active());
        assert_eq!(self.ts.close_all_transactions(), expected);
        assert_eq!(
            self.ts.total_rollbacks(),
            self.model.rollbacks + expected as u64
        );
        self.ts.assert_quiescent();
    }
}

impl Default for ScopeHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Helpers for running work on a thread that shares a transaction.
pub mod shared_worker {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    /// Runs `f` on a new thread that sees the calling thread's transactions.
    ///
    /// Sharing is set up before `f` starts and torn down after it returns.
    ///
    /// # Panics
    ///
    /// Panics if the worker panics or sharing cannot be set up.
    pub fn run_shared<T, F>(scope: &Scope, f: F) -> T
    where
        F: FnOnce(&Scope) -> T + Send,
        T: Send,
    {
        thread::scope(|s| {
            let (go_tx, go_rx) = mpsc::channel::<()>();
            let worker = s.spawn(move || {
                go_rx.recv().expect("Sharing was never set up");
                f(scope)
            });

            let borrower = worker.thread().id();
            scope
                .share_connections(borrower)
                .expect("Failed to share connections");
            go_tx.send(()).expect("Worker exited early");
            let result = worker.join().expect("Worker panicked");
            scope
                .stop_sharing_connections(borrower)
                .expect("Failed to stop sharing");
            result
        })
    }
}
