//! Stress tests for txscope.
//!
//! These tests verify behavior under heavy load and concurrent access.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use txscope_core::{CommitPhase, CoreError, Scope, SharedLock};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Logs a summary of the run.
    pub fn log_summary(&self, name: &str) {
        tracing::info!(
            test = name,
            total = self.total_ops,
            successful = self.successful_ops,
            failed = self.failed_ops,
            duration = ?self.duration,
            ops_per_second = self.ops_per_second,
            "stress run finished"
        );
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of transactions to run.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Nesting levels opened per transaction.
    pub nesting_depth: usize,
    /// Commit tasks queued per transaction.
    pub tasks_per_transaction: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            nesting_depth: 3,
            tasks_per_transaction: 2,
        }
    }
}

/// Opens `depth` levels, issues one statement per level and commits them
/// all innermost first.
fn nested_unit(scope: &Scope, depth: usize, locks: &[SharedLock]) -> Result<(), CoreError> {
    if depth == 0 {
        return Ok(());
    }
    scope.in_transaction(locks, |txn| {
        txn.execute("UPDATE counters SET n = n + 1")?;
        nested_unit(scope, depth - 1, &[])
    })
}

/// Run sequential nested transactions.
pub fn stress_nested_transactions(scope: &Scope, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for _ in 0..config.operations {
        match nested_unit(scope, config.nesting_depth, &[]) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run transactions that queue commit tasks, counting executions in
/// `executed`.
pub fn stress_commit_tasks(
    scope: &Scope,
    config: &StressConfig,
    executed: &Arc<AtomicUsize>,
) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for _ in 0..config.operations {
        let result = scope.in_transaction(&[], |txn| {
            for i in 0..config.tasks_per_transaction {
                let phase = if i % 2 == 0 {
                    CommitPhase::PreCommit
                } else {
                    CommitPhase::PostCommit
                };
                let executed = Arc::clone(executed);
                txn.add_commit_task(format!("task-{i}"), phase, move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })?;
            }
            Ok(())
        });

        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run concurrent transactions, all contending for `lock`.
///
/// `counter` is incremented non-atomically under the lock; after the run
/// it equals the number of successful transactions only if the lock
/// serialized them.
pub fn stress_lock_contention(
    scope: Arc<Scope>,
    lock: SharedLock,
    counter: Arc<AtomicUsize>,
    config: &StressConfig,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads;
    let depth = config.nesting_depth;

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let scope = Arc::clone(&scope);
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);

            thread::spawn(move || {
                for _ in 0..ops_per_thread {
                    let result = scope.in_transaction(&[Arc::clone(&lock)], |_| {
                        let seen = counter.load(Ordering::SeqCst);
                        nested_unit(&scope, depth.saturating_sub(1), &[])?;
                        counter.store(seen + 1, Ordering::SeqCst);
                        Ok(())
                    });

                    match result {
                        Ok(()) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run a transaction abort stress test.
///
/// Every other transaction fails in a nested level.
pub fn stress_transaction_aborts(scope: &Scope, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let should_fail = i % 2 == 0;

        let result = scope.in_transaction(&[], |txn| {
            txn.execute("INSERT INTO events VALUES (1)")?;
            scope.in_transaction(&[], |_| {
                if should_fail {
                    Err(CoreError::invalid_operation("intentional"))
                } else {
                    Ok(())
                }
            })
        });

        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}
