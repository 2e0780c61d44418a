//! Deferred commit tasks.

use crate::error::CoreResult;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ANONYMOUS_TASK: AtomicU64 = AtomicU64::new(1);

/// When a commit task runs relative to the real commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitPhase {
    /// Immediately before the connection commits. Sees uncommitted state
    /// and may still write through the transaction's connection.
    PreCommit,
    /// Immediately after the connection committed and was returned.
    PostCommit,
}

/// Identity of a commit task.
///
/// Tasks with equal keys registered on one transaction run once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// A caller-chosen key; registering the same key twice deduplicates.
    Named(String),
    /// A unique key that never collides with another task.
    Anonymous(u64),
}

impl TaskKey {
    /// Creates a fresh key that equals no other key.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::Anonymous(NEXT_ANONYMOUS_TASK.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<&str> for TaskKey {
    fn from(key: &str) -> Self {
        Self::Named(key.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(key: String) -> Self {
        Self::Named(key)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(key) => f.write_str(key),
            Self::Anonymous(id) => write!(f, "anonymous#{id}"),
        }
    }
}

type TaskFn = Box<dyn FnOnce() -> CoreResult<()> + Send>;

/// A deferred action and its identity.
pub struct CommitTask {
    key: TaskKey,
    action: TaskFn,
}

impl CommitTask {
    /// Creates a task with the given key.
    pub fn new<F>(key: impl Into<TaskKey>, action: F) -> Self
    where
        F: FnOnce() -> CoreResult<()> + Send + 'static,
    {
        Self {
            key: key.into(),
            action: Box::new(action),
        }
    }

    /// Creates a task that is never deduplicated.
    pub fn anonymous<F>(action: F) -> Self
    where
        F: FnOnce() -> CoreResult<()> + Send + 'static,
    {
        Self::new(TaskKey::anonymous(), action)
    }

    /// Returns the task's key.
    #[must_use]
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Runs the task, consuming it.
    ///
    /// # Errors
    ///
    /// Returns the action's error.
    pub fn run(self) -> CoreResult<()> {
        (self.action)()
    }
}

impl fmt::Debug for CommitTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitTask")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Insertion-ordered, key-deduplicated task queue.
#[derive(Debug, Default)]
pub(crate) struct CommitTasks {
    queue: VecDeque<CommitTask>,
    keys: HashSet<TaskKey>,
}

impl CommitTasks {
    /// Queues the task unless one with the same key is already waiting.
    ///
    /// Returns false if the task was a duplicate and has been dropped.
    pub(crate) fn push(&mut self, task: CommitTask) -> bool {
        if !self.keys.insert(task.key.clone()) {
            return false;
        }
        self.queue.push_back(task);
        true
    }

    /// Removes the oldest task. Its key may be queued again right away.
    pub(crate) fn pop_front(&mut self) -> Option<CommitTask> {
        let task = self.queue.pop_front()?;
        self.keys.remove(&task.key);
        Some(task)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Drops every queued task without running it.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.keys.clear();
        dropped
    }
}
