//! Subtask bookkeeping.
//!
//! A parent records every subtask before invoking it. The record is what
//! termination walks, so a subtask that is only half started is still
//! reachable when the parent's timeout fires.

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{Task, TaskError, TaskId};
use crate::util::lock;

/// Ordered list of subtasks a task has invoked so far.
///
/// Shared between the invoking side (which terminates) and the execution
/// context running the work (which appends).
#[derive(Clone, Default)]
pub(crate) struct Subtasks(Arc<Mutex<Vec<Arc<Task>>>>);

impl Subtasks {
    fn record(&self, task: Arc<Task>) {
        lock(&self.0).push(task);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Task>> {
        lock(&self.0).clone()
    }
}

/// Handle passed to [`super::Work::run`]: the parent's view of its own
/// subtask tree.
#[derive(Clone)]
pub struct TaskContext {
    parent: TaskId,
    subtasks: Subtasks,
}

impl TaskContext {
    pub(crate) fn new(parent: TaskId, subtasks: Subtasks) -> Self {
        Self { parent, subtasks }
    }

    /// A context not attached to any running task, for driving workflows
    /// from top-level code.
    pub fn root() -> Self {
        Self::new(TaskId::new(), Subtasks::default())
    }

    /// Record `task` as a subtask, then invoke it.
    ///
    /// The child's outcome, after its own failure policy, is returned
    /// unchanged.
    pub async fn execute_subtask(&self, task: Task) -> Result<(), TaskError> {
        let task = Arc::new(task);
        self.subtasks.record(Arc::clone(&task));
        debug!(parent = %self.parent, subtask = %task.id(), "Recorded subtask {}", task);
        task.invoke().await
    }

    pub fn subtask_labels(&self) -> Vec<String> {
        self.subtasks
            .snapshot()
            .iter()
            .map(|task| task.label().to_string())
            .collect()
    }
}
