//! Core Task type: a timeout-bounded, cancelable unit of work.
//!
//! # Invariants
//! - `timeout` is fixed at construction and never changes during `invoke()`
//! - a subtask is recorded before it is invoked, so termination always sees it
//! - `invoke()` ends in exactly one of succeeded, failed or timed out

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_recursion::async_recursion;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument::WithSubscriber;
use tracing::{debug, info};
use uuid::Uuid;

use super::subtask::{Subtasks, TaskContext};
use super::{FailurePolicy, TaskError};
use crate::util::lock;

/// Budget applied to a task unless the constructor says otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Unique identifier for a task.
///
/// # Properties
/// - Globally unique within an execution context
/// - Immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The actual work behind a [`Task`].
///
/// Implementors only supply `run`; timeout enforcement, subtask bookkeeping and
/// termination fan-out live in [`Task`].
#[async_trait]
pub trait Work: Send + Sync + 'static {
    /// Perform the unit of work. Subtasks go through `ctx.execute_subtask`.
    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError>;

    /// Cancellation hook, run after every recorded subtask was terminated.
    ///
    /// Must be safe to call before `run` started and after it finished.
    async fn terminate(&self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Short human-readable label used in logs and failures.
    fn label(&self) -> String {
        short_type_name::<Self>()
    }
}

/// `my_crate::provision::VagrantUp` -> `VagrantUp`
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_string()
}

/// A schedulable unit of work with a timeout and a subtask tree.
///
/// Owned by whoever invokes it; subtasks are owned by their parent for the
/// duration of the parent's invocation.
pub struct Task {
    id: TaskId,
    label: String,
    work: Arc<dyn Work>,
    timeout: Option<Duration>,
    policy: FailurePolicy,
    subtasks: Subtasks,
    last_failure: Mutex<Option<TaskError>>,
}

impl Task {
    /// Wrap `work` with the default timeout and the propagate policy.
    pub fn new(work: impl Work) -> Self {
        Self::from_shared(Arc::new(work))
    }

    /// Like [`Task::new`] but keeps the caller's handle on the work, e.g. to
    /// read a process exit code afterwards.
    pub fn from_shared(work: Arc<dyn Work>) -> Self {
        Self {
            id: TaskId::new(),
            label: work.label(),
            work,
            timeout: Some(DEFAULT_TIMEOUT),
            policy: FailurePolicy::default(),
            subtasks: Subtasks::default(),
            last_failure: Mutex::new(None),
        }
    }

    /// Set the timeout; `None` means unbounded.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn unbounded(self) -> Self {
        self.with_timeout(None)
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Failures are logged as warnings and never reach the caller.
    pub fn best_effort(self) -> Self {
        self.with_policy(FailurePolicy::BestEffort)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Subtasks invoked so far, in invocation order.
    pub fn subtasks(&self) -> Vec<Arc<Task>> {
        self.subtasks.snapshot()
    }

    /// The failure captured by the last invocation, even if the policy
    /// swallowed it.
    pub fn last_failure(&self) -> Option<TaskError> {
        lock(&self.last_failure).clone()
    }

    /// Run the work in its own execution context, bounded by the timeout.
    ///
    /// On timeout every recorded subtask and then the work itself are
    /// terminated, the execution context is awaited to its end, and the
    /// result is a [`TaskError::Timeout`] whatever the work returned.
    pub async fn invoke(&self) -> Result<(), TaskError> {
        let outcome = self.run_bounded().await;
        if let Err(err) = &outcome {
            *lock(&self.last_failure) = Some(err.clone());
        }
        self.policy.apply(outcome)
    }

    async fn run_bounded(&self) -> Result<(), TaskError> {
        info!(task_id = %self.id, "Executing: {}", self.label);

        let work = Arc::clone(&self.work);
        let ctx = TaskContext::new(self.id, self.subtasks.clone());
        let mut handle = tokio::spawn(
            async move { work.run(&ctx).await }.with_current_subscriber(),
        );

        let joined = match self.timeout {
            None => (&mut handle).await,
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!(task_id = %self.id, "{} exceeded {:?}, terminating", self.label, limit);
                    let terminated = self.terminate().await;
                    // Outcome of the work is superseded by the timeout.
                    let _ = handle.await;
                    terminated?;
                    return Err(TaskError::timeout(self.label.clone(), limit));
                }
            },
        };

        joined.unwrap_or_else(|join_err| {
            Err(TaskError::failed_with(
                self.label.clone(),
                format!("execution context ended abnormally: {}", join_err),
            ))
        })
    }

    /// Terminate every recorded subtask (depth first), then run the work's
    /// own cancellation hook.
    ///
    /// Safe on a task that never started or already finished.
    #[async_recursion]
    pub async fn terminate(&self) -> Result<(), TaskError> {
        for subtask in self.subtasks.snapshot() {
            subtask.terminate().await?;
        }
        self.work.terminate().await
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .finish()
    }
}
