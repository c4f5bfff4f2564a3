//! Failure taxonomy for task execution.
//!
//! Every failure names the task that produced it (its display label) so the
//! final propagated error is enough to tell which step of a run went wrong.

use std::time::Duration;

/// Message used when a task fails without saying why.
pub const DEFAULT_FAILURE_MESSAGE: &str = "execution failed";

/// Errors that can occur while invoking a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Any failure raised by the work itself.
    #[error("{task} {message}")]
    Failed { task: String, message: String },

    /// The work did not finish within its budget.
    ///
    /// Whatever the work itself returned afterwards is discarded.
    #[error("{task} timed out after {timeout:?}")]
    Timeout { task: String, timeout: Duration },

    /// The external command finished with a nonzero exit code.
    #[error("{task} exited with error code {code}")]
    Process { task: String, code: i32 },
}

/// Coarse classification of a [`TaskError`], used for logging and retry
/// decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Failed,
    Timeout,
    Process,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Failed => "failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Process => "process failure",
        };
        f.write_str(name)
    }
}

impl TaskError {
    /// Generic failure with the default message.
    pub fn failed(task: impl Into<String>) -> Self {
        Self::Failed {
            task: task.into(),
            message: DEFAULT_FAILURE_MESSAGE.to_string(),
        }
    }

    /// Generic failure with an explicit message.
    pub fn failed_with(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn timeout(task: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            task: task.into(),
            timeout,
        }
    }

    pub fn process(task: impl Into<String>, code: i32) -> Self {
        Self::Process {
            task: task.into(),
            code,
        }
    }

    /// Label of the task that produced this failure.
    pub fn task(&self) -> &str {
        match self {
            TaskError::Failed { task, .. }
            | TaskError::Timeout { task, .. }
            | TaskError::Process { task, .. } => task,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            TaskError::Failed { .. } => FailureKind::Failed,
            TaskError::Timeout { .. } => FailureKind::Timeout,
            TaskError::Process { .. } => FailureKind::Process,
        }
    }

    /// Exit code carried by a process failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TaskError::Process { code, .. } => Some(*code),
            _ => None,
        }
    }
}
