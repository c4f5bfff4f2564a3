//! Task module - timeout-bounded units of work and their subtask trees.
//!
//! This module is designed around a few explicit contracts:
//! - Every failure is a typed [`TaskError`] naming the task that produced it
//! - A task's timeout is fixed once it is constructed
//! - Termination runs root to leaf and is safe to repeat

mod error;
mod policy;
pub mod process;
mod subtask;
pub mod task;

pub use error::{FailureKind, TaskError, DEFAULT_FAILURE_MESSAGE};
pub use policy::FailurePolicy;
pub use process::{CommandLine, ProcessTask};
pub use subtask::TaskContext;
pub use task::{Task, TaskId, Work, DEFAULT_TIMEOUT};
