//! Failure policy: whether a task's failure reaches its caller.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::TaskError;

/// What happens to a failure once a task has finished.
///
/// `Propagate` is the default. `BestEffort` turns the failure into a warning
/// line and a successful outcome, which is how cleanup steps avoid masking an
/// earlier, more important failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Propagate,
    BestEffort,
}

impl FailurePolicy {
    /// Apply the policy to a finished invocation.
    pub fn apply(&self, outcome: Result<(), TaskError>) -> Result<(), TaskError> {
        match (self, outcome) {
            (FailurePolicy::BestEffort, Err(err)) => {
                warn!("{}", err);
                Ok(())
            }
            (_, outcome) => outcome,
        }
    }
}
