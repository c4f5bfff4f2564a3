//! # PR CI runner
//!
//! Runs a test command inside a vagrant environment provisioned for one CI
//! job, then tears the environment down.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │          ProvisionedJob          │
//!        │   (root task run by the binary)  │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!                ┌─────────────────┐
//!                │    Workflow     │  setup / body / teardown
//!                └────────┬────────┘
//!                         │
//!                         ▼
//!                ┌─────────────────┐
//!                │   ProcessTask   │  vagrant, virsh, ansible, ...
//!                └─────────────────┘
//! ```
//!
//! ## Task Flow
//! 1. Load configuration and build the log dispatch
//! 2. Download and link the box image
//! 3. Bring up and provision the machines, recovering once on failure
//! 4. Run the command, bounded by its timeout
//! 5. Destroy the machines
//!
//! ## Modules
//! - `task`: timeout-bounded tasks, subtask trees, process tasks
//! - `provision`: vagrant primitives and workflows
//! - `job`: the root task
//! - `config`: YAML configuration with environment overrides

pub mod config;
pub mod job;
pub mod logging;
pub mod provision;
pub mod task;
pub mod util;

#[cfg(test)]
mod test_support;

pub use config::RunnerConfig;
pub use job::ProvisionedJob;
pub use task::{Task, TaskError};
