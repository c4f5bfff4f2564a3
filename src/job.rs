//! The root task the binary runs: a configured command executed inside a
//! freshly provisioned environment.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::RunnerConfig;
use crate::provision::Workflow;
use crate::task::{CommandLine, ProcessTask, Task, TaskContext, TaskError, Work};

/// Provision, run the command (if any), tear down.
pub struct ProvisionedJob {
    workflow: Workflow,
    command: Option<CommandLine>,
    command_timeout: Option<Duration>,
    workdir: PathBuf,
}

impl ProvisionedJob {
    pub fn new(workflow: Workflow, workdir: impl Into<PathBuf>) -> Self {
        Self {
            workflow,
            command: None,
            command_timeout: None,
            workdir: workdir.into(),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        let job = Self::new(Workflow::from_config(config), config.workdir.clone());
        match &config.command {
            Some(script) => job.with_command(
                CommandLine::shell(script.as_str()),
                config.command_timeout(),
            ),
            None => job,
        }
    }

    /// Run `command` in the workdir once the environment is up; `timeout`
    /// of `None` leaves it unbounded.
    pub fn with_command(mut self, command: CommandLine, timeout: Option<Duration>) -> Self {
        self.command = Some(command);
        self.command_timeout = timeout;
        self
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    async fn run_command(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let Some(command) = &self.command else {
            info!("No command configured, provisioning only");
            return Ok(());
        };
        let process = ProcessTask::new(command.clone()).in_dir(&self.workdir);
        ctx.execute_subtask(Task::new(process).with_timeout(self.command_timeout))
            .await
    }
}

#[async_trait]
impl Work for ProvisionedJob {
    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        self.workflow.run(ctx, || self.run_command(ctx)).await
    }

    fn label(&self) -> String {
        match &self.command {
            Some(command) => format!("ProvisionedJob({})", command),
            None => "ProvisionedJob".to_string(),
        }
    }
}
