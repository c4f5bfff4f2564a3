//! Single VM-lifecycle steps.
//!
//! Each step is a [`Work`] that runs one or a few [`ProcessTask`]s as
//! subtasks. Steps themselves have no time limit; see `into_task`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::vagrant_box::{ImageStore, VagrantBox};
use crate::config::{Tool, Tools};
use crate::task::{ProcessTask, Task, TaskContext, TaskError, Work};

/// Tools plus the directory vagrant commands run from.
#[derive(Debug, Clone)]
pub struct Toolbox {
    tools: Arc<Tools>,
    workdir: PathBuf,
}

impl Toolbox {
    pub fn new(tools: Tools, workdir: impl Into<PathBuf>) -> Self {
        Self {
            tools: Arc::new(tools),
            workdir: workdir.into(),
        }
    }

    pub fn tools(&self) -> &Tools {
        &self.tools
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// `tool args...` run from the workdir.
    pub fn process<I, S>(&self, tool: &Tool, args: I) -> ProcessTask
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessTask::new(tool.command().args(args)).in_dir(&self.workdir)
    }

    fn vagrant<I, S>(&self, args: I) -> ProcessTask
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.process(&self.tools.vagrant, args)
    }
}

/// Download a box unless cached, then link its image into the hypervisor
/// pool unless already imported.
///
/// A failed link leaves the downloaded box in place for the next attempt.
pub struct BoxDownload {
    vagrant_box: VagrantBox,
    store: ImageStore,
    link_image: bool,
    toolbox: Toolbox,
}

impl BoxDownload {
    pub fn new(vagrant_box: VagrantBox, store: ImageStore, toolbox: Toolbox) -> Self {
        Self {
            vagrant_box,
            store,
            link_image: true,
            toolbox,
        }
    }

    /// Hard-link the image instead of letting the hypervisor copy it.
    pub fn link_image(mut self, link_image: bool) -> Self {
        self.link_image = link_image;
        self
    }

    pub fn into_task(self) -> Task {
        Task::new(self).unbounded()
    }

    async fn download(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let add = self.toolbox.vagrant([
            "box",
            "add",
            self.vagrant_box.name.as_str(),
            "--box-version",
            self.vagrant_box.version.as_str(),
            "--provider",
            self.vagrant_box.provider.as_str(),
        ]);
        ctx.execute_subtask(Task::new(add).unbounded()).await
    }

    async fn link(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let tools = self.toolbox.tools();
        let cache = self.vagrant_box.cache_path(&self.store).display().to_string();
        let image = self.vagrant_box.image_path(&self.store).display().to_string();

        ctx.execute_subtask(Task::new(
            self.toolbox.process(&tools.ln, [cache.as_str(), image.as_str()]),
        ))
        .await?;
        ctx.execute_subtask(Task::new(self.toolbox.process(
            &tools.chown,
            [tools.image_owner.as_str(), image.as_str()],
        )))
        .await?;
        ctx.execute_subtask(Task::new(self.toolbox.process(
            &tools.virsh,
            ["pool-refresh", tools.storage_pool.as_str()],
        )))
        .await
    }
}

#[async_trait]
impl Work for BoxDownload {
    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        if self.vagrant_box.is_cached(&self.store) {
            debug!("Box {} already cached", self.vagrant_box);
        } else if let Err(err) = self.download(ctx).await {
            error!("Box download failed: {}", err);
            return Err(err);
        }

        if self.link_image && !self.vagrant_box.is_imported(&self.store) {
            if let Err(err) = self.link(ctx).await {
                warn!("Failed to create libvirt link to image: {}", err);
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Start machines without running provisioners.
///
/// With no machine names the whole topology comes up; more than one machine
/// is started in parallel by vagrant.
pub struct VagrantUp {
    machines: Vec<String>,
    toolbox: Toolbox,
}

impl VagrantUp {
    pub fn all(toolbox: Toolbox) -> Self {
        Self {
            machines: Vec::new(),
            toolbox,
        }
    }

    pub fn machines<I, S>(toolbox: Toolbox, machines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            machines: machines.into_iter().map(Into::into).collect(),
            toolbox,
        }
    }

    pub fn into_task(self) -> Task {
        Task::new(self).unbounded()
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["up".to_string()];
        args.extend(self.machines.iter().cloned());
        args.push("--no-provision".to_string());
        if self.machines.len() != 1 {
            args.push("--parallel".to_string());
        }
        args
    }
}

#[async_trait]
impl Work for VagrantUp {
    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        ctx.execute_subtask(Task::new(self.toolbox.vagrant(self.args())).unbounded())
            .await
    }

    fn label(&self) -> String {
        if self.machines.is_empty() {
            "VagrantUp".to_string()
        } else {
            format!("VagrantUp({})", self.machines.join(", "))
        }
    }
}

/// Run the configured provisioner against running machines.
pub struct VagrantProvision {
    toolbox: Toolbox,
}

impl VagrantProvision {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }

    pub fn into_task(self) -> Task {
        Task::new(self).unbounded()
    }
}

#[async_trait]
impl Work for VagrantProvision {
    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        ctx.execute_subtask(Task::new(self.toolbox.vagrant(["provision"])).unbounded())
            .await
    }
}

/// Run the directory-service playbook against the partitioned inventory.
pub struct ProvisionDirectoryRoles {
    inventory: PathBuf,
    toolbox: Toolbox,
}

impl ProvisionDirectoryRoles {
    pub fn new(toolbox: Toolbox, inventory: impl Into<PathBuf>) -> Self {
        Self {
            inventory: inventory.into(),
            toolbox,
        }
    }

    pub fn into_task(self) -> Task {
        Task::new(self).unbounded()
    }
}

#[async_trait]
impl Work for ProvisionDirectoryRoles {
    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let tools = self.toolbox.tools();
        let inventory = self.inventory.display().to_string();

        // Inventory content goes to the log for post-mortem debugging.
        ctx.execute_subtask(Task::new(
            self.toolbox.process(&tools.cat, [inventory.as_str()]),
        ))
        .await?;

        let playbook = tools.ad_playbook.display().to_string();
        let run = self.toolbox.process(
            &tools.ansible_playbook,
            ["-vvv", playbook.as_str(), "-i", inventory.as_str()],
        );
        ctx.execute_subtask(Task::new(run).unbounded()).await
    }
}

/// Destroy every machine.
///
/// If vagrant itself fails, the usual cause is a hung hypervisor
/// connection: kill vagrant, restart the virtualization daemon and try the
/// destroy once more, best effort.
pub struct Teardown {
    toolbox: Toolbox,
}

impl Teardown {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }

    pub fn into_task(self) -> Task {
        Task::new(self).unbounded()
    }

    fn destroy(&self) -> Task {
        Task::new(self.toolbox.vagrant(["destroy", "--force"]))
    }

    async fn recover(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let tools = self.toolbox.tools();
        ctx.execute_subtask(
            Task::new(self.toolbox.process(&tools.pkill, ["-9", "bin/vagrant"])).best_effort(),
        )
        .await?;
        ctx.execute_subtask(
            Task::new(self.toolbox.process(
                &tools.systemctl,
                ["restart", tools.hypervisor_service.as_str()],
            ))
            .best_effort(),
        )
        .await?;
        ctx.execute_subtask(self.destroy().best_effort()).await
    }
}

#[async_trait]
impl Work for Teardown {
    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        match ctx.execute_subtask(self.destroy()).await {
            Err(err @ TaskError::Process { .. }) => {
                info!("Destroy failed ({}), restarting hypervisor services", err);
                self.recover(ctx).await
            }
            outcome => outcome,
        }
    }
}
