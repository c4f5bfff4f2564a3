//! Provisioning workflows: set up an environment, run a body of work in it,
//! always tear it down afterwards.
//!
//! # State Machine
//! ```text
//! NotStarted -> BoxReady -> HostsUp -> Provisioned -> Done -> TornDown
//!                              \            \
//!                               +-> Recovering -> HostsUp (once)
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::inventory::{PartitionInventory, PrepareInventory, INVENTORY_PATH};
use super::primitives::{
    BoxDownload, ProvisionDirectoryRoles, Teardown, Toolbox, VagrantProvision, VagrantUp,
};
use super::retry;
use super::vagrant_box::{ImageStore, VagrantBox};
use crate::config::RunnerConfig;
use crate::task::{Task, TaskContext, TaskError};
use crate::util::lock;

/// Attempts at bringing up the directory root/forest pair.
pub const DIRECTORY_ROOT_ATTEMPTS: u32 = 3;

/// Directory-service hosts, brought up one by one.
pub const DIRECTORY_ROOTS: [&str; 2] = ["root", "forest"];

/// Linux hosts joined to the directory.
pub const DIRECTORY_MEMBERS: [&str; 2] = ["master", "controller"];

/// Shape of the test environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Whatever the `Vagrantfile` defines, brought up together.
    #[default]
    Single,
    /// Windows directory hosts plus Linux members.
    Directory,
}

/// Where a workflow run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    NotStarted,
    BoxReady,
    HostsUp,
    Provisioned,
    Recovering,
    Done,
    TornDown,
}

/// Sets up a vagrant environment around a body of work.
pub struct Workflow {
    topology: Topology,
    vagrant_box: VagrantBox,
    store: ImageStore,
    link_image: bool,
    no_destroy: bool,
    toolbox: Toolbox,
    stages: Mutex<Vec<Stage>>,
}

impl Workflow {
    pub fn new(
        topology: Topology,
        vagrant_box: VagrantBox,
        store: ImageStore,
        toolbox: Toolbox,
    ) -> Self {
        Self {
            topology,
            vagrant_box,
            store,
            link_image: true,
            no_destroy: false,
            toolbox,
            stages: Mutex::new(vec![Stage::NotStarted]),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            config.topology,
            config.vagrant_box.clone(),
            config.storage.clone(),
            Toolbox::new(config.tools.clone(), config.workdir.clone()),
        )
        .link_image(config.link_image)
        .no_destroy(config.no_destroy)
    }

    pub fn link_image(mut self, link_image: bool) -> Self {
        self.link_image = link_image;
        self
    }

    /// Keep the machines after the run.
    pub fn no_destroy(mut self, no_destroy: bool) -> Self {
        self.no_destroy = no_destroy;
        self
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Every stage entered so far, starting with `NotStarted`.
    pub fn stages(&self) -> Vec<Stage> {
        lock(&self.stages).clone()
    }

    pub fn stage(&self) -> Stage {
        lock(&self.stages)
            .last()
            .copied()
            .unwrap_or(Stage::NotStarted)
    }

    fn enter(&self, stage: Stage) {
        info!(?stage, "Workflow stage: {:?}", stage);
        lock(&self.stages).push(stage);
    }

    /// Set up the environment, run `body` in it, then tear it down unless
    /// destruction is suppressed.
    ///
    /// Teardown runs on every exit path, including a failed setup; it is best
    /// effort and never masks the run's own outcome.
    pub async fn run<F, Fut>(&self, ctx: &TaskContext, body: F) -> Result<(), TaskError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), TaskError>> + Send,
    {
        let outcome = match self.setup(ctx).await {
            Ok(()) => body().await.map(|()| self.enter(Stage::Done)),
            Err(err) => {
                error!("vagrant or provisioning failed: {}", err);
                Err(err)
            }
        };

        if self.no_destroy {
            info!("Leaving machines in place");
        } else {
            ctx.execute_subtask(self.teardown()).await?;
            self.enter(Stage::TornDown);
        }
        outcome
    }

    async fn setup(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        ctx.execute_subtask(
            BoxDownload::new(
                self.vagrant_box.clone(),
                self.store.clone(),
                self.toolbox.clone(),
            )
            .link_image(self.link_image)
            .into_task(),
        )
        .await?;
        self.enter(Stage::BoxReady);

        match self.topology {
            Topology::Single => self.setup_single(ctx).await,
            Topology::Directory => self.setup_directory(ctx).await,
        }
    }

    fn teardown(&self) -> Task {
        Teardown::new(self.toolbox.clone()).into_task().best_effort()
    }

    fn inventory_path(&self) -> PathBuf {
        self.toolbox.workdir().join(INVENTORY_PATH)
    }

    async fn recover(&self, ctx: &TaskContext, err: &TaskError) -> Result<(), TaskError> {
        debug!(?err, "Setup attempt failed");
        info!("Failed to provision/up VM. Trying it again");
        self.enter(Stage::Recovering);
        ctx.execute_subtask(self.teardown()).await
    }

    async fn setup_single(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        if let Err(err) = self.up_and_provision(ctx).await {
            self.recover(ctx, &err).await?;
            self.up_and_provision(ctx).await?;
        }
        Ok(())
    }

    async fn up_and_provision(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        ctx.execute_subtask(VagrantUp::all(self.toolbox.clone()).into_task())
            .await?;
        self.enter(Stage::HostsUp);
        ctx.execute_subtask(VagrantProvision::new(self.toolbox.clone()).into_task())
            .await?;
        self.enter(Stage::Provisioned);
        Ok(())
    }

    async fn setup_directory(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        if let Err(err) = self.directory_sequence(ctx).await {
            self.recover(ctx, &err).await?;
            self.bring_up_directory_roots(ctx).await;
            self.enter(Stage::HostsUp);
            self.bring_up_members(ctx).await?;
            ctx.execute_subtask(VagrantProvision::new(self.toolbox.clone()).into_task())
                .await?;
            self.enter(Stage::Provisioned);
        }
        Ok(())
    }

    async fn directory_sequence(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        self.bring_up_directory_roots(ctx).await;
        self.enter(Stage::HostsUp);

        let inventory = self.inventory_path();
        ctx.execute_subtask(PrepareInventory::new(&inventory).into_task())
            .await?;
        ctx.execute_subtask(PartitionInventory::new(&inventory).into_task())
            .await?;
        ctx.execute_subtask(
            ProvisionDirectoryRoles::new(self.toolbox.clone(), &inventory).into_task(),
        )
        .await?;

        self.bring_up_members(ctx).await?;
        ctx.execute_subtask(VagrantProvision::new(self.toolbox.clone()).into_task())
            .await?;
        self.enter(Stage::Provisioned);
        self.bring_up_members(ctx).await
    }

    /// Bring up root then forest, retrying the pair.
    ///
    /// Exhausting the attempts does not stop the workflow: later steps run
    /// against whatever state the hosts are in.
    async fn bring_up_directory_roots(&self, ctx: &TaskContext) {
        let outcome = retry::attempts(
            DIRECTORY_ROOT_ATTEMPTS,
            "Directory root/forest bring-up",
            retry::TRANSIENT,
            move || async move {
                for host in DIRECTORY_ROOTS {
                    ctx.execute_subtask(
                        VagrantUp::machines(self.toolbox.clone(), [host]).into_task(),
                    )
                    .await?;
                }
                Ok(())
            },
        )
        .await;

        if let Err(err) = outcome {
            warn!(
                "Continuing with directory hosts in an unknown state after: {}",
                err
            );
        }
    }

    async fn bring_up_members(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        ctx.execute_subtask(
            VagrantUp::machines(self.toolbox.clone(), DIRECTORY_MEMBERS).into_task(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTools;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn workflow(fake: &FakeTools, topology: Topology) -> Workflow {
        Workflow::new(
            topology,
            VagrantBox::new("freeipa/ci-master-f28", "0.2.5"),
            fake.image_store(),
            Toolbox::new(fake.tools(), fake.path()),
        )
        .link_image(false)
    }

    /// vagrant fails the first `up` it sees, then behaves.
    fn fail_first_up(fake: &mut FakeTools) {
        let marker = fake.path().join("up.failed");
        fake.vagrant(&format!(
            "if [ \"$1\" = up ] && [ ! -e \"{m}\" ]; then touch \"{m}\"; exit 1; fi",
            m = marker.display()
        ));
    }

    fn vagrant_calls(fake: &FakeTools) -> Vec<String> {
        fake.calls()
            .into_iter()
            .filter(|c| c.starts_with("vagrant ") && !c.starts_with("vagrant box"))
            .collect()
    }

    #[tokio::test]
    async fn single_host_happy_path() {
        let fake = FakeTools::new();
        let wf = workflow(&fake, Topology::Single);
        let ran = AtomicBool::new(false);

        wf.run(&TaskContext::root(), || async {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(
            vagrant_calls(&fake),
            vec![
                "vagrant up --no-provision --parallel",
                "vagrant provision",
                "vagrant destroy --force",
            ]
        );
        assert_eq!(
            wf.stages(),
            vec![
                Stage::NotStarted,
                Stage::BoxReady,
                Stage::HostsUp,
                Stage::Provisioned,
                Stage::Done,
                Stage::TornDown,
            ]
        );
    }

    #[tokio::test]
    async fn single_host_recovers_from_one_bring_up_failure() {
        let mut fake = FakeTools::new();
        fail_first_up(&mut fake);
        let wf = workflow(&fake, Topology::Single);

        wf.run(&TaskContext::root(), || async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(fake.count("vagrant destroy --force"), 2);
        assert_eq!(
            vagrant_calls(&fake),
            vec![
                "vagrant up --no-provision --parallel",
                "vagrant destroy --force",
                "vagrant up --no-provision --parallel",
                "vagrant provision",
                "vagrant destroy --force",
            ]
        );
        assert_eq!(
            wf.stages(),
            vec![
                Stage::NotStarted,
                Stage::BoxReady,
                Stage::Recovering,
                Stage::HostsUp,
                Stage::Provisioned,
                Stage::Done,
                Stage::TornDown,
            ]
        );
    }

    #[tokio::test]
    async fn single_host_second_failure_propagates_and_still_tears_down() {
        let mut fake = FakeTools::new();
        fake.vagrant("[ \"$1\" = provision ] && exit 2");
        let wf = workflow(&fake, Topology::Single);
        let ran = AtomicBool::new(false);

        let err = wf
            .run(&TaskContext::root(), || async {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(2));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(fake.count("vagrant provision"), 2);
        assert_eq!(fake.count("vagrant destroy --force"), 2);
        assert_eq!(wf.stage(), Stage::TornDown);
    }

    #[tokio::test]
    async fn body_failure_propagates_after_teardown() {
        let fake = FakeTools::new();
        let wf = workflow(&fake, Topology::Single);

        let err = wf
            .run(&TaskContext::root(), || async {
                Err(TaskError::failed_with("tests", "3 failed"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "tests 3 failed");
        assert_eq!(fake.count("vagrant destroy --force"), 1);
        assert!(!wf.stages().contains(&Stage::Done));
    }

    #[tokio::test]
    async fn no_destroy_skips_teardown() {
        let fake = FakeTools::new();
        let wf = workflow(&fake, Topology::Single).no_destroy(true);
        wf.run(&TaskContext::root(), || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(fake.count("vagrant destroy --force"), 0);
        assert_eq!(wf.stage(), Stage::Done);
    }

    #[tokio::test]
    async fn box_download_failure_skips_body_but_tears_down() {
        let mut fake = FakeTools::new();
        fake.vagrant("[ \"$1\" = box ] && exit 1");
        let wf = workflow(&fake, Topology::Single);

        let err = wf
            .run(&TaskContext::root(), || async { Ok(()) })
            .await
            .unwrap_err();

        assert!(err.task().contains("box add"));
        assert_eq!(fake.count("vagrant destroy --force"), 1);
        assert_eq!(wf.stages(), vec![Stage::NotStarted, Stage::TornDown]);
    }

    fn write_inventory(fake: &FakeTools) {
        let path = fake.path().join(INVENTORY_PATH);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "root ansible_host=1.2.3.4\nforest ansible_host=1.2.3.5\nmaster ansible_host=1.2.3.6\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn directory_happy_path() {
        let fake = FakeTools::new();
        write_inventory(&fake);
        let wf = workflow(&fake, Topology::Directory);

        wf.run(&TaskContext::root(), || async { Ok(()) })
            .await
            .unwrap();

        let inventory = fake.path().join(INVENTORY_PATH).display().to_string();
        let calls: Vec<String> = fake
            .calls()
            .into_iter()
            .filter(|c| !c.starts_with("vagrant box"))
            .collect();
        assert_eq!(
            calls,
            vec![
                "vagrant up root --no-provision".to_string(),
                "vagrant up forest --no-provision".to_string(),
                format!("cat {}", inventory),
                format!("ansible-playbook -vvv provision_ad.yml -i {}", inventory),
                "vagrant up master controller --no-provision --parallel".to_string(),
                "vagrant provision".to_string(),
                "vagrant up master controller --no-provision --parallel".to_string(),
                "vagrant destroy --force".to_string(),
            ]
        );

        let rewritten = std::fs::read_to_string(fake.path().join(INVENTORY_PATH)).unwrap();
        assert!(rewritten.starts_with("master ansible_host=1.2.3.6\n[windows]\nroot"));
        assert_eq!(wf.stage(), Stage::TornDown);
    }

    #[tokio::test]
    async fn directory_root_bring_up_failing_every_attempt_does_not_abort() {
        let mut fake = FakeTools::new();
        fake.vagrant("[ \"$1 $2\" = \"up root\" ] && exit 1");
        let wf = workflow(&fake, Topology::Directory);

        wf.run(&TaskContext::root(), || async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(fake.count("vagrant up root --no-provision"), 3);
        assert_eq!(fake.count("vagrant up forest --no-provision"), 0);
        // Provisioning still happened, against hosts in unknown state.
        assert_eq!(fake.count("vagrant provision"), 1);
        assert!(fake
            .calls()
            .iter()
            .any(|c| c.starts_with("ansible-playbook")));
        assert!(!wf.stages().contains(&Stage::Recovering));
        assert!(wf.stages().contains(&Stage::Done));
    }

    #[tokio::test]
    async fn directory_root_bring_up_retries_until_success() {
        let mut fake = FakeTools::new();
        fail_first_up(&mut fake);
        let wf = workflow(&fake, Topology::Directory);

        wf.run(&TaskContext::root(), || async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(fake.count("vagrant up root --no-provision"), 2);
        assert_eq!(fake.count("vagrant up forest --no-provision"), 1);
        assert_eq!(fake.count("vagrant destroy --force"), 1);
    }

    #[tokio::test]
    async fn directory_failure_recovers_once() {
        let mut fake = FakeTools::new();
        let marker = fake.path().join("provision.failed");
        fake.vagrant(&format!(
            "if [ \"$1\" = provision ] && [ ! -e \"{m}\" ]; then touch \"{m}\"; exit 1; fi",
            m = marker.display()
        ));
        let wf = workflow(&fake, Topology::Directory);

        wf.run(&TaskContext::root(), || async { Ok(()) })
            .await
            .unwrap();

        let calls = vagrant_calls(&fake);
        let recovery_start = calls
            .iter()
            .position(|c| c == "vagrant destroy --force")
            .unwrap();
        assert_eq!(
            calls[recovery_start..].to_vec(),
            vec![
                "vagrant destroy --force",
                "vagrant up root --no-provision",
                "vagrant up forest --no-provision",
                "vagrant up master controller --no-provision --parallel",
                "vagrant provision",
                "vagrant destroy --force",
            ]
        );
        assert!(wf.stages().contains(&Stage::Recovering));
    }

    #[tokio::test]
    async fn directory_second_failure_propagates() {
        let mut fake = FakeTools::new();
        fake.vagrant("[ \"$1\" = provision ] && exit 4");
        let wf = workflow(&fake, Topology::Directory);

        let err = wf
            .run(&TaskContext::root(), || async { Ok(()) })
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(4));
        assert_eq!(fake.count("vagrant provision"), 2);
        assert_eq!(fake.count("vagrant destroy --force"), 2);
    }

    #[test]
    fn topology_parses_from_config_values() {
        let t: Topology = serde_yaml::from_str("directory").unwrap();
        assert_eq!(t, Topology::Directory);
        assert_eq!(Topology::default(), Topology::Single);
    }
}
