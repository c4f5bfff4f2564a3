//! Ansible inventory generated by vagrant for the directory-service topology.
//!
//! Windows hosts must be reached over WinRM, so their lines are moved into a
//! dedicated `[windows]` group with the connection variables appended.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::task::{Task, TaskContext, TaskError, Work};

/// Inventory location relative to the vagrant workdir.
pub const INVENTORY_PATH: &str = ".vagrant/provisioners/ansible/inventory/vagrant_ansible_inventory";

/// Host roles living in the windows group.
pub const WINDOWS_ROLES: [&str; 2] = ["root", "forest"];

const WINDOWS_HEADER: &str = "[windows]";

const WINDOWS_VARS: &str = "[windows:vars]
ansible_winrm_server_cert_validation=ignore
ansible_connection=winrm
";

fn is_windows_host(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|host| WINDOWS_ROLES.contains(&host))
}

/// Rewrite inventory text as the default group, then `[windows]`, then the
/// windows connection variables. Blank lines are dropped, order is kept.
pub fn partition(content: &str) -> String {
    let (windows, default): (Vec<&str>, Vec<&str>) = content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .partition(|line| is_windows_host(line));

    let mut out = String::new();
    for line in default {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(WINDOWS_HEADER);
    out.push('\n');
    for line in windows {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(WINDOWS_VARS);
    out
}

fn io_failure(task: &str, path: &Path, err: std::io::Error) -> TaskError {
    TaskError::failed_with(task, format!("{}: {}", path.display(), err))
}

/// Make sure the inventory file and its directories exist.
pub struct PrepareInventory {
    path: PathBuf,
}

impl PrepareInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn into_task(self) -> Task {
        Task::new(self)
    }
}

#[async_trait]
impl Work for PrepareInventory {
    async fn run(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure(&self.label(), parent, e))?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| io_failure(&self.label(), &self.path, e))?;
        Ok(())
    }
}

/// Rewrite the inventory file in place with [`partition`].
pub struct PartitionInventory {
    path: PathBuf,
}

impl PartitionInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn into_task(self) -> Task {
        Task::new(self)
    }
}

#[async_trait]
impl Work for PartitionInventory {
    async fn run(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| io_failure(&self.label(), &self.path, e))?;
        fs::write(&self.path, partition(&content))
            .await
            .map_err(|e| io_failure(&self.label(), &self.path, e))
    }
}
