//! Vagrant-based test environments.
//!
//! - `vagrant_box`: where boxes and hypervisor images live on disk
//! - `primitives`: single lifecycle steps (download, up, provision, teardown)
//! - `inventory`: ansible inventory rewriting for windows hosts
//! - `retry`: bounded retry of flaky steps
//! - `workflow`: setup, body, teardown for each topology

mod inventory;
mod primitives;
pub mod retry;
mod vagrant_box;
mod workflow;

pub use inventory::{partition, PartitionInventory, PrepareInventory, INVENTORY_PATH, WINDOWS_ROLES};
pub use primitives::{
    BoxDownload, ProvisionDirectoryRoles, Teardown, Toolbox, VagrantProvision, VagrantUp,
};
pub use vagrant_box::{ImageStore, VagrantBox, DEFAULT_PROVIDER};
pub use workflow::{
    Stage, Topology, Workflow, DIRECTORY_MEMBERS, DIRECTORY_ROOTS, DIRECTORY_ROOT_ATTEMPTS,
};
