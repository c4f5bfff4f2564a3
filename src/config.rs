//! Configuration management for the runner.
//!
//! Configuration is read from a YAML file and can then be adjusted via
//! environment variables:
//! - `PRCI_NO_DESTROY` - Optional. Keep the machines after the run (`1`, `true`, ...).
//! - `PRCI_LOG_FILE` - Optional. Log file path. Defaults to `runner.log`.
//! - `PRCI_WORKDIR` - Optional. Directory holding the `Vagrantfile`. Defaults to `.`.
//!
//! Log filtering uses `RUST_LOG` (see [`crate::logging`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provision::{ImageStore, Topology, VagrantBox};
use crate::task::CommandLine;
use crate::util::parse_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// An external program, optionally with leading arguments (`sudo vagrant`).
///
/// Written in configuration as one whitespace-separated string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tool {
    program: String,
    args: Vec<String>,
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Command line invoking this tool, ready for more arguments.
    pub fn command(&self) -> CommandLine {
        CommandLine::new(std::iter::once(self.program.clone()).chain(self.args.iter().cloned()))
    }
}

impl TryFrom<String> for Tool {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let mut words = value.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| ConfigError::InvalidValue("tool".to_string(), "empty command".to_string()))?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }
}

impl From<Tool> for String {
    fn from(tool: Tool) -> Self {
        tool.to_string()
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// External programs and fixed names the provisioning steps rely on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tools {
    pub vagrant: Tool,
    pub virsh: Tool,
    pub ln: Tool,
    pub chown: Tool,
    pub pkill: Tool,
    pub systemctl: Tool,
    pub ansible_playbook: Tool,
    pub cat: Tool,

    /// Virtualization daemon restarted when teardown hangs.
    pub hypervisor_service: String,
    /// Owner given to a linked image.
    pub image_owner: String,
    /// Storage pool refreshed after linking.
    pub storage_pool: String,
    /// Playbook preparing the directory-service hosts.
    pub ad_playbook: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            vagrant: Tool::new("vagrant"),
            virsh: Tool::new("virsh"),
            ln: Tool::new("ln"),
            chown: Tool::new("chown"),
            pkill: Tool::new("pkill"),
            systemctl: Tool::new("systemctl"),
            ansible_playbook: Tool::new("ansible-playbook"),
            cat: Tool::new("cat"),
            hypervisor_service: "libvirtd".to_string(),
            image_owner: "qemu:qemu".to_string(),
            storage_pool: "default".to_string(),
            ad_playbook: PathBuf::from("/root/freeipa-pr-ci/ansible/provision_ad.yml"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("runner.log")
}

/// Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Box the machines are built from
    #[serde(rename = "box")]
    pub vagrant_box: VagrantBox,

    /// Hard-link the cached image into the hypervisor pool instead of copying
    #[serde(default = "default_true")]
    pub link_image: bool,

    /// Leave machines running after the run
    #[serde(default)]
    pub no_destroy: bool,

    #[serde(default)]
    pub topology: Topology,

    /// Directory holding the `Vagrantfile`
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Shell command run inside the provisioned environment
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub command_timeout_secs: Option<u64>,

    #[serde(default)]
    pub storage: ImageStore,

    #[serde(default)]
    pub tools: Tools,

    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

impl RunnerConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or a value
    /// is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_yaml::from_str(&raw)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration without consulting the environment.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PRCI_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PRCI_NO_DESTROY") {
            self.no_destroy = parse_bool(&value);
        }
        if let Some(value) = lookup("PRCI_LOG_FILE") {
            self.log_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("PRCI_WORKDIR") {
            self.workdir = PathBuf::from(value);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vagrant_box.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "box.name".to_string(),
                "must not be empty".to_string(),
            ));
        }
        if self.vagrant_box.version.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "box.version".to_string(),
                "must not be empty".to_string(),
            ));
        }
        if self.command_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue(
                "command_timeout_secs".to_string(),
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Budget of the configured command; `None` means unbounded.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = "box:\n  name: freeipa/ci-master-f28\n  version: 0.2.5\n";

    #[test]
    fn minimal_config_uses_defaults() {
        let config = RunnerConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.vagrant_box.provider, "libvirt");
        assert!(config.link_image);
        assert!(!config.no_destroy);
        assert_eq!(config.topology, Topology::Single);
        assert_eq!(config.workdir, PathBuf::from("."));
        assert_eq!(config.log_file, PathBuf::from("runner.log"));
        assert_eq!(config.tools, Tools::default());
        assert_eq!(config.command_timeout(), None);
    }

    #[test]
    fn full_config_is_parsed() {
        let raw = r#"
box:
  name: freeipa/ci-master-f28
  version: 0.2.5
  provider: libvirt
link_image: false
topology: directory
workdir: /srv/job
command: ipa-run-tests test_xmlrpc
command_timeout_secs: 3600
storage:
  boxes_dir: /data/boxes
tools:
  vagrant: sudo vagrant
  hypervisor_service: libvirt
"#;
        let config = RunnerConfig::from_yaml_str(raw).unwrap();
        assert!(!config.link_image);
        assert_eq!(config.topology, Topology::Directory);
        assert_eq!(config.command.as_deref(), Some("ipa-run-tests test_xmlrpc"));
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.storage.boxes_dir, PathBuf::from("/data/boxes"));
        assert_eq!(
            config.storage.images_dir,
            PathBuf::from("/var/lib/libvirt/images")
        );
        assert_eq!(config.tools.vagrant, Tool::with_args("sudo", ["vagrant"]));
        assert_eq!(config.tools.hypervisor_service, "libvirt");
        assert_eq!(config.tools.virsh, Tool::new("virsh"));
    }

    #[test]
    fn empty_box_name_is_rejected() {
        let err = RunnerConfig::from_yaml_str("box:\n  name: ' '\n  version: '1'\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref field, _) if field == "box.name"));
    }

    #[test]
    fn empty_tool_is_rejected() {
        let raw = format!("{}tools:\n  vagrant: '  '\n", MINIMAL);
        assert!(matches!(
            RunnerConfig::from_yaml_str(&raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_win() {
        let mut config = RunnerConfig::from_yaml_str(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = [
            ("PRCI_NO_DESTROY", "yes"),
            ("PRCI_LOG_FILE", "/tmp/run.log"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert!(config.no_destroy);
        assert_eq!(config.log_file, PathBuf::from("/tmp/run.log"));
        assert_eq!(config.workdir, PathBuf::from("."));
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let err = RunnerConfig::load("/nonexistent/prci.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/prci.yaml"));
    }

    #[test]
    fn tool_builds_command_line() {
        let tool = Tool::with_args("sudo", ["vagrant"]);
        assert_eq!(tool.to_string(), "sudo vagrant");
        assert_eq!(
            tool.command().arg("up").argv(),
            &["sudo".to_string(), "vagrant".to_string(), "up".to_string()]
        );
    }
}
