//! Vagrant box descriptor and where its image lives on disk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Provider used when the configuration does not name one.
pub const DEFAULT_PROVIDER: &str = "libvirt";

/// Replacement vagrant uses for `/` in box names on disk.
const SLASH_ESCAPE: &str = "-VAGRANTSLASH-";

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

/// Immutable descriptor of a vagrant box. Every path is derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VagrantBox {
    pub name: String,
    pub version: String,
    #[serde(default = "default_provider")]
    pub provider: String,
}

/// Roots of the two image locations a box touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageStore {
    /// Vagrant's box cache.
    pub boxes_dir: PathBuf,
    /// Hypervisor storage pool directory.
    pub images_dir: PathBuf,
}

impl Default for ImageStore {
    fn default() -> Self {
        Self {
            boxes_dir: PathBuf::from("/root/.vagrant.d/boxes"),
            images_dir: PathBuf::from("/var/lib/libvirt/images"),
        }
    }
}

impl VagrantBox {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            provider: default_provider(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Name safe to use as a single path component.
    pub fn escaped_name(&self) -> String {
        self.name.replace('/', SLASH_ESCAPE)
    }

    /// Where `vagrant box add` leaves the downloaded image.
    pub fn cache_path(&self, store: &ImageStore) -> PathBuf {
        store
            .boxes_dir
            .join(self.escaped_name())
            .join(&self.version)
            .join(&self.provider)
            .join("box.img")
    }

    /// Name the hypervisor gives the imported image.
    pub fn image_name(&self) -> String {
        format!("{}_vagrant_box_image", self.escaped_name())
    }

    /// Where the hypervisor expects the imported image.
    pub fn image_path(&self, store: &ImageStore) -> PathBuf {
        store
            .images_dir
            .join(format!("{}_{}.img", self.image_name(), self.version))
    }

    pub fn is_cached(&self, store: &ImageStore) -> bool {
        exists(&self.cache_path(store))
    }

    pub fn is_imported(&self, store: &ImageStore) -> bool {
        exists(&self.image_path(store))
    }
}

fn exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}

impl std::fmt::Display for VagrantBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.name, self.version, self.provider)
    }
}
