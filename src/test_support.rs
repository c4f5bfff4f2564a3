//! Helpers shared by the unit tests.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing::Dispatch;

use crate::config::{Tool, Tools};
use crate::provision::ImageStore;
use crate::util::lock;

/// In-memory log sink.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        lock(&self.0).extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn dispatch(&self) -> Dispatch {
        let buf = Arc::clone(&self.buf);
        Dispatch::new(
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_ansi(false)
                .with_writer(move || CaptureWriter(Arc::clone(&buf)))
                .finish(),
        )
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buf)).into_owned()
    }
}

/// Stand-ins for vagrant, virsh and friends.
///
/// Each tool is a `sh` script that appends `<tool> <args>` to a shared call
/// log and then runs an optional body. Scripts are run through `sh` rather
/// than executed directly.
pub(crate) struct FakeTools {
    dir: TempDir,
    tools: Tools,
}

impl FakeTools {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fake = Self {
            dir,
            tools: Tools::default(),
        };
        fake.tools.vagrant = fake.script("vagrant", "");
        fake.tools.virsh = fake.script("virsh", "");
        fake.tools.ln = fake.script("ln", "");
        fake.tools.chown = fake.script("chown", "");
        fake.tools.pkill = fake.script("pkill", "");
        fake.tools.systemctl = fake.script("systemctl", "");
        fake.tools.ansible_playbook = fake.script("ansible-playbook", "");
        fake.tools.cat = fake.script("cat", "");
        fake.tools.ad_playbook = PathBuf::from("provision_ad.yml");
        fake
    }

    /// Write (or replace) the script for `name` and return the tool running it.
    pub(crate) fn script(&self, name: &str, body: &str) -> Tool {
        let path = self.dir.path().join(name);
        let script = format!(
            "echo \"{name} $*\" >> \"{log}\"\n{body}\nexit 0\n",
            name = name,
            log = self.log_path().display(),
            body = body,
        );
        std::fs::write(&path, script).expect("write fake tool");
        Tool::with_args("sh", [path.display().to_string()])
    }

    /// Replace the vagrant script.
    pub(crate) fn vagrant(&mut self, body: &str) {
        self.tools.vagrant = self.script("vagrant", body);
    }

    pub(crate) fn tools(&self) -> Tools {
        self.tools.clone()
    }

    /// Scratch directory usable as a workdir or state directory.
    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn image_store(&self) -> ImageStore {
        ImageStore {
            boxes_dir: self.dir.path().join("boxes"),
            images_dir: self.dir.path().join("images"),
        }
    }

    fn log_path(&self) -> PathBuf {
        self.dir.path().join("calls.log")
    }

    /// Every recorded invocation, in order.
    pub(crate) fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(|line| line.trim_end().to_string())
            .collect()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }
}
