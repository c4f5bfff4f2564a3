//! Process-backed tasks.
//!
//! Spawns an external command, forwards its combined stdout/stderr to the log
//! line by line as it arrives, and classifies the exit code.
//!
//! Every command runs as the leader of its own process group. Termination
//! signals the whole group, so a shell and whatever it started go together.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{TaskContext, TaskError, Work};
use crate::util::lock;

/// What to execute: an argument vector, or a shell string run by `/bin/sh -c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    argv: Vec<String>,
    shell: bool,
}

impl CommandLine {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            shell: false,
        }
    }

    /// A shell-interpreted command string.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            argv: vec![script.into()],
            shell: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn is_shell(&self) -> bool {
        self.shell
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}

/// A task running one external command.
///
/// # Invariants
/// - `pid` is `Some` from spawn until the child is reaped and its output
///   streams are closed
/// - only `run`, which owns the child, sends signals; `terminate` just asks
/// - `exit_code` is `None` until the process has ended
#[derive(Debug)]
pub struct ProcessTask {
    command: CommandLine,
    env: Option<BTreeMap<OsString, OsString>>,
    current_dir: Option<PathBuf>,
    pid: Mutex<Option<u32>>,
    exit_code: Mutex<Option<i32>>,
    stop: watch::Sender<bool>,
}

impl ProcessTask {
    pub fn new(command: CommandLine) -> Self {
        Self {
            command,
            env: None,
            current_dir: None,
            pid: Mutex::new(None),
            exit_code: Mutex::new(None),
            stop: watch::channel(false).0,
        }
    }

    /// Overlay `overrides` on the current environment.
    ///
    /// The merged map is built once here; overrides win, nothing else from
    /// the current environment is dropped.
    pub fn with_env<I, K, V>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let merged = std::env::vars_os()
            .chain(overrides.into_iter().map(|(k, v)| (k.into(), v.into())))
            .collect();
        self.env = Some(merged);
        self
    }

    /// Run the command from `dir` instead of the current directory.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn is_running(&self) -> bool {
        lock(&self.pid).is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    fn build_command(&self) -> Result<Command, TaskError> {
        let mut command = if self.command.is_shell() {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(self.command.to_string());
            command
        } else {
            let (program, args) = self
                .command
                .argv()
                .split_first()
                .ok_or_else(|| TaskError::failed_with(self.label(), "empty command"))?;
            let mut command = Command::new(program);
            command.args(args);
            command
        };

        if let Some(env) = &self.env {
            command.env_clear().envs(env);
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(command)
    }
}

#[async_trait]
impl Work for ProcessTask {
    async fn run(&self, _ctx: &TaskContext) -> Result<(), TaskError> {
        // Requests made before this point belong to an earlier run.
        let mut stop = self.stop.subscribe();

        let mut command = self.build_command()?;
        let mut child = command
            .spawn()
            .map_err(|e| TaskError::failed_with(self.label(), format!("failed to start: {}", e)))?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(TaskError::failed_with(
                    self.label(),
                    "failed to capture process output",
                ));
            }
        };
        let group = child.id();
        *lock(&self.pid) = group;

        let output = forward_output(stdout, stderr);
        tokio::pin!(output);
        let mut output_open = true;
        let mut stop_open = true;
        let mut waited = None;

        let status = loop {
            match (output_open, waited.take()) {
                (false, Some(status)) => break status,
                (_, pending) => waited = pending,
            }
            tokio::select! {
                () = &mut output, if output_open => output_open = false,
                status = child.wait(), if waited.is_none() => waited = Some(status),
                changed = stop.changed(), if stop_open => {
                    if changed.is_err() {
                        stop_open = false;
                        continue;
                    }
                    let requested = *stop.borrow_and_update();
                    if !requested {
                        continue;
                    }
                    // The group id is not reused while a member is alive, and
                    // open output means a member is alive.
                    if let Some(pgid) = group.filter(|_| waited.is_none() || output_open) {
                        if let Err(err) = signal_group(pgid) {
                            warn!("Failed to terminate {}: {}", self.label(), err);
                        }
                    }
                }
            }
        };
        *lock(&self.pid) = None;

        let status = status
            .map_err(|e| TaskError::failed_with(self.label(), format!("wait failed: {}", e)))?;
        let code = exit_code(status);
        *lock(&self.exit_code) = Some(code);

        if code != 0 {
            return Err(TaskError::process(self.label(), code));
        }
        Ok(())
    }

    /// Ask a running invocation to signal its process group. A no-op when
    /// nothing runs.
    async fn terminate(&self) -> Result<(), TaskError> {
        self.stop.send_replace(true);
        Ok(())
    }

    fn label(&self) -> String {
        format!("Process \"{}\"", self.command)
    }
}

/// Forward both streams to the log as one sequence of lines, in arrival order.
async fn forward_output<O, E>(stdout: O, stderr: E)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut stdout = BufReader::new(stdout).split(b'\n');
    let mut stderr = BufReader::new(stderr).split(b'\n');
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        tokio::select! {
            segment = stdout.next_segment(), if stdout_open => match segment {
                Ok(Some(line)) => log_line(&line),
                _ => stdout_open = false,
            },
            segment = stderr.next_segment(), if stderr_open => match segment {
                Ok(Some(line)) => log_line(&line),
                _ => stderr_open = false,
            },
        }
    }
}

fn log_line(raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    debug!("{}", line.trim_end_matches('\r'));
}

/// Exit code, or the negated signal number for a signal-terminated child.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Send SIGTERM to every process in group `pgid`. A group that is already
/// gone is not an error.
fn signal_group(pgid: u32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!("Process group {} already exited", pgid);
        return Ok(());
    }
    Err(err)
}
