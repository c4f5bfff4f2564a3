//! Logging setup.
//!
//! The runner builds one [`Dispatch`] at start-up and attaches it to the root
//! future; nothing installs a global default subscriber. Task execution
//! contexts inherit the dispatch when they are spawned.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use tracing::Dispatch;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "prci_runner=debug";

/// Build the dispatch writing to stderr and to `log_file` (truncated).
pub fn dispatch(log_file: &Path) -> anyhow::Result<Dispatch> {
    let file = File::create(log_file)
        .with_context(|| format!("Failed to create log file {}", log_file.display()))?;

    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        );

    Ok(Dispatch::new(subscriber))
}
