//! prci-runner - CI job entry point
//!
//! Provisions the configured vagrant environment, runs the job's command in
//! it and tears it down.

use std::path::PathBuf;

use anyhow::bail;
use prci_runner::{logging, ProvisionedJob, RunnerConfig, Task};
use tracing::instrument::WithSubscriber;
use tracing::{error, info};

const USAGE: &str = "usage: prci-runner <config.yaml> [--no-destroy]";

#[derive(Debug)]
struct Args {
    config: PathBuf,
    no_destroy: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut config = None;
    let mut no_destroy = false;
    for arg in args {
        match arg.as_str() {
            "--no-destroy" => no_destroy = true,
            "-h" | "--help" => bail!(USAGE),
            flag if flag.starts_with('-') => bail!("unknown option {}\n{}", flag, USAGE),
            _ if config.is_some() => bail!("unexpected argument {}\n{}", arg, USAGE),
            _ => config = Some(PathBuf::from(arg)),
        }
    }
    match config {
        Some(config) => Ok(Args { config, no_destroy }),
        None => bail!(USAGE),
    }
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let mut config = RunnerConfig::load(&args.config)?;
    if args.no_destroy {
        config.no_destroy = true;
    }

    let dispatch = logging::dispatch(&config.log_file)?;
    run(config).with_subscriber(dispatch).await
}

async fn run(config: RunnerConfig) -> anyhow::Result<()> {
    info!(
        "Loaded configuration: box={} topology={:?} workdir={}",
        config.vagrant_box,
        config.topology,
        config.workdir.display()
    );

    let task = Task::new(ProvisionedJob::from_config(&config)).unbounded();
    match task.invoke().await {
        Ok(()) => {
            info!("Job finished");
            Ok(())
        }
        Err(err) => {
            error!("Job failed: {}", err);
            Err(err.into())
        }
    }
}
