//! hive - measurement run controller
//!
//! Loads the configuration, connects the ERD setup and the file serializer to a
//! job runner, queues the job files given on the command line and reports the
//! runner status until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use hive_runner::config::HiveConfig;
use hive_runner::data::FileSerializer;
use hive_runner::experiment::{Job, JobRunner, RunStatus};
use hive_runner::hardware::{DaemonClient, ErdSetup, HttpTransport};
use hive_runner::logging;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Interval between status reports in the log.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// hive - queue and run measurement jobs
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config/hive.toml")]
    config: PathBuf,

    /// Simulate every daemon request instead of talking to hardware
    #[arg(long)]
    simulate: bool,

    /// Exit once the queue is empty and no job is running
    #[arg(long)]
    exit_when_idle: bool,

    /// Job files (JSON) to queue at startup, in order
    jobs: Vec<PathBuf>,
}

fn read_job(path: &Path) -> Result<Job> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse job file {:?}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = HiveConfig::load_from(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    if args.simulate {
        config.hardware.simulate = true;
    }
    logging::init(&config.application);
    info!(
        name = %config.application.name,
        simulate = config.hardware.simulate,
        data_dir = %config.application.data_dir.display(),
        "starting"
    );

    let jobs = args
        .jobs
        .iter()
        .map(|path| read_job(path))
        .collect::<Result<Vec<_>>>()?;

    let shutdown = CancellationToken::new();
    let client = DaemonClient::from_config(Arc::new(HttpTransport::new()), &config.hardware)
        .with_cancellation(shutdown.clone());
    let setup = Arc::new(ErdSetup::from_config(client, &config.hardware));
    let serializer = Arc::new(FileSerializer::new(&config.application.data_dir));

    let (handle, runner) = JobRunner::new(setup, serializer, config.runner.clone())
        .with_shutdown(shutdown.clone())
        .spawn();

    for job in jobs {
        let id = job.id.clone();
        handle
            .enqueue(job)
            .with_context(|| format!("Failed to queue job '{}'", id))?;
    }

    let mut report = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("interrupt received, shutting down");
                break;
            }
            _ = report.tick() => {
                let snapshot = handle.snapshot();
                info!(
                    status = %serde_json::to_string(&snapshot.status)?,
                    queued = snapshot.queue.len(),
                    done = snapshot.done.len(),
                    failed = snapshot.failed.len(),
                    "runner status"
                );
                if args.exit_when_idle
                    && snapshot.queue.is_empty()
                    && snapshot.status == RunStatus::Idle
                {
                    info!("queue drained, exiting");
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    runner.await.context("Runner task failed")?;
    Ok(())
}
