pub mod bootstrap;
pub mod cli;
pub mod error;

use std::{fs, io};

use log::info;
use tokio_util::sync::CancellationToken;
use worker::{RunConfig, Worker, WorkerErr, checkpoint::log_dir_for};

use bootstrap::{JOIN_GRACE, Launcher, join_all, resolve_world_size, spawn_workers};

pub use cli::Cli;
pub use error::OrchestratorError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Runs a whole training launch with `available` devices.
///
/// Nothing is spawned unless the requested device count can be met and the
/// net description file loads and validates. A single-rank run trains in this process; otherwise `launcher` starts one
/// worker process per rank and all of them are awaited.
///
/// # Errors
/// Returns `OrchestratorError`, whose `exit_code` tells configuration
/// problems apart from runtime failures.
pub async fn launch(
    cli: &Cli,
    available: usize,
    launcher: &dyn Launcher,
    shutdown: CancellationToken,
) -> Result<()> {
    let world_size = resolve_world_size(cli.requested_devices()?, available)?;
    info!("Device Count = {world_size}");
    check_config(cli)?;

    fs::create_dir_all(log_dir_for(&cli.file))?;

    if world_size == 1 {
        let worker = Worker::new(0, 1, cli.worker_args()).with_cancel(shutdown);
        let summary = tokio::task::spawn_blocking(move || worker.run())
            .await
            .map_err(|e| OrchestratorError::Io(io::Error::other(e)))??;
        info!(steps = summary.steps, checkpoints = summary.checkpoints.len(); "training done");
        return Ok(());
    }

    let children = spawn_workers(launcher, world_size)?;
    info!(world_size = world_size; "all workers spawned");
    join_all(children, JOIN_GRACE, shutdown).await
}

/// Loads the run configuration once up front so that every configuration
/// error surfaces here instead of in each spawned worker.
fn check_config(cli: &Cli) -> Result<()> {
    if cli.batch_size == 0 {
        return Err(OrchestratorError::InvalidConfig(
            "batch_size must be at least 1".into(),
        ));
    }

    RunConfig::from_file(&cli.file).map(drop).map_err(|e| match e {
        WorkerErr::Config(msg) => OrchestratorError::InvalidConfig(msg),
        WorkerErr::Io(e) => OrchestratorError::InvalidConfig(format!(
            "cannot read {}: {e}",
            cli.file.display()
        )),
        other => OrchestratorError::Worker(other),
    })
}
