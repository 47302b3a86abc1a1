use std::process::ExitCode;

use clap::Parser;
use log::error;
use tokio::{runtime, signal};
use tokio_util::sync::CancellationToken;
use worker::Worker;

use orchestrator::{
    Cli, OrchestratorError, Result,
    bootstrap::{SelfLauncher, device_count},
    launch,
};

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match (cli.rank, cli.world_size) {
        (Some(rank), Some(world_size)) => run_worker(&cli, rank, world_size),
        _ => run_launcher(cli),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Spawns a task cancelling `token` on Ctrl-C.
fn cancel_on_ctrl_c(rt: &runtime::Runtime, token: CancellationToken) {
    rt.spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

fn run_launcher(cli: Cli) -> Result<()> {
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(&rt, shutdown.clone());

    let launcher = SelfLauncher::new(cli.clone())?;
    rt.block_on(launch(&cli, device_count(), &launcher, shutdown))
}

/// Worker mode: this process is one rank spawned by the launcher.
fn run_worker(cli: &Cli, rank: usize, world_size: usize) -> Result<()> {
    // The worker blocks this thread; the signal listener lives on its own runtime.
    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&rt, cancel.clone());

    Worker::new(rank, world_size, cli.worker_args())
        .with_cancel(cancel)
        .run()
        .map(|_| ())
        .map_err(OrchestratorError::from)
}
