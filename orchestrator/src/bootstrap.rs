use std::{
    env, io, num::NonZeroUsize, path::PathBuf, process::ExitStatus, thread, time::Duration,
};

use log::{debug, error, info, warn};
use tokio::{
    process::{Child, Command},
    task::JoinSet,
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{OrchestratorError, Result, cli::Cli};

/// How long the surviving workers get to exit on their own after a peer failed.
pub const JOIN_GRACE: Duration = Duration::from_secs(30);
/// Environment variable overriding the detected device count.
pub const DEVICE_COUNT_VAR: &str = "DEVICE_COUNT";

/// Number of compute devices available to this run.
pub fn device_count() -> usize {
    if let Ok(value) = env::var(DEVICE_COUNT_VAR) {
        match value.trim().parse() {
            Ok(n) => return n,
            Err(e) => warn!("ignoring {DEVICE_COUNT_VAR}={value}: {e}"),
        }
    }

    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Picks the world size for `requested` devices out of `available`.
///
/// # Errors
/// Returns `OrchestratorError::InsufficientDevices` if more devices are
/// requested than exist, or if there are none at all.
pub fn resolve_world_size(requested: Option<usize>, available: usize) -> Result<usize> {
    match requested {
        _ if available == 0 => Err(OrchestratorError::InsufficientDevices {
            requested: requested.unwrap_or(1),
            available,
        }),
        None => Ok(available),
        Some(0) => Err(OrchestratorError::InvalidConfig(
            "ngpus must be at least 1".into(),
        )),
        Some(n) if n > available => Err(OrchestratorError::InsufficientDevices {
            requested: n,
            available,
        }),
        Some(n) => Ok(n),
    }
}

/// Builds the command that starts one worker process.
pub trait Launcher: Send + Sync {
    fn command(&self, rank: usize, world_size: usize) -> io::Result<Command>;
}

/// Re-invokes the running executable as a worker.
#[derive(Debug, Clone)]
pub struct SelfLauncher {
    exe: PathBuf,
    cli: Cli,
}

impl SelfLauncher {
    pub fn new(cli: Cli) -> io::Result<Self> {
        Ok(Self {
            exe: env::current_exe()?,
            cli,
        })
    }
}

impl Launcher for SelfLauncher {
    fn command(&self, rank: usize, world_size: usize) -> io::Result<Command> {
        let mut cmd = Command::new(&self.exe);
        cmd.args(self.cli.worker_argv(rank, world_size));
        Ok(cmd)
    }
}

/// Starts one process per rank.
///
/// Children are killed if their handle is dropped, so a failed spawn never
/// leaves a partial group running.
pub fn spawn_workers(launcher: &dyn Launcher, world_size: usize) -> Result<Vec<(usize, Child)>> {
    let mut children = Vec::with_capacity(world_size);

    for rank in 0..world_size {
        let child = launcher
            .command(rank, world_size)
            .and_then(|mut cmd| cmd.kill_on_drop(true).spawn())
            .map_err(|source| OrchestratorError::Spawn { rank, source })?;

        debug!(rank = rank, pid = child.id().unwrap_or_default(); "worker spawned");
        children.push((rank, child));
    }

    Ok(children)
}

/// Waits for every child, stopping the rest once one fails.
///
/// After the first unsuccessful exit the survivors get `grace` to finish on
/// their own and are killed afterwards. Cancelling `shutdown` kills them
/// right away.
///
/// # Errors
/// Returns the first failure observed, or `OrchestratorError::Interrupted`.
pub async fn join_all(
    children: Vec<(usize, Child)>,
    grace: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let kill = CancellationToken::new();
    let mut waits = JoinSet::new();

    for (rank, mut child) in children {
        let kill = kill.clone();
        waits.spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        debug!(rank = rank; "kill failed: {e}");
                    }
                    child.wait().await
                }
            };
            (rank, status)
        });
    }

    let mut failure: Option<OrchestratorError> = None;
    let mut grace_timer = None;

    loop {
        tokio::select! {
            joined = waits.join_next() => {
                let Some(joined) = joined else { break };
                let err = match joined {
                    Ok((rank, Ok(status))) if status.success() => {
                        info!(rank = rank; "worker finished");
                        continue;
                    }
                    Ok((rank, Ok(status))) => worker_failed(rank, status),
                    Ok((rank, Err(e))) => {
                        warn!(rank = rank; "waiting for worker failed");
                        OrchestratorError::Io(e)
                    }
                    Err(e) => OrchestratorError::Io(io::Error::other(e)),
                };

                if failure.is_none() {
                    error!("{err}, stopping the remaining workers within {grace:?}");
                    let kill = kill.clone();
                    grace_timer = Some(tokio::spawn(async move {
                        time::sleep(grace).await;
                        kill.cancel();
                    }));
                    failure = Some(err);
                } else {
                    debug!("{err}");
                }
            }
            _ = shutdown.cancelled(), if !kill.is_cancelled() => {
                warn!("interrupted, killing all workers");
                kill.cancel();
                failure.get_or_insert(OrchestratorError::Interrupted);
            }
        }
    }

    if let Some(timer) = grace_timer {
        timer.abort();
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn worker_failed(rank: usize, status: ExitStatus) -> OrchestratorError {
    OrchestratorError::WorkerFailed {
        rank,
        code: status.code(),
    }
}
