use std::{fmt, io};

use worker::WorkerErr;

/// Exit code for configuration errors, including too few devices.
pub const EXIT_CONFIG: u8 = 1;
/// Exit code for failures once training has started.
pub const EXIT_RUNTIME: u8 = 2;

/// All errors that can occur while launching a run.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Invalid configuration, caught before anything is spawned.
    InvalidConfig(String),
    /// More devices were requested than exist.
    InsufficientDevices { requested: usize, available: usize },
    /// A worker process could not be started.
    Spawn { rank: usize, source: io::Error },
    /// A worker process exited unsuccessfully; `code` is `None` if it was killed.
    WorkerFailed { rank: usize, code: Option<i32> },
    /// The in-process worker of a single-rank run failed.
    Worker(WorkerErr),
    /// The launch was interrupted and the workers were killed.
    Interrupted,
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

impl OrchestratorError {
    /// Process exit code reporting this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidConfig(_) | Self::InsufficientDevices { .. } => EXIT_CONFIG,
            Self::Worker(WorkerErr::Config(_)) => EXIT_CONFIG,
            _ => EXIT_RUNTIME,
        }
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::InsufficientDevices {
                requested,
                available,
            } => write!(
                f,
                "do not have enough devices for training: requested {requested}, found {available}"
            ),
            Self::Spawn { rank, source } => write!(f, "failed to spawn rank {rank}: {source}"),
            Self::WorkerFailed {
                rank,
                code: Some(code),
            } => write!(f, "rank {rank} exited with code {code}"),
            Self::WorkerFailed { rank, code: None } => {
                write!(f, "rank {rank} was terminated by a signal")
            }
            Self::Worker(e) => write!(f, "worker error: {e}"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::Worker(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestratorError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WorkerErr> for OrchestratorError {
    fn from(e: WorkerErr) -> Self {
        Self::Worker(e)
    }
}
