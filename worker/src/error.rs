use std::{error::Error, fmt, io};

use ml_core::{DataError, MlError};

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    /// The net description file is unusable.
    Config(String),
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// An average was requested from a meter with no updates since its last reset.
    EmptyMeter,
    /// A full sampler pass could not fill a single batch.
    SamplerStarved {
        batch_size: usize,
        shard_len: usize,
    },
    Checkpoint(String),
    Model(MlError),
    Data(DataError),
    /// The background batch preparation stopped unexpectedly.
    LoaderStopped,
    /// A peer sent a message that does not fit the current exchange.
    Protocol {
        rank: usize,
        got: &'static str,
    },
    /// Another rank failed and told the group to stop.
    PeerAborted {
        rank: usize,
        reason: String,
    },
    /// The run was cancelled before finishing.
    Cancelled {
        epoch: usize,
        step: usize,
    },
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Config(msg) => write!(f, "invalid config: {msg}"),
            WorkerErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(f, "shape mismatch for {what}: got {got}, expected {expected}"),
            WorkerErr::EmptyMeter => write!(f, "average requested from an empty meter"),
            WorkerErr::SamplerStarved {
                batch_size,
                shard_len,
            } => write!(
                f,
                "a pass over {shard_len} items produced no batch of size {batch_size}"
            ),
            WorkerErr::Checkpoint(msg) => write!(f, "checkpoint error: {msg}"),
            WorkerErr::Model(e) => write!(f, "model error: {e}"),
            WorkerErr::Data(e) => write!(f, "data error: {e}"),
            WorkerErr::LoaderStopped => write!(f, "data loader stopped"),
            WorkerErr::Protocol { rank, got } => {
                write!(f, "unexpected message from rank {rank}: got {got}")
            }
            WorkerErr::PeerAborted { rank, reason } => {
                write!(f, "rank {rank} aborted the run: {reason}")
            }
            WorkerErr::Cancelled { epoch, step } => {
                write!(f, "cancelled at epoch {epoch}, step {step}")
            }
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Model(e) => Some(e),
            WorkerErr::Data(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlError> for WorkerErr {
    /// Group failures raised inside a model's gradient exchange come back
    /// as themselves.
    fn from(value: MlError) -> Self {
        match value {
            MlError::Sync(inner) => match inner.downcast::<WorkerErr>() {
                Ok(err) => *err,
                Err(inner) => Self::Model(MlError::Sync(inner)),
            },
            other => Self::Model(other),
        }
    }
}

impl From<DataError> for WorkerErr {
    fn from(value: DataError) -> Self {
        Self::Data(value)
    }
}

impl From<safetensors::SafeTensorError> for WorkerErr {
    fn from(value: safetensors::SafeTensorError) -> Self {
        Self::Checkpoint(value.to_string())
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
