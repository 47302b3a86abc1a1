use std::{ffi::OsString, path::PathBuf};

use clap::Parser;
use worker::WorkerArgs;

use crate::{OrchestratorError, Result};

/// Multi-process detection training launcher.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "orchestrator")]
#[command(about = "Trains a detector with one worker process per device", long_about = None)]
pub struct Cli {
    /// Net description file
    #[arg(short = 'f', long = "file", default_value = "net.json")]
    pub file: PathBuf,

    /// Pretrained weights loaded into the backbone
    #[arg(short = 'w', long = "weight_file")]
    pub weight_file: Option<PathBuf>,

    /// Total number of devices for training, -1 for all of them
    #[arg(short = 'n', long = "ngpus", default_value_t = -1, allow_negative_numbers = true)]
    pub ngpus: i64,

    /// Batch size of each worker
    #[arg(short = 'b', long = "batch_size", default_value_t = 2)]
    pub batch_size: usize,

    #[arg(short = 'd', long = "dataset_dir", default_value = "/data/datasets")]
    pub dataset_dir: PathBuf,

    #[arg(long = "enable_sublinear")]
    pub enable_sublinear: bool,

    /// Set when this process is a spawned worker.
    #[arg(long = "rank", hide = true, requires = "world_size")]
    pub rank: Option<usize>,

    #[arg(long = "world_size", hide = true, requires = "rank")]
    pub world_size: Option<usize>,
}

impl Cli {
    /// The requested device count, `None` meaning every available device.
    ///
    /// # Errors
    /// Returns `OrchestratorError::InvalidConfig` for negative values other than -1.
    pub fn requested_devices(&self) -> Result<Option<usize>> {
        match self.ngpus {
            -1 => Ok(None),
            n if n < 0 => Err(OrchestratorError::InvalidConfig(format!(
                "ngpus must be -1 or a device count, got {n}"
            ))),
            n => usize::try_from(n)
                .map(Some)
                .map_err(|e| OrchestratorError::InvalidConfig(e.to_string())),
        }
    }

    pub fn worker_args(&self) -> WorkerArgs {
        WorkerArgs {
            file: self.file.clone(),
            weight_file: self.weight_file.clone(),
            batch_size: self.batch_size,
            dataset_dir: self.dataset_dir.clone(),
            enable_sublinear: self.enable_sublinear,
        }
    }

    /// Arguments re-invoking this executable as worker `rank`.
    pub fn worker_argv(&self, rank: usize, world_size: usize) -> Vec<OsString> {
        let mut argv: Vec<OsString> = vec![
            "--file".into(),
            self.file.clone().into(),
            "--batch_size".into(),
            self.batch_size.to_string().into(),
            "--dataset_dir".into(),
            self.dataset_dir.clone().into(),
        ];
        if let Some(weights) = &self.weight_file {
            argv.push("--weight_file".into());
            argv.push(weights.clone().into());
        }
        if self.enable_sublinear {
            argv.push("--enable_sublinear".into());
        }
        argv.extend([
            "--rank".into(),
            rank.to_string().into(),
            "--world_size".into(),
            world_size.to_string().into(),
        ]);
        argv
    }
}
