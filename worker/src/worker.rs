use std::{fs, path::PathBuf, sync::Arc};

use log::{error, info};
use ml_core::{
    BoxStatsNet, Dataset, GradientSync, LocalSync, ManifestDataset, Model, ModelOptions,
    PadCollator,
};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use tokio_util::sync::CancellationToken;

use crate::{
    Result, RunConfig, WorkerErr,
    checkpoint::{self, CheckpointWriter},
    config::render_table,
    data::{DataLoader, ShardSpec, build_sampler},
    group::{GroupSync, ProcessGroup, RENDEZVOUS_ADDR},
    report::LogReporter,
    train_loop::{RunSummary, TrainLoop},
};

/// Probability of mirroring a training image.
const FLIP_PROB: f64 = 0.5;
const BACKBONE: &str = "backbone";

/// Command line options every rank receives.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerArgs {
    /// Net description file holding the run configuration.
    pub file: PathBuf,
    /// Pretrained backbone weights.
    pub weight_file: Option<PathBuf>,
    pub batch_size: usize,
    pub dataset_dir: PathBuf,
    pub enable_sublinear: bool,
}

/// One rank of a training run.
pub struct Worker {
    rank: usize,
    world_size: usize,
    args: WorkerArgs,
    rendezvous: String,
    log_dir: PathBuf,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(rank: usize, world_size: usize, args: WorkerArgs) -> Self {
        let log_dir = checkpoint::log_dir_for(&args.file);
        Self {
            rank,
            world_size,
            args,
            rendezvous: RENDEZVOUS_ADDR.to_string(),
            log_dir,
            cancel: CancellationToken::new(),
        }
    }

    /// Address where rank 0 listens for its peers.
    pub fn with_rendezvous<S: Into<String>>(mut self, addr: S) -> Self {
        self.rendezvous = addr.into();
        self
    }

    /// Where rank 0 writes its checkpoints, `log-of-<name>` by default.
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Joins the process group if there is more than one rank, trains, and
    /// waits for every peer before returning.
    ///
    /// On failure the rest of the group is told to abort so nobody hangs in
    /// a collective.
    ///
    /// # Errors
    /// Returns the first error this rank hit, or `WorkerErr::PeerAborted`
    /// if another rank failed first.
    pub fn run(self) -> Result<RunSummary> {
        let group = match self.world_size {
            0 | 1 => None,
            n => {
                let group = ProcessGroup::init(self.rendezvous.as_str(), self.rank, n)?;
                info!("Init process group for rank {} done", self.rank);
                Some(Arc::new(Mutex::new(group)))
            }
        };

        let result = self.train(group.clone());

        if let Some(group) = group {
            let mut group = group.lock();
            match &result {
                Ok(_) => group.barrier()?,
                Err(WorkerErr::PeerAborted { .. }) => {}
                Err(e) => group.abort(&e.to_string()),
            }
        }

        if let Err(e) = &result {
            error!(rank = self.rank; "training failed: {e}");
        }
        result
    }

    fn train(&self, group: Option<Arc<Mutex<ProcessGroup>>>) -> Result<RunSummary> {
        let Self {
            rank,
            world_size,
            args,
            log_dir,
            ..
        } = self;
        let (rank, world_size) = (*rank, (*world_size).max(1));

        let cfg = RunConfig::from_file(&args.file)?;
        if rank == 0 {
            info!("run configuration:\n{}", render_table(&cfg.describe()));
        }

        let sync: Box<dyn GradientSync> = match group {
            Some(group) => Box::new(GroupSync(group)),
            None => Box::new(LocalSync),
        };
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut model = BoxStatsNet::new(
            cfg.hidden_size,
            cfg.train_image_max_size,
            cfg.momentum,
            cfg.weight_decay,
            &mut rng,
            sync,
            ModelOptions {
                sublinear: args.enable_sublinear,
            },
        )?;

        if let Some(path) = &args.weight_file {
            let weights = checkpoint::load_weights_file(path)?;
            model.load_weights(BACKBONE, &weights)?;
            info!(tensors = weights.len(); "loaded {} weights from {}", BACKBONE, path.display());
        }

        if rank == 0 {
            info!("Prepare dataset");
        }
        let dataset = load_dataset(&cfg, args)?;
        let sampler = build_sampler(
            dataset.as_ref(),
            args.batch_size,
            &cfg.aspect_grouping,
            ShardSpec::new(rank, world_size)?,
            cfg.seed,
        )?;
        let collator = Arc::new(PadCollator::new(
            cfg.train_image_short_size.clone(),
            cfg.train_image_max_size,
            FLIP_PROB,
        )?);
        let mut loader = DataLoader::new(
            sampler,
            dataset,
            collator,
            cfg.num_workers,
            cfg.prefetch,
            cfg.seed ^ ((rank as u64) << 32),
        )?;

        let mut train_loop = TrainLoop::new(&cfg, rank, world_size, args.batch_size)?
            .with_cancel(self.cancel.clone());
        if rank == 0 {
            fs::create_dir_all(log_dir)?;
            train_loop = train_loop
                .with_reporter(Box::new(LogReporter))
                .with_checkpoints(CheckpointWriter::new(log_dir.clone()));
        }

        train_loop.run(&mut model, &mut loader)
    }
}

/// Opens the dataset named by `cfg` under the dataset directory.
fn load_dataset(cfg: &RunConfig, args: &WorkerArgs) -> Result<Arc<dyn Dataset>> {
    let base = args.dataset_dir.join(&cfg.train_dataset.name);
    let ann_file = base.join(&cfg.train_dataset.ann_file);
    info!(
        "dataset {} with images under {}",
        cfg.train_dataset.name,
        base.join(&cfg.train_dataset.root).display()
    );

    Ok(Arc::new(ManifestDataset::load(ann_file)?))
}
