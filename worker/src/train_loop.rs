use std::{path::PathBuf, time::Instant};

use log::{debug, info, warn};
use ml_core::Model;
use tokio_util::sync::CancellationToken;

use crate::{
    Result, WorkerErr,
    checkpoint::CheckpointWriter,
    config::RunConfig,
    data::BatchSource,
    metrics::AverageMeter,
    report::{Reporter, StepReport},
    schedule::learning_rate,
};

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub epochs: usize,
    pub steps: usize,
    pub checkpoints: Vec<PathBuf>,
}

/// Drives the epoch/step loop of one rank.
///
/// Every rank executes the same number of steps with the same learning
/// rates. Only the rank given a reporter logs and only the rank given a
/// checkpoint writer persists state.
pub struct TrainLoop<'a> {
    cfg: &'a RunConfig,
    rank: usize,
    world_size: usize,
    batch_size: usize,
    reporter: Option<Box<dyn Reporter>>,
    checkpoints: Option<CheckpointWriter>,
    cancel: CancellationToken,
}

impl<'a> TrainLoop<'a> {
    /// # Errors
    /// Returns `WorkerErr::Config` if `cfg` does not validate or on a zero
    /// batch size or world size.
    pub fn new(cfg: &'a RunConfig, rank: usize, world_size: usize, batch_size: usize) -> Result<Self> {
        cfg.validate()?;
        if batch_size == 0 || world_size == 0 {
            return Err(WorkerErr::Config(
                "batch_size and world_size must be at least 1".into(),
            ));
        }

        Ok(Self {
            cfg,
            rank,
            world_size,
            batch_size,
            reporter: None,
            checkpoints: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_checkpoints(mut self, writer: CheckpointWriter) -> Self {
        self.checkpoints = Some(writer);
        self
    }

    /// Stops the run at the next step boundary once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Steps per epoch; leftover images of the epoch budget are skipped.
    #[inline]
    pub fn total_steps(&self) -> usize {
        self.cfg.nr_images_epoch / (self.batch_size * self.world_size)
    }

    /// Trains `model` on batches from `source` for every configured epoch.
    ///
    /// # Errors
    /// Fails on the first shape, data, model or I/O error, or with
    /// `WorkerErr::Cancelled` if the run is cancelled. A cancelled epoch
    /// leaves no checkpoint.
    pub fn run(&mut self, model: &mut dyn Model, source: &mut dyn BatchSource) -> Result<RunSummary> {
        let num_losses = self.cfg.losses_keys.len();
        if model.loss_names().len() != num_losses {
            return Err(WorkerErr::ShapeMismatch {
                what: "losses_keys",
                got: num_losses,
                expected: model.loss_names().len(),
            });
        }

        let total_steps = self.total_steps();
        if total_steps == 0 {
            warn!(
                nr_images_epoch = self.cfg.nr_images_epoch;
                "epoch budget is smaller than one global batch, no step will run"
            );
        }
        info!(
            rank = self.rank, epochs = self.cfg.max_epoch, steps = total_steps;
            "start training"
        );

        let mut summary = RunSummary::default();
        let mut meter = AverageMeter::new(num_losses);
        let mut time_meter = AverageMeter::new(2);

        for epoch in 0..self.cfg.max_epoch {
            for step in 0..total_steps {
                if self.cancel.is_cancelled() {
                    info!(epoch = epoch, step = step; "training cancelled");
                    return Err(WorkerErr::Cancelled { epoch, step });
                }

                let lr = learning_rate(epoch, step, self.world_size, self.batch_size, self.cfg);
                model
                    .param_groups_mut()
                    .iter_mut()
                    .for_each(|group| group.lr = lr);

                let data_tik = Instant::now();
                let batch = source.next_batch()?;
                let data_time = data_tik.elapsed().as_secs_f32();

                if batch.len() != self.batch_size {
                    return Err(WorkerErr::ShapeMismatch {
                        what: "batch",
                        got: batch.len(),
                        expected: self.batch_size,
                    });
                }

                let tik = Instant::now();
                model.zero_grad();
                let losses = model.propagate(&batch)?;
                model.update()?;
                let train_time = tik.elapsed().as_secs_f32();

                meter.update(&losses)?;
                time_meter.update(&[train_time, data_time])?;
                summary.steps += 1;
                debug!(epoch = epoch, step = step, bucket = batch.bucket; "step done");

                if step % self.cfg.log_interval == 0 {
                    if let Some(reporter) = self.reporter.as_mut() {
                        let averages = meter.average()?;
                        let times = time_meter.average()?;
                        let report = StepReport {
                            epoch,
                            step,
                            total_steps,
                            lr,
                            losses: self
                                .cfg
                                .losses_keys
                                .iter()
                                .map(String::as_str)
                                .zip(averages)
                                .collect(),
                            train_time: times[0],
                            data_time: times[1],
                        };
                        reporter.report(&report);
                    }
                    meter.reset();
                    time_meter.reset();
                }
            }

            if let Some(writer) = &self.checkpoints {
                let path = writer.write(epoch, &model.state_dict())?;
                summary.checkpoints.push(path);
            }
            summary.epochs += 1;
        }

        info!(rank = self.rank, steps = summary.steps; "training finished");
        Ok(summary)
    }
}
