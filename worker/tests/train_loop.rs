use std::{
    fs,
    sync::{Arc, Mutex},
};

use ml_core::{Batch, MlError, Model, ParamGroup, StateDict, Tensor};
use tokio_util::sync::CancellationToken;
use worker::{
    RunConfig, TrainLoop, WorkerErr,
    checkpoint::{CheckpointWriter, read_checkpoint},
    config::DatasetConfig,
    data::BatchSource,
    report::{Reporter, StepReport},
};

fn config(nr_images_epoch: usize, max_epoch: usize, log_interval: usize) -> RunConfig {
    RunConfig {
        basic_lr: 0.01,
        momentum: 0.9,
        weight_decay: 1e-4,
        lr_decay_rate: 0.1,
        lr_decay_stages: vec![1],
        warm_iters: 0,
        max_epoch,
        nr_images_epoch,
        log_interval,
        losses_keys: vec!["total_loss".into(), "aux_loss".into()],
        aspect_grouping: vec![1.0],
        seed: 0,
        num_workers: 1,
        prefetch: 1,
        train_dataset: DatasetConfig {
            name: "toy".into(),
            root: "images".into(),
            ann_file: "ann.json".into(),
        },
        train_image_short_size: vec![800],
        train_image_max_size: 1333,
        hidden_size: 4,
    }
}

/// Counts calls and reports a constant loss pair.
struct CountingModel {
    groups: Vec<ParamGroup>,
    steps: usize,
    lrs: Vec<f64>,
    losses: Vec<f32>,
}

impl CountingModel {
    fn new(losses: Vec<f32>) -> Self {
        Self {
            groups: vec![ParamGroup::new(0.0, vec!["w".into()]), ParamGroup::new(0.0, vec![])],
            steps: 0,
            lrs: Vec::new(),
            losses,
        }
    }
}

impl Model for CountingModel {
    fn loss_names(&self) -> &[&'static str] {
        &["total_loss", "aux_loss"]
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn zero_grad(&mut self) {}

    fn propagate(&mut self, batch: &Batch) -> Result<Vec<f32>, MlError> {
        assert!(!batch.is_empty());
        assert!(self.groups.iter().all(|g| g.lr == self.groups[0].lr));
        self.lrs.push(self.groups[0].lr);
        Ok(self.losses.clone())
    }

    fn update(&mut self) -> Result<(), MlError> {
        self.steps += 1;
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        StateDict::from([("w".into(), Tensor::new(vec![1], vec![self.steps as f32]))])
    }

    fn load_state_dict(&mut self, _state: &StateDict) -> Result<(), MlError> {
        Ok(())
    }

    fn load_weights(&mut self, _prefix: &str, _weights: &StateDict) -> Result<(), MlError> {
        Ok(())
    }
}

/// Yields empty-image batches of a fixed size forever.
struct FixedSource {
    size: usize,
    pulled: usize,
}

impl BatchSource for FixedSource {
    fn next_batch(&mut self) -> worker::Result<Batch> {
        let start = self.pulled * self.size;
        self.pulled += 1;
        Ok(Batch {
            indices: (start..start + self.size).collect(),
            bucket: 0,
            data_shape: [self.size, 3, 8, 8],
            im_info: vec![[8.0, 8.0, 8.0, 8.0, 0.0]; self.size],
            gt_boxes: vec![vec![[0.0; 5]]; self.size],
        })
    }
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Reporter for Recorder {
    fn report(&mut self, report: &StepReport<'_>) {
        self.0.lock().unwrap().push(report.to_string());
    }
}

#[test]
fn single_rank_epoch_runs_five_steps_and_one_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(10, 1, 1);
    let mut model = CountingModel::new(vec![1.0, 0.5]);
    let mut source = FixedSource { size: 2, pulled: 0 };

    let summary = TrainLoop::new(&cfg, 0, 1, 2)
        .unwrap()
        .with_checkpoints(CheckpointWriter::new(dir.path()))
        .run(&mut model, &mut source)
        .unwrap();

    assert_eq!(summary.steps, 5);
    assert_eq!(model.steps, 5);
    assert_eq!(source.pulled, 5);

    let files: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(files, vec!["epoch_0.safetensors".to_string()]);

    let (epoch, state) = read_checkpoint(&summary.checkpoints[0]).unwrap();
    assert_eq!(epoch, 0);
    assert_eq!(state["w"].data, vec![5.0]);
}

#[test]
fn remainder_images_are_skipped() {
    let cfg = config(11, 1, 100);
    let mut model = CountingModel::new(vec![1.0, 0.5]);
    let mut source = FixedSource { size: 2, pulled: 0 };

    let summary = TrainLoop::new(&cfg, 1, 2, 2)
        .unwrap()
        .run(&mut model, &mut source)
        .unwrap();

    // 11 / (2 * 2)
    assert_eq!(summary.steps, 2);
    assert!(summary.checkpoints.is_empty());
}

#[test]
fn learning_rate_follows_the_schedule_per_epoch() {
    let cfg = config(4, 3, 100);
    let mut model = CountingModel::new(vec![1.0, 0.5]);
    let mut source = FixedSource { size: 2, pulled: 0 };

    TrainLoop::new(&cfg, 0, 1, 2)
        .unwrap()
        .run(&mut model, &mut source)
        .unwrap();

    let expected = [0.02, 0.02, 0.002, 0.002, 0.002, 0.002];
    assert_eq!(model.lrs.len(), expected.len());
    for (got, want) in model.lrs.iter().zip(expected) {
        assert!((got - want).abs() < 1e-12, "{got} != {want}");
    }
}

#[test]
fn reports_every_log_interval_steps() {
    let cfg = config(10, 2, 2);
    let recorder = Recorder::default();
    let mut model = CountingModel::new(vec![2.0, 0.25]);
    let mut source = FixedSource { size: 2, pulled: 0 };

    TrainLoop::new(&cfg, 0, 1, 2)
        .unwrap()
        .with_reporter(Box::new(recorder.clone()))
        .run(&mut model, &mut source)
        .unwrap();

    let lines = recorder.0.lock().unwrap();
    // steps 0, 2 and 4 of each epoch
    assert_eq!(lines.len(), 6);
    assert!(lines[0].starts_with("e0, 0/5, lr:0.020000, total_loss:2.000000, aux_loss:0.250000, train_time:"));
    assert!(lines[1].starts_with("e0, 2/5, "));
    assert!(lines[3].starts_with("e1, 0/5, lr:0.002000, "));
}

#[test]
fn cancellation_stops_before_the_next_step() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(10, 1, 1);
    let token = CancellationToken::new();
    token.cancel();

    let mut model = CountingModel::new(vec![1.0, 0.5]);
    let mut source = FixedSource { size: 2, pulled: 0 };

    let err = TrainLoop::new(&cfg, 0, 1, 2)
        .unwrap()
        .with_checkpoints(CheckpointWriter::new(dir.path()))
        .with_cancel(token)
        .run(&mut model, &mut source)
        .unwrap_err();

    assert!(matches!(err, WorkerErr::Cancelled { epoch: 0, step: 0 }));
    assert_eq!(model.steps, 0);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn wrong_loss_count_is_a_shape_error() {
    let cfg = config(10, 1, 1);
    let mut model = CountingModel::new(vec![1.0, 0.5, 0.1]);
    let mut source = FixedSource { size: 2, pulled: 0 };

    let err = TrainLoop::new(&cfg, 0, 1, 2)
        .unwrap()
        .run(&mut model, &mut source)
        .unwrap_err();

    assert!(matches!(
        err,
        WorkerErr::ShapeMismatch {
            got: 3,
            expected: 2,
            ..
        }
    ));
}

#[test]
fn short_batch_is_rejected() {
    let cfg = config(10, 1, 1);
    let mut model = CountingModel::new(vec![1.0, 0.5]);
    let mut source = FixedSource { size: 1, pulled: 0 };

    let err = TrainLoop::new(&cfg, 0, 1, 2)
        .unwrap()
        .run(&mut model, &mut source)
        .unwrap_err();

    assert!(matches!(err, WorkerErr::ShapeMismatch { what: "batch", .. }));
    assert_eq!(model.steps, 0);
}

#[test]
fn unwritable_checkpoint_dir_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(2, 1, 1);
    let mut model = CountingModel::new(vec![1.0, 0.5]);
    let mut source = FixedSource { size: 2, pulled: 0 };

    let err = TrainLoop::new(&cfg, 0, 1, 2)
        .unwrap()
        .with_checkpoints(CheckpointWriter::new(dir.path().join("gone")))
        .run(&mut model, &mut source)
        .unwrap_err();

    assert!(matches!(err, WorkerErr::Io(_)));
}

#[test]
fn run_config_from_file_drives_a_loop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("net.json");
    let cfg = config(6, 1, 1);
    fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();

    let loaded = RunConfig::from_file(&path).unwrap();
    assert_eq!(loaded, cfg);

    let mut model = CountingModel::new(vec![1.0, 0.5]);
    let mut source = FixedSource { size: 3, pulled: 0 };
    let summary = TrainLoop::new(&loaded, 0, 1, 3)
        .unwrap()
        .run(&mut model, &mut source)
        .unwrap();
    assert_eq!(summary.steps, 2);
}

#[test]
fn zero_log_interval_is_a_config_error() {
    let cfg = config(6, 1, 0);
    let err = TrainLoop::new(&cfg, 0, 1, 2).err().unwrap();
    assert!(matches!(err, WorkerErr::Config(msg) if msg.contains("log_interval")));
}
