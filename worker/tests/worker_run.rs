use std::{fs, net::TcpListener, path::Path, thread};

use serde_json::json;
use worker::{Worker, WorkerArgs, WorkerErr, checkpoint::read_checkpoint};

/// Writes a toy COCO manifest under `<root>/toy/ann.json` and a net file
/// training `max_epoch` epochs of `nr_images_epoch` images.
fn write_run(root: &Path, nr_images_epoch: usize, max_epoch: usize) -> WorkerArgs {
    let images: Vec<_> = (0..8)
        .map(|id| json!({"id": id, "height": 40 + id, "width": 64}))
        .collect();
    let annotations: Vec<_> = (0..8)
        .map(|id| json!({"image_id": id, "bbox": [2.0, 3.0, 10.0, 12.0], "category_id": 1}))
        .collect();

    let dataset_dir = root.join("datasets");
    fs::create_dir_all(dataset_dir.join("toy")).unwrap();
    fs::write(
        dataset_dir.join("toy").join("ann.json"),
        json!({"images": images, "annotations": annotations}).to_string(),
    )
    .unwrap();

    let net = json!({
        "basic_lr": 0.001,
        "momentum": 0.9,
        "weight_decay": 0.0001,
        "lr_decay_rate": 0.1,
        "lr_decay_stages": [1],
        "warm_iters": 0,
        "max_epoch": max_epoch,
        "nr_images_epoch": nr_images_epoch,
        "log_interval": 1,
        "losses_keys": ["total_loss", "box_loss", "count_loss"],
        "num_workers": 1,
        "prefetch": 1,
        "train_image_short_size": [32],
        "train_image_max_size": 64,
        "hidden_size": 4,
        "train_dataset": {"name": "toy", "root": "images", "ann_file": "ann.json"}
    });
    let file = root.join("toy_net.json");
    fs::write(&file, net.to_string()).unwrap();

    WorkerArgs {
        file,
        weight_file: None,
        batch_size: 2,
        dataset_dir,
        enable_sublinear: false,
    }
}

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

#[test]
fn single_rank_trains_and_checkpoints_every_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let args = write_run(dir.path(), 10, 2);
    let log_dir = dir.path().join("log-of-toy_net");

    let summary = Worker::new(0, 1, args).with_log_dir(&log_dir).run().unwrap();

    assert_eq!(summary.epochs, 2);
    assert_eq!(summary.steps, 10);
    assert_eq!(
        summary.checkpoints,
        vec![log_dir.join("epoch_0.safetensors"), log_dir.join("epoch_1.safetensors")]
    );

    let (epoch, state) = read_checkpoint(&summary.checkpoints[1]).unwrap();
    assert_eq!(epoch, 1);
    assert!(state.keys().any(|k| k.starts_with("backbone")));
}

#[test]
fn two_ranks_step_together_and_only_rank_zero_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let args = write_run(dir.path(), 8, 2);
    let log_dir = dir.path().join("log-of-toy_net");
    let addr = free_addr();

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let worker = Worker::new(rank, 2, args.clone())
                .with_rendezvous(addr.clone())
                .with_log_dir(&log_dir);
            thread::spawn(move || worker.run())
        })
        .collect();
    let summaries: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    assert_eq!(summaries[0].steps, 4);
    assert_eq!(summaries[1].steps, 4);
    assert_eq!(summaries[0].checkpoints.len(), 2);
    assert!(summaries[1].checkpoints.is_empty());
}

#[test]
fn missing_manifest_is_a_data_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut args = write_run(dir.path(), 4, 1);
    args.dataset_dir = dir.path().join("nowhere");

    let err = Worker::new(0, 1, args)
        .with_log_dir(dir.path().join("logs"))
        .run()
        .unwrap_err();

    assert!(matches!(err, WorkerErr::Data(_)));
}
