use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender},
    },
    thread::{self, JoinHandle},
};

use log::{debug, warn};
use ml_core::{Batch, Collator, Dataset};
use rand::{SeedableRng, rngs::StdRng};

use super::{IndexBatch, InfiniteSampler};
use crate::{Result, WorkerErr};

/// Where the training loop pulls its batches from.
pub trait BatchSource: Send {
    /// Blocks until the next batch is ready.
    fn next_batch(&mut self) -> Result<Batch>;
}

/// Prepares batches in the background.
///
/// A dispatcher thread owns the sampler and hands index batches to
/// `num_workers` collation threads in turn. Each worker loads and collates
/// its batches into its own bounded channel and the consumer reads the
/// channels in the same order, so the batch sequence does not depend on
/// thread timing.
pub struct DataLoader {
    outputs: Vec<Receiver<Result<Batch>>>,
    next: usize,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl DataLoader {
    /// Starts the loader threads.
    ///
    /// # Args
    /// * `sampler` - Source of index batches, moved to the dispatcher.
    /// * `dataset` - Records shared by the collation workers.
    /// * `collator` - Turns records into model batches.
    /// * `num_workers` - Number of collation threads, at least 1.
    /// * `prefetch` - Batches each worker may hold ready ahead of the consumer.
    /// * `seed` - Seeds the per-worker augmentation generators.
    ///
    /// # Errors
    /// Returns `WorkerErr::Config` on a zero worker or prefetch count and
    /// `WorkerErr::Io` if a thread cannot be spawned.
    pub fn new(
        sampler: InfiniteSampler,
        dataset: Arc<dyn Dataset>,
        collator: Arc<dyn Collator>,
        num_workers: usize,
        prefetch: usize,
        seed: u64,
    ) -> Result<Self> {
        if num_workers == 0 || prefetch == 0 {
            return Err(WorkerErr::Config(
                "num_workers and prefetch must be at least 1".into(),
            ));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut loader = Self {
            outputs: Vec::with_capacity(num_workers),
            next: 0,
            stop: Arc::clone(&stop),
            threads: Vec::with_capacity(num_workers + 1),
        };

        let mut jobs = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let (job_tx, job_rx) = mpsc::sync_channel::<Result<IndexBatch>>(prefetch);
            let (out_tx, out_rx) = mpsc::sync_channel(prefetch);
            let dataset = Arc::clone(&dataset);
            let collator = Arc::clone(&collator);
            let rng = StdRng::seed_from_u64(seed.wrapping_add(id as u64 + 1));

            let handle = thread::Builder::new()
                .name(format!("collate-{id}"))
                .spawn(move || collate_worker(job_rx, out_tx, dataset, collator, rng))?;

            loader.threads.push(handle);
            loader.outputs.push(out_rx);
            jobs.push(job_tx);
        }

        let handle = thread::Builder::new()
            .name("sampler".into())
            .spawn(move || dispatch(sampler, jobs, stop))?;
        loader.threads.push(handle);

        debug!(num_workers = num_workers, prefetch = prefetch; "data loader started");
        Ok(loader)
    }

    /// Stops every loader thread and waits for them.
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Dropping the receivers unblocks workers waiting to deliver.
        self.outputs.clear();

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("a data loader thread panicked");
            }
        }
    }
}

impl BatchSource for DataLoader {
    fn next_batch(&mut self) -> Result<Batch> {
        if self.outputs.is_empty() {
            return Err(WorkerErr::LoaderStopped);
        }

        let batch = self.outputs[self.next]
            .recv()
            .map_err(|_| WorkerErr::LoaderStopped)?;
        self.next = (self.next + 1) % self.outputs.len();
        batch
    }
}

impl Drop for DataLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(
    mut sampler: InfiniteSampler,
    jobs: Vec<SyncSender<Result<IndexBatch>>>,
    stop: Arc<AtomicBool>,
) {
    for job in jobs.iter().cycle() {
        if stop.load(Ordering::Acquire) {
            break;
        }

        let next = sampler.next_batch();
        let failed = next.is_err();
        if job.send(next).is_err() || failed {
            break;
        }
    }
}

fn collate_worker(
    jobs: Receiver<Result<IndexBatch>>,
    out: SyncSender<Result<Batch>>,
    dataset: Arc<dyn Dataset>,
    collator: Arc<dyn Collator>,
    mut rng: StdRng,
) {
    for job in jobs {
        let batch = job.and_then(|IndexBatch { bucket, indices }| {
            let samples = indices
                .iter()
                .map(|&i| dataset.sample(i))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(collator.collate(bucket, &indices, samples, &mut rng)?)
        });

        if out.send(batch).is_err() {
            break;
        }
    }
}
