use std::collections::VecDeque;

use log::debug;
use ml_core::Dataset;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::ShardSpec;
use crate::{Result, WorkerErr, schedule::bisect_right};

/// Dataset indices forming one batch, all from the same aspect bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBatch {
    pub bucket: usize,
    pub indices: Vec<usize>,
}

/// `height / width` of every item, in index order.
pub fn compute_aspect_ratios(dataset: &dyn Dataset) -> Result<Vec<f64>> {
    (0..dataset.len())
        .map(|i| Ok(dataset.image_info(i)?.aspect_ratio()))
        .collect()
}

/// Maps each ratio to the number of thresholds in `bins` it reaches.
///
/// `n` thresholds give `n + 1` buckets; a ratio equal to a threshold lands
/// above it.
pub fn quantize(ratios: &[f64], bins: &[f64]) -> Vec<usize> {
    let mut sorted = bins.to_vec();
    sorted.sort_by(f64::total_cmp);
    ratios.iter().map(|r| bisect_right(&sorted, r)).collect()
}

#[derive(Debug, Clone)]
enum Grouping {
    /// No bucketing, every batch is tagged with bucket 0.
    Random,
    Buckets { ids: Vec<usize>, count: usize },
}

/// An endless stream of index batches.
///
/// Each pass draws a fresh permutation of the whole dataset from a seeded
/// generator, keeps this rank's shard of it and cuts it into batches of
/// exactly `batch_size` items, never mixing buckets. Items that cannot fill a
/// batch are dropped for that pass. When a pass runs out the next one starts
/// transparently.
///
/// Every rank uses the same seed, so all ranks agree on the permutation and
/// their shards stay disjoint.
#[derive(Debug)]
pub struct InfiniteSampler {
    len: usize,
    batch_size: usize,
    shard: ShardSpec,
    grouping: Grouping,
    rng: StdRng,
    pending: VecDeque<IndexBatch>,
    passes: usize,
}

impl InfiniteSampler {
    /// A sampler over `bucket_ids.len()` items bucketed by `bucket_ids`.
    pub fn grouped(
        bucket_ids: Vec<usize>,
        batch_size: usize,
        shard: ShardSpec,
        seed: u64,
    ) -> Result<Self> {
        let count = bucket_ids.iter().max().map_or(0, |&m| m + 1);
        Self::new(
            bucket_ids.len(),
            batch_size,
            shard,
            seed,
            Grouping::Buckets {
                ids: bucket_ids,
                count,
            },
        )
    }

    /// A sampler over `len` items without bucketing.
    pub fn random(len: usize, batch_size: usize, shard: ShardSpec, seed: u64) -> Result<Self> {
        Self::new(len, batch_size, shard, seed, Grouping::Random)
    }

    fn new(
        len: usize,
        batch_size: usize,
        shard: ShardSpec,
        seed: u64,
        grouping: Grouping,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(WorkerErr::Config("batch_size must be at least 1".into()));
        }

        Ok(Self {
            len,
            batch_size,
            shard,
            grouping,
            rng: StdRng::seed_from_u64(seed),
            pending: VecDeque::new(),
            passes: 0,
        })
    }

    /// Number of passes started so far.
    #[inline]
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Returns the next batch, starting a new pass if the current one is spent.
    ///
    /// # Errors
    /// Returns `WorkerErr::SamplerStarved` if a whole pass yields no batch.
    pub fn next_batch(&mut self) -> Result<IndexBatch> {
        match self.pending.pop_front() {
            Some(batch) => Ok(batch),
            None => self.start_pass(),
        }
    }

    fn start_pass(&mut self) -> Result<IndexBatch> {
        let mut perm: Vec<usize> = (0..self.len).collect();
        perm.shuffle(&mut self.rng);
        let shard = &perm[self.shard.range(self.len)];

        let mut batches = match &self.grouping {
            Grouping::Random => random_pass(shard, self.batch_size),
            Grouping::Buckets { ids, count } => grouped_pass(shard, ids, *count, self.batch_size),
        };

        let Some(first) = batches.pop_front() else {
            return Err(WorkerErr::SamplerStarved {
                batch_size: self.batch_size,
                shard_len: shard.len(),
            });
        };

        self.passes += 1;
        debug!(pass = self.passes, batches = batches.len() + 1; "sampler reshuffled");
        self.pending = batches;
        Ok(first)
    }
}

fn random_pass(order: &[usize], batch_size: usize) -> VecDeque<IndexBatch> {
    order
        .chunks_exact(batch_size)
        .map(|chunk| IndexBatch {
            bucket: 0,
            indices: chunk.to_vec(),
        })
        .collect()
}

fn grouped_pass(
    order: &[usize],
    ids: &[usize],
    count: usize,
    batch_size: usize,
) -> VecDeque<IndexBatch> {
    let mut buffers: Vec<Vec<usize>> = vec![Vec::with_capacity(batch_size); count];
    let mut batches = VecDeque::with_capacity(order.len() / batch_size);

    for &idx in order {
        let bucket = ids[idx];
        let buffer = &mut buffers[bucket];
        buffer.push(idx);
        if buffer.len() == batch_size {
            batches.push_back(IndexBatch {
                bucket,
                indices: std::mem::replace(buffer, Vec::with_capacity(batch_size)),
            });
        }
    }

    batches
}

/// Builds the sampler the training loop draws from.
///
/// An empty `aspect_grouping` disables bucketing; otherwise items are
/// bucketed by their aspect ratio against its thresholds.
pub fn build_sampler(
    dataset: &dyn Dataset,
    batch_size: usize,
    aspect_grouping: &[f64],
    shard: ShardSpec,
    seed: u64,
) -> Result<InfiniteSampler> {
    if aspect_grouping.is_empty() {
        return InfiniteSampler::random(dataset.len(), batch_size, shard, seed);
    }

    let ratios = compute_aspect_ratios(dataset)?;
    let ids = quantize(&ratios, aspect_grouping);
    InfiniteSampler::grouped(ids, batch_size, shard, seed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use ml_core::{ImageInfo, ManifestDataset, Sample};

    use super::*;

    fn dataset(sizes: &[(u32, u32)]) -> ManifestDataset {
        ManifestDataset::from_samples(
            sizes
                .iter()
                .map(|&(height, width)| Sample {
                    info: ImageInfo { height, width },
                    boxes: vec![],
                    categories: vec![],
                })
                .collect(),
        )
    }

    fn pass(sampler: &mut InfiniteSampler) -> Vec<IndexBatch> {
        let start = sampler.passes();
        let mut out = vec![sampler.next_batch().unwrap()];
        while !sampler.pending.is_empty() {
            out.push(sampler.next_batch().unwrap());
        }
        assert_eq!(sampler.passes(), start + 1);
        out
    }

    #[test]
    fn quantize_is_right_sided() {
        let ratios = [0.5, 1.0, 1.5, 0.99];
        assert_eq!(quantize(&ratios, &[1.0]), vec![0, 1, 1, 0]);
        assert_eq!(quantize(&ratios, &[]), vec![0, 0, 0, 0]);
        assert_eq!(quantize(&ratios, &[1.2, 0.7]), vec![0, 1, 2, 1]);
    }

    #[test]
    fn aspect_ratio_is_height_over_width() {
        let ds = dataset(&[(100, 200), (300, 150)]);
        assert_eq!(compute_aspect_ratios(&ds).unwrap(), vec![0.5, 2.0]);
    }

    #[test]
    fn grouped_batches_never_mix_buckets() {
        let ids: Vec<usize> = (0..37).map(|i| i % 3).collect();
        let mut sampler = InfiniteSampler::grouped(ids.clone(), 4, ShardSpec::whole(), 7).unwrap();

        for _ in 0..3 {
            let batches = pass(&mut sampler);
            let mut seen = HashSet::new();
            for b in &batches {
                assert_eq!(b.indices.len(), 4);
                assert!(b.indices.iter().all(|&i| ids[i] == b.bucket));
                assert!(b.indices.iter().all(|&i| seen.insert(i)));
            }
            // 13, 12, 12 items per bucket => 3 full batches each
            assert_eq!(batches.len(), 9);
        }
    }

    #[test]
    fn random_mode_drops_the_tail() {
        let mut sampler = InfiniteSampler::random(10, 3, ShardSpec::whole(), 1).unwrap();
        let batches = pass(&mut sampler);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.indices.len() == 3 && b.bucket == 0));
    }

    #[test]
    fn keeps_producing_across_passes() {
        let mut sampler = InfiniteSampler::random(6, 2, ShardSpec::whole(), 3).unwrap();
        for _ in 0..(4 * 3 + 1) {
            sampler.next_batch().unwrap();
        }
        assert_eq!(sampler.passes(), 5);
    }

    #[test]
    fn each_pass_is_reshuffled() {
        let mut sampler = InfiniteSampler::random(64, 8, ShardSpec::whole(), 11).unwrap();
        let first = pass(&mut sampler);
        let second = pass(&mut sampler);
        assert_ne!(first, second);

        let flat = |p: &[IndexBatch]| {
            let mut v: Vec<usize> = p.iter().flat_map(|b| b.indices.clone()).collect();
            v.sort();
            v
        };
        assert_eq!(flat(&first), (0..64).collect::<Vec<_>>());
        assert_eq!(flat(&second), (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn same_seed_same_stream() {
        let ids: Vec<usize> = (0..50).map(|i| i % 2).collect();
        let mut a = InfiniteSampler::grouped(ids.clone(), 5, ShardSpec::whole(), 42).unwrap();
        let mut b = InfiniteSampler::grouped(ids, 5, ShardSpec::whole(), 42).unwrap();
        for _ in 0..25 {
            assert_eq!(a.next_batch().unwrap(), b.next_batch().unwrap());
        }
    }

    #[test]
    fn ranks_draw_disjoint_shards() {
        let mut seen = HashSet::new();
        for rank in 0..3 {
            let shard = ShardSpec::new(rank, 3).unwrap();
            let mut sampler = InfiniteSampler::random(30, 2, shard, 5).unwrap();
            for b in pass(&mut sampler) {
                assert!(b.indices.iter().all(|&i| seen.insert(i)));
            }
        }
        assert_eq!(seen.len(), 30);
    }

    #[test]
    fn starved_pass_is_an_error() {
        // one item per bucket can never fill a batch of two
        let mut sampler = InfiniteSampler::grouped(vec![0, 1, 2], 2, ShardSpec::whole(), 0).unwrap();
        assert!(matches!(
            sampler.next_batch(),
            Err(WorkerErr::SamplerStarved {
                batch_size: 2,
                shard_len: 3
            })
        ));
    }

    #[test]
    fn build_sampler_uses_dataset_ratios() {
        let ds = dataset(&[(100, 200), (200, 100), (100, 300), (300, 100)]);
        let mut sampler = build_sampler(&ds, 2, &[1.0], ShardSpec::whole(), 0).unwrap();
        let batches = pass(&mut sampler);
        assert_eq!(batches.len(), 2);
        for b in batches {
            let mut idx = b.indices.clone();
            idx.sort();
            match b.bucket {
                0 => assert_eq!(idx, vec![0, 2]),
                1 => assert_eq!(idx, vec![1, 3]),
                other => panic!("unexpected bucket {other}"),
            }
        }
    }

    #[test]
    fn empty_grouping_is_unbucketed() {
        let ds = dataset(&[(100, 200), (200, 100), (100, 300), (300, 100)]);
        let mut sampler = build_sampler(&ds, 4, &[], ShardSpec::whole(), 0).unwrap();
        assert_eq!(sampler.next_batch().unwrap().indices.len(), 4);
    }
}
