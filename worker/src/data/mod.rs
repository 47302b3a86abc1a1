mod dataloader;
mod sampler;
mod shard;

pub use dataloader::{BatchSource, DataLoader};
pub use sampler::{IndexBatch, InfiniteSampler, build_sampler, compute_aspect_ratios, quantize};
pub use shard::{ShardSpec, shard_range};
