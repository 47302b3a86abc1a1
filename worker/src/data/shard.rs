use std::num::NonZeroUsize;
use std::ops::Range;

use crate::{Result, WorkerErr};

/// Splits `total` items among `world_size` ranks and returns the part of `rank`.
///
/// Properties:
/// - Ranges are contiguous, disjoint and cover `[0..total)`.
/// - Sizes differ by at most 1 (balanced partition).
pub fn shard_range(total: usize, rank: usize, world_size: usize) -> Range<usize> {
    debug_assert!(rank < world_size);

    let base = total / world_size;
    let rem = total % world_size;

    let start = rank * base + rank.min(rem);
    let extra = if rank < rem { 1 } else { 0 };
    let end = start + base + extra;

    start..end
}

/// The slice of every sampler pass owned by one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub world_size: NonZeroUsize,
}

impl ShardSpec {
    /// # Errors
    /// Returns `WorkerErr::Config` if `rank` is not below `world_size`.
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        match NonZeroUsize::new(world_size) {
            Some(world_size) if rank < world_size.get() => Ok(Self { rank, world_size }),
            _ => Err(WorkerErr::Config(format!(
                "rank {rank} is out of range for world size {world_size}"
            ))),
        }
    }

    /// A single-rank run sees everything.
    pub fn whole() -> Self {
        Self {
            rank: 0,
            world_size: NonZeroUsize::MIN,
        }
    }

    #[inline]
    pub fn range(self, total: usize) -> Range<usize> {
        shard_range(total, self.rank, self.world_size.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_range_balanced() {
        // total 10, ranks 3 => sizes 4,3,3
        assert_eq!(shard_range(10, 0, 3), 0..4);
        assert_eq!(shard_range(10, 1, 3), 4..7);
        assert_eq!(shard_range(10, 2, 3), 7..10);
    }

    #[test]
    fn more_ranks_than_items() {
        assert_eq!(shard_range(2, 0, 4), 0..1);
        assert_eq!(shard_range(2, 1, 4), 1..2);
        assert_eq!(shard_range(2, 3, 4), 2..2);
    }

    #[test]
    fn shard_spec_range_matches_function() {
        let spec = ShardSpec::new(1, 3).unwrap();
        assert_eq!(spec.range(10), 4..7);
        assert_eq!(ShardSpec::whole().range(10), 0..10);
    }

    #[test]
    fn shard_spec_rejects_bad_rank() {
        assert!(ShardSpec::new(3, 3).is_err());
        assert!(ShardSpec::new(0, 0).is_err());
    }
}
