use crate::config::RunConfig;

/// Number of entries of `sorted` that are less than or equal to `x`.
#[inline]
pub fn bisect_right<T: PartialOrd>(sorted: &[T], x: &T) -> usize {
    sorted.partition_point(|s| s <= x)
}

/// Learning rate for `step` of `epoch`.
///
/// The base rate `basic_lr * world_size * batch_size` is decayed by
/// `lr_decay_rate` once per stage already reached. During the first
/// `warm_iters` steps of epoch 0 the decayed rate is ramped linearly,
/// reaching it exactly at step `warm_iters - 1`.
///
/// Every rank evaluates this independently, so it must stay a pure function
/// of its arguments.
pub fn learning_rate(
    epoch: usize,
    step: usize,
    world_size: usize,
    batch_size: usize,
    cfg: &RunConfig,
) -> f64 {
    let base = cfg.basic_lr * world_size as f64 * batch_size as f64;
    let passed = bisect_right(&cfg.lr_decay_stages, &epoch);
    let decayed = base * cfg.lr_decay_rate.powi(passed as i32);

    if epoch == 0 && step < cfg.warm_iters {
        decayed * (step + 1) as f64 / cfg.warm_iters as f64
    } else {
        decayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetConfig;

    fn cfg(stages: Vec<usize>, warm_iters: usize) -> RunConfig {
        RunConfig {
            basic_lr: 0.01,
            momentum: 0.9,
            weight_decay: 1e-4,
            lr_decay_rate: 0.1,
            lr_decay_stages: stages,
            warm_iters,
            max_epoch: 10,
            nr_images_epoch: 100,
            log_interval: 1,
            losses_keys: vec!["total_loss".into()],
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

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * b.abs().max(1.0)
    }

    #[test]
    fn bisect_right_counts_ties_as_passed() {
        let stages = [3, 6];
        assert_eq!(bisect_right(&stages, &0), 0);
        assert_eq!(bisect_right(&stages, &2), 0);
        assert_eq!(bisect_right(&stages, &3), 1);
        assert_eq!(bisect_right(&stages, &5), 1);
        assert_eq!(bisect_right(&stages, &6), 2);
        assert_eq!(bisect_right(&stages, &100), 2);
        assert_eq!(bisect_right::<usize>(&[], &4), 0);
    }

    #[test]
    fn stepwise_decay_at_stage_boundaries() {
        let cfg = cfg(vec![3, 6], 0);

        assert!(close(learning_rate(2, 0, 1, 1, &cfg), 0.01));
        assert!(close(learning_rate(3, 0, 1, 1, &cfg), 0.001));
        assert!(close(learning_rate(7, 0, 1, 1, &cfg), 0.0001));
    }

    #[test]
    fn scales_with_world_and_batch() {
        let cfg = cfg(vec![3, 6], 0);
        assert!(close(learning_rate(0, 0, 4, 2, &cfg), 0.08));
    }

    #[test]
    fn constant_within_an_epoch_after_warmup() {
        let cfg = cfg(vec![3, 6], 10);
        let first = learning_rate(4, 0, 2, 2, &cfg);
        for step in 1..50 {
            assert_eq!(learning_rate(4, step, 2, 2, &cfg), first);
        }
        let after = learning_rate(0, 10, 2, 2, &cfg);
        assert!(close(after, 0.04));
        assert_eq!(learning_rate(0, 11, 2, 2, &cfg), after);
    }

    #[test]
    fn warmup_ramps_up_to_full_rate() {
        let cfg = cfg(vec![3, 6], 5);
        let full = learning_rate(0, 5, 1, 2, &cfg);

        let ramp: Vec<f64> = (0..5).map(|s| learning_rate(0, s, 1, 2, &cfg)).collect();
        assert!(ramp.windows(2).all(|w| w[0] < w[1]));
        assert!(ramp[..4].iter().all(|&lr| lr < full));
        assert!(close(ramp[4], full));
        assert!(close(ramp[0], full / 5.0));
    }

    #[test]
    fn warmup_only_applies_to_epoch_zero() {
        let cfg = cfg(vec![], 100);
        assert!(close(learning_rate(1, 0, 1, 1, &cfg), 0.01));
        assert!(learning_rate(0, 0, 1, 1, &cfg) < 0.01);
    }
}
