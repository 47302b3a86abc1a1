use std::ops::Range;

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

use crate::{
    Batch, GradientSync, MlError, Model, ModelOptions, ParamGroup, Sgd, StateDict, Tensor,
    IM_INFO_LEN,
};

const FEATURES: usize = 3;
const OUTPUTS: usize = 5;
const LOSS_NAMES: [&str; 3] = ["total_loss", "box_loss", "count_loss"];

const BACKBONE_WEIGHT: &str = "backbone.weight";
const BACKBONE_BIAS: &str = "backbone.bias";
const HEAD_WEIGHT: &str = "head.weight";
const HEAD_BIAS: &str = "head.bias";

#[derive(Debug, Clone)]
struct Slot {
    name: &'static str,
    shape: Vec<usize>,
    offset: usize,
}

impl Slot {
    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.shape.iter().product::<usize>()
    }
}

/// A two-layer regressor from image geometry to box statistics.
///
/// The `backbone` maps `[ln(h / w), h / max_size, w / max_size]` to a tanh
/// hidden layer, the `head` predicts the mean normalized box
/// `[cx, cy, w, h]` and `ln(1 + num_boxes)`. It stands in for a detector:
/// small enough to train on metadata alone, yet with a sub-module that
/// pretrained weights can be loaded into.
pub struct BoxStatsNet {
    layout: Vec<Slot>,
    params: Vec<f32>,
    grads: Vec<f32>,
    groups: Vec<ParamGroup>,
    optimizer: Sgd,
    sync: Box<dyn GradientSync>,
    max_size: f32,
}

impl BoxStatsNet {
    /// Creates a new `BoxStatsNet` with uniformly initialized weights.
    ///
    /// Every rank must pass an identically seeded `rng` so replicas start equal.
    ///
    /// # Arguments
    /// * `hidden` - Width of the hidden layer.
    /// * `max_size` - Longest image edge after resizing, used to normalize features.
    /// * `momentum` - SGD momentum.
    /// * `weight_decay` - SGD L2 penalty.
    /// * `rng` - Source of the initial weights.
    /// * `sync` - Gradient averaging across ranks.
    /// * `options` - Pass-through construction flags.
    ///
    /// # Errors
    /// Returns `MlError::InvalidInput` if `hidden` or `max_size` is zero.
    pub fn new<R: Rng>(
        hidden: usize,
        max_size: u32,
        momentum: f32,
        weight_decay: f32,
        rng: &mut R,
        sync: Box<dyn GradientSync>,
        options: ModelOptions,
    ) -> Result<Self, MlError> {
        if hidden == 0 || max_size == 0 {
            return Err(MlError::InvalidInput("hidden and max_size must be positive"));
        }
        if options.sublinear {
            info!("sublinear memory requested, no activations are kept between steps anyway");
        }

        let shapes = [
            (BACKBONE_WEIGHT, vec![hidden, FEATURES]),
            (BACKBONE_BIAS, vec![hidden]),
            (HEAD_WEIGHT, vec![OUTPUTS, hidden]),
            (HEAD_BIAS, vec![OUTPUTS]),
        ];

        let mut layout = Vec::with_capacity(shapes.len());
        let mut offset = 0;
        for (name, shape) in shapes {
            let len: usize = shape.iter().product();
            layout.push(Slot {
                name,
                shape,
                offset,
            });
            offset += len;
        }

        let mut params = vec![0.0; offset];
        for slot in &layout {
            if let [_, fan_in] = slot.shape[..] {
                let bound = 1.0 / (fan_in as f32).sqrt();
                params[slot.range()]
                    .iter_mut()
                    .for_each(|p| *p = rng.random_range(-bound..bound));
            }
        }

        let names = layout.iter().map(|s| s.name.to_string()).collect();
        debug!(params = offset; "built box statistics network");

        Ok(Self {
            layout,
            grads: vec![0.0; offset],
            params,
            groups: vec![ParamGroup::new(0.0, names)],
            optimizer: Sgd::new(offset, momentum, weight_decay),
            sync,
            max_size: max_size as f32,
        })
    }

    fn inputs(&self, batch: &Batch) -> Result<(Array2<f32>, Array2<f32>, Array1<f32>), MlError> {
        let b = batch.len();
        if batch.im_info.len() != b || batch.gt_boxes.len() != b {
            return Err(MlError::ShapeMismatch {
                what: "batch rows",
                got: batch.im_info.len().min(batch.gt_boxes.len()),
                expected: b,
            });
        }

        let mut x = Array2::zeros((b, FEATURES));
        let mut t = Array2::zeros((b, OUTPUTS));
        let mut mask = Array1::zeros(b);

        for (i, (info, rows)) in batch.im_info.iter().zip(&batch.gt_boxes).enumerate() {
            let [h, w, .., n]: [f32; IM_INFO_LEN] = *info;
            if h <= 0.0 || w <= 0.0 {
                return Err(MlError::InvalidInput("im_info with a non-positive size"));
            }

            x[[i, 0]] = (h / w).ln();
            x[[i, 1]] = h / self.max_size;
            x[[i, 2]] = w / self.max_size;

            let n = (n as usize).min(rows.len());
            t[[i, 4]] = (1.0 + n as f32).ln();
            if n == 0 {
                continue;
            }

            mask[i] = 1.0;
            for [x0, y0, x1, y1, _] in &rows[..n] {
                t[[i, 0]] += (x0 + x1) / 2.0 / w;
                t[[i, 1]] += (y0 + y1) / 2.0 / h;
                t[[i, 2]] += (x1 - x0) / w;
                t[[i, 3]] += (y1 - y0) / h;
            }
            for k in 0..4 {
                t[[i, k]] /= n as f32;
            }
        }

        Ok((x, t, mask))
    }
}

fn matrix<'a>(params: &'a [f32], slot: &Slot) -> Result<ArrayView2<'a, f32>, MlError> {
    let [rows, cols] = slot.shape[..] else {
        return Err(MlError::ShapeMismatch {
            what: "matrix rank",
            got: slot.shape.len(),
            expected: 2,
        });
    };

    ArrayView2::from_shape((rows, cols), &params[slot.range()]).map_err(|_| MlError::ShapeMismatch {
        what: slot.name,
        got: slot.range().len(),
        expected: rows * cols,
    })
}

fn vector<'a>(params: &'a [f32], slot: &Slot) -> ArrayView1<'a, f32> {
    ArrayView1::from(&params[slot.range()])
}

fn accumulate<'a>(grads: &mut [f32], slot: &Slot, delta: impl IntoIterator<Item = &'a f32>) {
    grads[slot.range()]
        .iter_mut()
        .zip(delta)
        .for_each(|(g, d)| *g += d);
}

impl Model for BoxStatsNet {
    fn loss_names(&self) -> &[&'static str] {
        &LOSS_NAMES
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn zero_grad(&mut self) {
        self.grads.fill(0.0);
    }

    fn propagate(&mut self, batch: &Batch) -> Result<Vec<f32>, MlError> {
        if batch.is_empty() {
            return Err(MlError::InvalidInput("empty batch"));
        }

        let (x, t, mask) = self.inputs(batch)?;
        let b = batch.len() as f32;

        // Layout order is fixed by `new`.
        let [bw, bb, hw, hb] = [0, 1, 2, 3].map(|i| self.layout[i].clone());

        let w1 = matrix(&self.params, &bw)?;
        let w2 = matrix(&self.params, &hw)?;

        let a = (x.dot(&w1.t()) + &vector(&self.params, &bb)).mapv(f32::tanh);
        let y = a.dot(&w2.t()) + &vector(&self.params, &hb);
        let diff = &y - &t;

        let boxed = mask.sum().max(1.0);
        let mut box_loss = 0.0;
        let mut count_loss = 0.0;
        let mut dy = Array2::<f32>::zeros(y.raw_dim());

        for (i, row) in diff.outer_iter().enumerate() {
            for k in 0..4 {
                box_loss += mask[i] * row[k] * row[k] / boxed;
                dy[[i, k]] = 2.0 * mask[i] * row[k] / boxed;
            }
            count_loss += row[4] * row[4] / b;
            dy[[i, 4]] = 2.0 * row[4] / b;
        }

        let g_w2 = dy.t().dot(&a);
        let g_b2 = dy.sum_axis(Axis(0));
        let dz = dy.dot(&w2) * a.mapv(|v| 1.0 - v * v);
        let g_w1 = dz.t().dot(&x);
        let g_b1 = dz.sum_axis(Axis(0));

        accumulate(&mut self.grads, &hw, g_w2.iter());
        accumulate(&mut self.grads, &hb, g_b2.iter());
        accumulate(&mut self.grads, &bw, g_w1.iter());
        accumulate(&mut self.grads, &bb, g_b1.iter());

        self.sync.all_reduce_mean(&mut self.grads)?;

        Ok(vec![box_loss + count_loss, box_loss, count_loss])
    }

    fn update(&mut self) -> Result<(), MlError> {
        let lr = self.groups.first().map(|g| g.lr).unwrap_or_default() as f32;
        self.optimizer.step(lr, &self.grads, &mut self.params)
    }

    fn state_dict(&self) -> StateDict {
        self.layout
            .iter()
            .map(|slot| {
                let tensor = Tensor::new(slot.shape.clone(), self.params[slot.range()].to_vec());
                (slot.name.to_string(), tensor)
            })
            .collect()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), MlError> {
        for slot in &self.layout {
            let tensor = state
                .get(slot.name)
                .ok_or_else(|| MlError::MissingParam(slot.name.to_string()))?;
            copy_into(&mut self.params, slot, tensor)?;
        }
        Ok(())
    }

    fn load_weights(&mut self, prefix: &str, weights: &StateDict) -> Result<(), MlError> {
        let scope = format!("{prefix}.");
        let mut loaded = 0;

        for slot in &self.layout {
            let Some(key) = slot.name.strip_prefix(&scope) else {
                continue;
            };

            let tensor = weights
                .get(key)
                .ok_or_else(|| MlError::MissingParam(slot.name.to_string()))?;
            copy_into(&mut self.params, slot, tensor)?;
            loaded += 1;
        }

        if loaded == 0 {
            return Err(MlError::InvalidInput("no parameters under the given prefix"));
        }

        debug!(prefix = prefix, tensors = loaded; "loaded pretrained weights");
        Ok(())
    }
}

fn copy_into(params: &mut [f32], slot: &Slot, tensor: &Tensor) -> Result<(), MlError> {
    if tensor.shape != slot.shape || tensor.data.len() != tensor.numel() {
        return Err(MlError::ShapeMismatch {
            what: slot.name,
            got: tensor.data.len(),
            expected: slot.range().len(),
        });
    }

    params[slot.range()].copy_from_slice(&tensor.data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::LocalSync;

    fn net(seed: u64) -> BoxStatsNet {
        let mut rng = StdRng::seed_from_u64(seed);
        BoxStatsNet::new(
            4,
            1000,
            0.9,
            0.0,
            &mut rng,
            Box::new(LocalSync),
            ModelOptions::default(),
        )
        .unwrap()
    }

    fn batch() -> Batch {
        Batch {
            indices: vec![0, 1],
            bucket: 0,
            data_shape: [2, 3, 600, 800],
            im_info: vec![
                [600.0, 800.0, 600.0, 800.0, 1.0],
                [600.0, 400.0, 600.0, 400.0, 0.0],
            ],
            gt_boxes: vec![
                vec![[100.0, 100.0, 300.0, 500.0, 1.0]],
                vec![[0.0; 5]],
            ],
        }
    }

    #[test]
    fn same_seed_gives_same_replica() {
        assert_eq!(net(3).state_dict(), net(3).state_dict());
        assert_ne!(net(3).state_dict(), net(4).state_dict());
    }

    #[test]
    fn training_reduces_loss() {
        let mut net = net(0);
        net.param_groups_mut()[0].lr = 0.02;

        let batch = batch();
        net.zero_grad();
        let first = net.propagate(&batch).unwrap();
        net.update().unwrap();

        let mut last = first.clone();
        for _ in 0..200 {
            net.zero_grad();
            last = net.propagate(&batch).unwrap();
            net.update().unwrap();
        }

        assert_eq!(first.len(), 3);
        assert!(last[0] < first[0]);
        assert!((last[0] - (last[1] + last[2])).abs() < 1e-5);
    }

    #[test]
    fn state_dict_round_trips_into_a_fresh_replica() {
        let source = net(1);
        let mut target = net(2);
        target.load_state_dict(&source.state_dict()).unwrap();
        assert_eq!(target.state_dict(), source.state_dict());
    }

    #[test]
    fn load_weights_only_touches_the_sub_module() {
        let source = net(1);
        let mut target = net(2);
        let head_before = target.state_dict()[HEAD_WEIGHT].clone();

        let weights: StateDict = source
            .state_dict()
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix("backbone.").map(|k| (k.to_string(), v)))
            .collect();
        target.load_weights("backbone", &weights).unwrap();

        let state = target.state_dict();
        assert_eq!(state[BACKBONE_WEIGHT], source.state_dict()[BACKBONE_WEIGHT]);
        assert_eq!(state[HEAD_WEIGHT], head_before);
        assert!(target.load_weights("neck", &weights).is_err());
    }

    #[test]
    fn missing_param_is_reported() {
        let mut target = net(0);
        let mut state = target.state_dict();
        state.remove(HEAD_BIAS);
        assert!(matches!(
            target.load_state_dict(&state),
            Err(MlError::MissingParam(_))
        ));
    }
}
