use rand::{Rng, rngs::StdRng};

use crate::{MlError, Sample};

/// Width of each `im_info` row: `[height, width, orig_height, orig_width, num_boxes]`.
pub const IM_INFO_LEN: usize = 5;

/// A fixed-shape mini-batch ready for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Dataset indices of the images, in batch order.
    pub indices: Vec<usize>,
    /// Aspect bucket every image of the batch belongs to.
    pub bucket: usize,
    /// `[batch, channels, height, width]` of the padded image tensor.
    pub data_shape: [usize; 4],
    pub im_info: Vec<[f32; IM_INFO_LEN]>,
    /// `[x0, y0, x1, y1, category]` rows, zero padded to the same count per image.
    pub gt_boxes: Vec<Vec<[f32; 5]>>,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Turns a group of samples into one `Batch`.
pub trait Collator: Send + Sync {
    /// # Errors
    /// Returns `MlError` if the samples cannot form a batch.
    fn collate(
        &self,
        bucket: usize,
        indices: &[usize],
        samples: Vec<Sample>,
        rng: &mut StdRng,
    ) -> Result<Batch, MlError>;
}

/// Resizes each image so its shortest edge matches one of `short_sizes`
/// (capped by `max_size` on the longest edge), flips it horizontally at
/// random, and pads the batch to the largest image.
#[derive(Debug, Clone)]
pub struct PadCollator {
    short_sizes: Vec<u32>,
    max_size: u32,
    flip_prob: f64,
}

impl PadCollator {
    /// Creates a new `PadCollator`.
    ///
    /// # Errors
    /// Returns `MlError::InvalidInput` if `short_sizes` is empty or a size is zero.
    pub fn new(short_sizes: Vec<u32>, max_size: u32, flip_prob: f64) -> Result<Self, MlError> {
        if short_sizes.is_empty() {
            return Err(MlError::InvalidInput("short_sizes must not be empty"));
        }
        if max_size == 0 || short_sizes.contains(&0) {
            return Err(MlError::InvalidInput("image sizes must be positive"));
        }
        if !(0.0..=1.0).contains(&flip_prob) {
            return Err(MlError::InvalidInput("flip_prob must be within [0, 1]"));
        }

        Ok(Self {
            short_sizes,
            max_size,
            flip_prob,
        })
    }

    fn resize_scale(&self, height: u32, width: u32, short: u32) -> f32 {
        let (min_edge, max_edge) = (height.min(width) as f32, height.max(width) as f32);
        let scale = short as f32 / min_edge;

        if max_edge * scale > self.max_size as f32 {
            self.max_size as f32 / max_edge
        } else {
            scale
        }
    }
}

impl Collator for PadCollator {
    fn collate(
        &self,
        bucket: usize,
        indices: &[usize],
        samples: Vec<Sample>,
        rng: &mut StdRng,
    ) -> Result<Batch, MlError> {
        if samples.is_empty() {
            return Err(MlError::InvalidInput("cannot collate an empty batch"));
        }
        if samples.len() != indices.len() {
            return Err(MlError::ShapeMismatch {
                what: "batch indices",
                got: indices.len(),
                expected: samples.len(),
            });
        }

        let mut im_info = Vec::with_capacity(samples.len());
        let mut gt_boxes = Vec::with_capacity(samples.len());

        for sample in samples {
            let Sample {
                info,
                boxes,
                categories,
            } = sample;

            if info.height == 0 || info.width == 0 {
                return Err(MlError::InvalidInput("image with a zero-sized edge"));
            }
            if boxes.len() != categories.len() {
                return Err(MlError::ShapeMismatch {
                    what: "box categories",
                    got: categories.len(),
                    expected: boxes.len(),
                });
            }

            let short = self.short_sizes[rng.random_range(0..self.short_sizes.len())];
            let scale = self.resize_scale(info.height, info.width, short);
            let height = (info.height as f32 * scale).round();
            let width = (info.width as f32 * scale).round();
            let flip = rng.random_bool(self.flip_prob);

            let rows: Vec<[f32; 5]> = boxes
                .iter()
                .zip(&categories)
                .map(|(b, &c)| {
                    let [x0, y0, x1, y1] = b.map(|v| v * scale);
                    if flip {
                        [width - x1, y0, width - x0, y1, c as f32]
                    } else {
                        [x0, y0, x1, y1, c as f32]
                    }
                })
                .collect();

            im_info.push([
                height,
                width,
                info.height as f32,
                info.width as f32,
                rows.len() as f32,
            ]);
            gt_boxes.push(rows);
        }

        let max_boxes = gt_boxes.iter().map(Vec::len).max().unwrap_or(0).max(1);
        for rows in &mut gt_boxes {
            rows.resize(max_boxes, [0.0; 5]);
        }

        let pad_h = im_info.iter().map(|i| i[0] as usize).max().unwrap_or(0);
        let pad_w = im_info.iter().map(|i| i[1] as usize).max().unwrap_or(0);

        Ok(Batch {
            indices: indices.to_vec(),
            bucket,
            data_shape: [im_info.len(), 3, pad_h, pad_w],
            im_info,
            gt_boxes,
        })
    }
}
