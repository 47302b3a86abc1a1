use std::{fmt::Display, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{Result, WorkerErr};

/// Where the training images live, relative to the dataset directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub root: String,
    pub ann_file: String,
}

/// Hyper-parameters of one training run, loaded from the net description file.
///
/// The value is validated once after loading and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub basic_lr: f64,
    pub momentum: f32,
    pub weight_decay: f32,
    pub lr_decay_rate: f64,
    /// Epochs at which the rate is multiplied by `lr_decay_rate`.
    pub lr_decay_stages: Vec<usize>,
    pub warm_iters: usize,
    pub max_epoch: usize,
    pub nr_images_epoch: usize,
    pub log_interval: usize,
    pub losses_keys: Vec<String>,

    /// Aspect ratio thresholds, empty to disable bucketing.
    #[serde(default = "default_aspect_grouping")]
    pub aspect_grouping: Vec<f64>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Batches each collation worker may have ready ahead of the loop.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    pub train_dataset: DatasetConfig,
    #[serde(default = "default_short_size")]
    pub train_image_short_size: Vec<u32>,
    #[serde(default = "default_max_size")]
    pub train_image_max_size: u32,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
}

fn default_aspect_grouping() -> Vec<f64> {
    vec![1.0]
}

fn default_num_workers() -> usize {
    2
}

fn default_prefetch() -> usize {
    2
}

fn default_short_size() -> Vec<u32> {
    vec![800]
}

fn default_max_size() -> u32 {
    1333
}

fn default_hidden_size() -> usize {
    16
}

impl RunConfig {
    /// Parses and validates a configuration from its JSON text.
    ///
    /// # Errors
    /// Returns `WorkerErr::Config` if the text is malformed or fails validation.
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|e| WorkerErr::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates the net description file at `path`.
    ///
    /// # Errors
    /// Returns `WorkerErr::Io` if the file cannot be read, `WorkerErr::Config` otherwise.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Checks the invariants the schedule, sampler and loop rely on.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(WorkerErr::Config(msg.to_string()));

        if !(self.basic_lr.is_finite() && self.basic_lr > 0.0) {
            return fail("basic_lr must be a positive number");
        }
        if !(self.lr_decay_rate.is_finite() && self.lr_decay_rate > 0.0) {
            return fail("lr_decay_rate must be a positive number");
        }
        if self.lr_decay_stages.windows(2).any(|w| w[0] >= w[1]) {
            return fail("lr_decay_stages must be strictly increasing");
        }
        if self.log_interval == 0 {
            return fail("log_interval must be at least 1");
        }
        if self.losses_keys.is_empty() {
            return fail("losses_keys must name at least one loss");
        }
        if self.aspect_grouping.iter().any(|t| !t.is_finite()) {
            return fail("aspect_grouping thresholds must be finite");
        }
        if self.num_workers == 0 || self.prefetch == 0 {
            return fail("num_workers and prefetch must be at least 1");
        }
        if self.train_image_short_size.is_empty() || self.train_image_short_size.contains(&0) {
            return fail("train_image_short_size must list positive sizes");
        }
        if self.train_image_max_size == 0 || self.hidden_size == 0 {
            return fail("train_image_max_size and hidden_size must be positive");
        }

        Ok(())
    }

    /// Every field as a `(name, rendered value)` row, in declaration order.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        fn list<T: Display>(items: &[T]) -> String {
            let items: Vec<_> = items.iter().map(ToString::to_string).collect();
            format!("[{}]", items.join(", "))
        }

        let ds = &self.train_dataset;
        vec![
            ("basic_lr", self.basic_lr.to_string()),
            ("momentum", self.momentum.to_string()),
            ("weight_decay", self.weight_decay.to_string()),
            ("lr_decay_rate", self.lr_decay_rate.to_string()),
            ("lr_decay_stages", list(&self.lr_decay_stages)),
            ("warm_iters", self.warm_iters.to_string()),
            ("max_epoch", self.max_epoch.to_string()),
            ("nr_images_epoch", self.nr_images_epoch.to_string()),
            ("log_interval", self.log_interval.to_string()),
            ("losses_keys", list(&self.losses_keys)),
            ("aspect_grouping", list(&self.aspect_grouping)),
            ("seed", self.seed.to_string()),
            ("num_workers", self.num_workers.to_string()),
            ("prefetch", self.prefetch.to_string()),
            (
                "train_dataset",
                format!("{} (root={}, ann_file={})", ds.name, ds.root, ds.ann_file),
            ),
            ("train_image_short_size", list(&self.train_image_short_size)),
            ("train_image_max_size", self.train_image_max_size.to_string()),
            ("hidden_size", self.hidden_size.to_string()),
        ]
    }
}

/// Renders two-column rows as a plain text table framed by dashed rules.
pub fn render_table(rows: &[(&str, String)]) -> String {
    let key_w = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let val_w = rows.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
    let rule = format!("{}  {}", "-".repeat(key_w), "-".repeat(val_w));

    let mut out = String::with_capacity((rows.len() + 2) * (rule.len() + 1));
    out.push_str(&rule);
    for (k, v) in rows {
        out.push('\n');
        out.push_str(&format!("{k:<key_w$}  {v}"));
    }
    out.push('\n');
    out.push_str(&rule);
    out
}
