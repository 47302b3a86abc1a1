use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::info;
use ml_core::{StateDict, Tensor};
use safetensors::{
    SafeTensors,
    tensor::{Dtype, TensorView},
};

use crate::{Result, WorkerErr};

const EPOCH_KEY: &str = "epoch";

/// Log directory of a run: `log-of-<name>` where `<name>` is the file name of
/// `model_file` up to its first dot.
pub fn log_dir_for<P: AsRef<Path>>(model_file: P) -> PathBuf {
    let file_name = model_file
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file_name.split('.').next().unwrap_or_default();
    PathBuf::from(format!("log-of-{stem}"))
}

#[inline]
pub fn checkpoint_name(epoch: usize) -> String {
    format!("epoch_{epoch}.safetensors")
}

/// Persists one `{epoch, state}` record per finished epoch.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    dir: PathBuf,
}

impl CheckpointWriter {
    /// Creates a writer targeting `dir`, which must already exist.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Writes `state` as the checkpoint of `epoch`.
    ///
    /// The record goes to a hidden temporary file first, is flushed to disk
    /// and then renamed over the final name, so a crash never leaves a torn
    /// `epoch_<n>` file behind.
    ///
    /// # Returns
    /// The path of the written checkpoint.
    ///
    /// # Errors
    /// Returns `WorkerErr::Io` if the directory is missing or unwritable. The
    /// temporary file is removed again on failure.
    pub fn write(&self, epoch: usize, state: &StateDict) -> Result<PathBuf> {
        let bytes = encode(epoch, state)?;

        let name = checkpoint_name(epoch);
        let tmp = self.dir.join(format!(".{name}.tmp"));
        let path = self.dir.join(name);

        if let Err(e) = write_synced(&tmp, &bytes).and_then(|()| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        info!(epoch = epoch, bytes = bytes.len(); "dump weights to {}", path.display());
        Ok(path)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn encode(epoch: usize, state: &StateDict) -> Result<Vec<u8>> {
    let mut views = Vec::with_capacity(state.len());
    for (name, tensor) in state {
        if tensor.numel() != tensor.data.len() {
            return Err(WorkerErr::ShapeMismatch {
                what: "checkpoint tensor",
                got: tensor.data.len(),
                expected: tensor.numel(),
            });
        }
        let bytes: &[u8] = bytemuck::cast_slice(&tensor.data);
        views.push((name.as_str(), TensorView::new(Dtype::F32, tensor.shape.clone(), bytes)?));
    }

    let metadata = HashMap::from([(EPOCH_KEY.to_string(), epoch.to_string())]);
    Ok(safetensors::tensor::serialize(views, &Some(metadata))?)
}

fn decode(bytes: &[u8]) -> Result<StateDict> {
    let tensors = SafeTensors::deserialize(bytes)?;
    let mut state = StateDict::new();

    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(WorkerErr::Checkpoint(format!(
                "tensor {name} has dtype {:?}, expected F32",
                view.dtype()
            )));
        }
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        state.insert(name, Tensor::new(view.shape().to_vec(), data));
    }

    Ok(state)
}

/// Reads back a checkpoint written by `CheckpointWriter`.
///
/// # Returns
/// The stored epoch and model state.
pub fn read_checkpoint<P: AsRef<Path>>(path: P) -> Result<(usize, StateDict)> {
    let bytes = fs::read(path)?;

    let (_, metadata) = SafeTensors::read_metadata(&bytes)?;
    let epoch = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(EPOCH_KEY))
        .ok_or_else(|| WorkerErr::Checkpoint("missing epoch metadata".into()))?
        .parse()
        .map_err(|e| WorkerErr::Checkpoint(format!("bad epoch metadata: {e}")))?;

    Ok((epoch, decode(&bytes)?))
}

/// Reads a plain safetensors weight file, e.g. pretrained backbone weights.
pub fn load_weights_file<P: AsRef<Path>>(path: P) -> Result<StateDict> {
    let bytes = fs::read(path)?;
    decode(&bytes)
}
