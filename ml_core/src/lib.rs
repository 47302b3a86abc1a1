mod collate;
mod data;
mod error;
mod manifest;
mod model;
mod net;
mod sgd;
mod state;
mod sync;

pub use collate::{Batch, Collator, PadCollator, IM_INFO_LEN};
pub use data::{DataError, Dataset, ImageInfo, Sample};
pub use error::MlError;
pub use manifest::ManifestDataset;
pub use model::{Model, ModelOptions, ParamGroup};
pub use net::BoxStatsNet;
pub use sgd::Sgd;
pub use state::{StateDict, Tensor};
pub use sync::{GradientSync, LocalSync};
