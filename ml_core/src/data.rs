use std::{fmt, io};

/// Errors produced while accessing dataset samples.
#[derive(Debug)]
pub enum DataError {
    /// The requested sample index is out of bounds.
    OutOfBounds { index: usize },

    /// The dataset could not provide a valid sample due to domain constraints.
    InvalidSample(String),

    /// The annotation file could not be read.
    Io(io::Error),

    /// The annotation file is not valid JSON for the expected layout.
    Parse(serde_json::Error),
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::OutOfBounds { index } => write!(f, "sample index {index} is out of bounds"),
            DataError::InvalidSample(msg) => write!(f, "invalid sample: {msg}"),
            DataError::Io(e) => write!(f, "io error: {e}"),
            DataError::Parse(e) => write!(f, "malformed annotations: {e}"),
        }
    }
}

impl std::error::Error for DataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataError::Io(e) => Some(e),
            DataError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DataError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for DataError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Declared size of an image, known without decoding it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageInfo {
    pub height: u32,
    pub width: u32,
}

impl ImageInfo {
    /// The `height / width` ratio used for aspect grouping.
    pub fn aspect_ratio(&self) -> f64 {
        self.height as f64 / self.width as f64
    }
}

/// A single detection record: image size plus its ground-truth boxes.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub info: ImageInfo,
    /// Boxes as `[x0, y0, x1, y1]` in pixel coordinates.
    pub boxes: Vec<[f32; 4]>,
    pub categories: Vec<u32>,
}

/// Random access to detection records.
///
/// A `Dataset` is responsible only for *providing access* to samples.
/// It does not define how they are batched or transformed.
pub trait Dataset: Send + Sync {
    /// Returns the total number of samples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the declared size of sample `index`, used for bucketing.
    ///
    /// # Errors
    /// Returns `DataError::OutOfBounds` if `index` is invalid.
    fn image_info(&self, index: usize) -> Result<ImageInfo, DataError>;

    /// Fetches a sample by index.
    ///
    /// # Errors
    /// Returns `DataError::OutOfBounds` if `index` is invalid.
    fn sample(&self, index: usize) -> Result<Sample, DataError>;
}
