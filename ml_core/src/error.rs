use std::{error::Error, fmt};

use crate::DataError;

/// Errors produced by the model collaborators.
#[derive(Debug)]
pub enum MlError {
    /// An input is invalid for semantic or domain reasons.
    InvalidInput(&'static str),

    /// A shape invariant was violated (e.g. mismatched lengths).
    ShapeMismatch {
        /// Human-readable context for the mismatch (e.g. "params", "batch").
        what: &'static str,
        /// Observed value.
        got: usize,
        /// Expected value.
        expected: usize,
    },

    /// A named parameter is absent from a state dict.
    MissingParam(String),

    /// A sample could not be produced.
    Data(DataError),

    /// The gradient synchronization primitive failed.
    Sync(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for MlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            MlError::ShapeMismatch {
                what,
                got,
                expected,
            } => {
                write!(f, "shape mismatch for {what}: got {got}, expected {expected}")
            }
            MlError::MissingParam(name) => write!(f, "missing parameter {name}"),
            MlError::Data(e) => write!(f, "data error: {e}"),
            MlError::Sync(e) => write!(f, "gradient sync failed: {e}"),
        }
    }
}

impl Error for MlError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlError::Data(e) => Some(e),
            MlError::Sync(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<DataError> for MlError {
    fn from(value: DataError) -> Self {
        Self::Data(value)
    }
}
