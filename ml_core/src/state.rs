use std::collections::BTreeMap;

/// A named, dense `f32` tensor as stored in checkpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    /// Number of scalars implied by the shape.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Parameters keyed by their dotted path, e.g. `backbone.weight`.
pub type StateDict = BTreeMap<String, Tensor>;
