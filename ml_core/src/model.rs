use crate::{Batch, MlError, StateDict};

/// A set of parameters sharing one learning rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub lr: f64,
    pub params: Vec<String>,
}

impl ParamGroup {
    pub fn new(lr: f64, params: Vec<String>) -> Self {
        Self { lr, params }
    }
}

/// Construction options forwarded untouched from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelOptions {
    /// Trade recomputation for activation memory, if the model supports it.
    pub sublinear: bool,
}

/// A trainable network together with its optimizer state.
///
/// The training loop only drives this interface: it sets learning rates,
/// clears gradients, runs one forward/backward pass and applies the update.
/// Gradient exchange between ranks, if any, happens inside `propagate`.
pub trait Model: Send {
    /// Names of the scalars returned by `propagate`, in order.
    fn loss_names(&self) -> &[&'static str];

    /// The optimizer's parameter groups, each with a mutable learning rate.
    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    fn zero_grad(&mut self);

    /// Runs forward and backward on `batch`, accumulating gradients.
    ///
    /// # Returns
    /// One scalar per entry of `loss_names`.
    ///
    /// # Errors
    /// Returns `MlError` on malformed batches or a failed gradient exchange.
    fn propagate(&mut self, batch: &Batch) -> Result<Vec<f32>, MlError>;

    /// Applies one optimizer step using the accumulated gradients.
    fn update(&mut self) -> Result<(), MlError>;

    fn state_dict(&self) -> StateDict;

    /// Replaces every parameter with the matching entry of `state`.
    ///
    /// # Errors
    /// Returns `MlError::MissingParam` or `MlError::ShapeMismatch` on incompatible state.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), MlError>;

    /// Loads pretrained `weights` into the sub-module rooted at `prefix`.
    ///
    /// Keys in `weights` are relative to the sub-module.
    fn load_weights(&mut self, prefix: &str, weights: &StateDict) -> Result<(), MlError>;
}
