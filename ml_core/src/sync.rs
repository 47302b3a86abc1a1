use crate::MlError;

/// Cross-rank gradient averaging offered to a model by its process group.
pub trait GradientSync: Send {
    /// Replaces `grads` with the element-wise mean over all ranks.
    fn all_reduce_mean(&mut self, grads: &mut [f32]) -> Result<(), MlError>;
}

/// Single-rank runs: gradients are already the mean.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSync;

impl GradientSync for LocalSync {
    fn all_reduce_mean(&mut self, _grads: &mut [f32]) -> Result<(), MlError> {
        Ok(())
    }
}
