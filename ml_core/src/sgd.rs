use crate::MlError;

/// Stochastic gradient descent with momentum and L2 weight decay.
#[derive(Debug)]
pub struct Sgd {
    momentum: f32,
    weight_decay: f32,
    velocity: Box<[f32]>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `momentum` - Decay of the velocity buffer.
    /// * `weight_decay` - L2 penalty added to every gradient.
    ///
    /// # Returns
    /// A new `Sgd` instance.
    pub fn new(len: usize, momentum: f32, weight_decay: f32) -> Self {
        Self {
            momentum,
            weight_decay,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }

    /// Updates `params` in place with learning rate `lr`.
    ///
    /// # Errors
    /// Returns `MlError::ShapeMismatch` if `grad`, `params` and the velocity differ in length.
    pub fn step(&mut self, lr: f32, grad: &[f32], params: &mut [f32]) -> Result<(), MlError> {
        if grad.len() != params.len() {
            return Err(MlError::ShapeMismatch {
                what: "gradient",
                got: grad.len(),
                expected: params.len(),
            });
        }
        if self.velocity.len() != params.len() {
            return Err(MlError::ShapeMismatch {
                what: "velocity",
                got: self.velocity.len(),
                expected: params.len(),
            });
        }

        let mu = self.momentum;
        let wd = self.weight_decay;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                let g = g + wd * *p;
                *v = (mu * *v) + g;
                *p -= lr * *v;
            });

        Ok(())
    }
}
