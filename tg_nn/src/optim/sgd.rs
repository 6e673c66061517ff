//! Stochastic Gradient Descent optimizer.

use tg_tensor::prelude::*;

use super::{assign_sub, Optimizer};

/// Plain gradient descent: `x -= lr * g`. Keeps no state.
#[derive(Debug, Clone)]
pub struct Sgd {
    /// Learning rate.
    pub lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Sgd { lr }
    }
}

impl<B: Backend> Optimizer<B> for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn apply_gradients(&mut self, engine: &Engine<B>, grads: &[(Variable, Tensor)]) -> Result<()> {
        for (var, grad) in grads {
            let step = engine.mul_scalar(grad, self.lr)?;
            assign_sub(engine, var, &step)?;
        }
        Ok(())
    }

    fn dispose(&mut self, _engine: &Engine<B>) -> Result<()> {
        Ok(())
    }
}
