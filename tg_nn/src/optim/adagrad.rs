//! Adagrad optimizer.

use tg_tensor::prelude::*;
use tg_tensor::EPSILON;

use super::slots::Slots;
use super::{assign_sub, Optimizer};

/// Per-coordinate learning rates from the running sum of squared gradients.
///
/// `a += g^2`, then `x -= lr * g / sqrt(a + eps)`.
#[derive(Debug)]
pub struct Adagrad {
    pub lr: f32,
    slots: Slots,
}

impl Adagrad {
    /// Adagrad with accumulators starting at 0.1.
    pub fn new(lr: f32) -> Self {
        Self::with_initial_accumulator(lr, 0.1)
    }

    pub fn with_initial_accumulator(lr: f32, initial: f32) -> Self {
        Adagrad {
            lr,
            slots: Slots::new(&["accumulator"], initial),
        }
    }
}

impl<B: Backend> Optimizer<B> for Adagrad {
    fn name(&self) -> &'static str {
        "adagrad"
    }

    fn apply_gradients(&mut self, engine: &Engine<B>, grads: &[(Variable, Tensor)]) -> Result<()> {
        for (var, grad) in grads {
            let slots = self.slots.get(engine, var)?;
            let accum = &slots[0];

            let a = engine.add(accum, &engine.square(grad)?)?;
            engine.assign(accum, &a)?;

            let denom = engine.sqrt(&engine.add_scalar(&a, EPSILON)?)?;
            let step = engine.div(&engine.mul_scalar(grad, self.lr)?, &denom)?;
            assign_sub(engine, var, &step)?;
        }
        Ok(())
    }

    fn dispose(&mut self, engine: &Engine<B>) -> Result<()> {
        self.slots.dispose(engine)
    }
}
