//! Gradient descent with momentum.

use tg_tensor::prelude::*;

use super::slots::Slots;
use super::{assign_sub, Optimizer};

/// `v = momentum * v + g`, then `x -= lr * v`.
///
/// With Nesterov momentum the step looks ahead: `x -= lr * (g + momentum * v)`.
#[derive(Debug)]
pub struct Momentum {
    pub lr: f32,
    pub momentum: f32,
    pub nesterov: bool,
    slots: Slots,
}

impl Momentum {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Momentum {
            lr,
            momentum,
            nesterov: false,
            slots: Slots::new(&["velocity"], 0.0),
        }
    }

    pub fn with_nesterov(lr: f32, momentum: f32) -> Self {
        Momentum {
            nesterov: true,
            ..Self::new(lr, momentum)
        }
    }
}

impl<B: Backend> Optimizer<B> for Momentum {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn apply_gradients(&mut self, engine: &Engine<B>, grads: &[(Variable, Tensor)]) -> Result<()> {
        for (var, grad) in grads {
            let slots = self.slots.get(engine, var)?;
            let velocity = &slots[0];

            let v = engine.add(&engine.mul_scalar(velocity, self.momentum)?, grad)?;
            engine.assign(velocity, &v)?;

            let direction = match self.nesterov {
                true => engine.add(grad, &engine.mul_scalar(&v, self.momentum)?)?,
                false => v,
            };
            assign_sub(engine, var, &engine.mul_scalar(&direction, self.lr)?)?;
        }
        Ok(())
    }

    fn dispose(&mut self, engine: &Engine<B>) -> Result<()> {
        self.slots.dispose(engine)
    }
}
