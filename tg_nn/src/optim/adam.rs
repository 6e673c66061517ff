//! Adam optimizer.

use tg_tensor::prelude::*;
use tg_tensor::EPSILON;

use super::slots::Slots;
use super::{assign_sub, Optimizer};

/// Adam optimizer (Adaptive Moment Estimation).
#[derive(Debug)]
pub struct Adam {
    /// Learning rate.
    pub lr: f32,
    /// Exponential decay rate for first moment.
    pub beta1: f32,
    /// Exponential decay rate for second moment.
    pub beta2: f32,
    /// First and second moment per variable.
    slots: Slots,
    /// Step counter for bias correction.
    t: i32,
}

impl Adam {
    /// Create a new Adam optimizer with default hyperparameters.
    pub fn new(lr: f32) -> Self {
        Self::with_params(lr, 0.9, 0.999)
    }

    pub fn with_params(lr: f32, beta1: f32, beta2: f32) -> Self {
        Adam {
            lr,
            beta1,
            beta2,
            slots: Slots::new(&["first_moment", "second_moment"], 0.0),
            t: 0,
        }
    }
}

impl<B: Backend> Optimizer<B> for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn apply_gradients(&mut self, engine: &Engine<B>, grads: &[(Variable, Tensor)]) -> Result<()> {
        self.t += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        let bias_correction1 = 1.0 - b1.powi(self.t);
        let bias_correction2 = 1.0 - b2.powi(self.t);

        for (var, grad) in grads {
            let slots = self.slots.get(engine, var)?;
            let (m_slot, v_slot) = (&slots[0], &slots[1]);

            let m = engine.add(&engine.mul_scalar(m_slot, b1)?, &engine.mul_scalar(grad, 1.0 - b1)?)?;
            let v = engine.add(
                &engine.mul_scalar(v_slot, b2)?,
                &engine.mul_scalar(&engine.square(grad)?, 1.0 - b2)?,
            )?;
            engine.assign(m_slot, &m)?;
            engine.assign(v_slot, &v)?;

            let m_hat = engine.mul_scalar(&m, 1.0 / bias_correction1)?;
            let v_hat = engine.mul_scalar(&v, 1.0 / bias_correction2)?;
            let denom = engine.add_scalar(&engine.sqrt(&v_hat)?, EPSILON)?;
            let step = engine.mul_scalar(&engine.div(&m_hat, &denom)?, self.lr)?;
            assign_sub(engine, var, &step)?;
        }
        Ok(())
    }

    fn dispose(&mut self, engine: &Engine<B>) -> Result<()> {
        self.t = 0;
        self.slots.dispose(engine)
    }
}
