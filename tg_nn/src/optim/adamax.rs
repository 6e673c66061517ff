//! Adamax optimizer.

use tg_tensor::prelude::*;
use tg_tensor::EPSILON;

use super::slots::Slots;
use super::{assign_sub, Optimizer};

/// Adam variant with an infinity-norm second moment:
/// `u = max(beta2 * u, |g|)` and `x -= lr_t / (1 - beta1^t) * m / (u + eps)`,
/// where `lr_t = lr / (1 + decay * (t - 1))`.
#[derive(Debug)]
pub struct Adamax {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    /// Learning-rate decay per step.
    pub decay: f32,
    slots: Slots,
    t: i32,
}

impl Adamax {
    pub fn new(lr: f32) -> Self {
        Self::with_params(lr, 0.9, 0.999, 0.0)
    }

    pub fn with_params(lr: f32, beta1: f32, beta2: f32, decay: f32) -> Self {
        Adamax {
            lr,
            beta1,
            beta2,
            decay,
            slots: Slots::new(&["first_moment", "weighted_inf_norm"], 0.0),
            t: 0,
        }
    }
}

impl<B: Backend> Optimizer<B> for Adamax {
    fn name(&self) -> &'static str {
        "adamax"
    }

    fn apply_gradients(&mut self, engine: &Engine<B>, grads: &[(Variable, Tensor)]) -> Result<()> {
        let lr = self.lr / (1.0 + self.decay * self.t as f32);
        self.t += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        let rate = lr / (1.0 - b1.powi(self.t));

        for (var, grad) in grads {
            let slots = self.slots.get(engine, var)?;
            let (m_slot, u_slot) = (&slots[0], &slots[1]);

            let m = engine.add(&engine.mul_scalar(m_slot, b1)?, &engine.mul_scalar(grad, 1.0 - b1)?)?;
            let u = engine.maximum(&engine.mul_scalar(u_slot, b2)?, &engine.abs(grad)?)?;
            engine.assign(m_slot, &m)?;
            engine.assign(u_slot, &u)?;

            let ratio = engine.div(&m, &engine.add_scalar(&u, EPSILON)?)?;
            assign_sub(engine, var, &engine.mul_scalar(&ratio, rate)?)?;
        }
        Ok(())
    }

    fn dispose(&mut self, engine: &Engine<B>) -> Result<()> {
        self.t = 0;
        self.slots.dispose(engine)
    }
}
