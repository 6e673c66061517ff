//! RMSProp optimizer.

use tg_tensor::prelude::*;
use tg_tensor::EPSILON;

use super::slots::Slots;
use super::{assign_sub, Optimizer};

/// Divides each step by a running RMS of the gradient.
///
/// `ms = decay * ms + (1 - decay) * g^2`,
/// `mom = momentum * mom + lr * g / sqrt(ms + eps)`, `x -= mom`.
/// The centered variant also tracks the mean gradient `mg` and uses
/// `sqrt(ms - mg^2 + eps)` as the denominator.
#[derive(Debug)]
pub struct RmsProp {
    pub lr: f32,
    pub decay: f32,
    pub momentum: f32,
    pub centered: bool,
    slots: Slots,
}

impl RmsProp {
    pub fn new(lr: f32) -> Self {
        Self::with_params(lr, 0.9, 0.0, false)
    }

    pub fn with_params(lr: f32, decay: f32, momentum: f32, centered: bool) -> Self {
        RmsProp {
            lr,
            decay,
            momentum,
            centered,
            slots: match centered {
                true => Slots::new(&["mean_square", "moment", "mean_grad"], 0.0),
                false => Slots::new(&["mean_square", "moment"], 0.0),
            },
        }
    }
}

impl<B: Backend> Optimizer<B> for RmsProp {
    fn name(&self) -> &'static str {
        "rmsprop"
    }

    fn apply_gradients(&mut self, engine: &Engine<B>, grads: &[(Variable, Tensor)]) -> Result<()> {
        let decay = self.decay;
        for (var, grad) in grads {
            let slots = self.slots.get(engine, var)?;
            let (ms_slot, mom_slot) = (&slots[0], &slots[1]);

            let ms = engine.add(
                &engine.mul_scalar(ms_slot, decay)?,
                &engine.mul_scalar(&engine.square(grad)?, 1.0 - decay)?,
            )?;
            engine.assign(ms_slot, &ms)?;

            let variance = match slots.get(2) {
                Some(mg_slot) => {
                    let mg = engine.add(&engine.mul_scalar(mg_slot, decay)?, &engine.mul_scalar(grad, 1.0 - decay)?)?;
                    engine.assign(mg_slot, &mg)?;
                    engine.sub(&ms, &engine.square(&mg)?)?
                }
                None => ms,
            };
            let denom = engine.sqrt(&engine.add_scalar(&variance, EPSILON)?)?;
            let scaled = engine.div(&engine.mul_scalar(grad, self.lr)?, &denom)?;
            let mom = engine.add(&engine.mul_scalar(mom_slot, self.momentum)?, &scaled)?;
            engine.assign(mom_slot, &mom)?;

            assign_sub(engine, var, &mom)?;
        }
        Ok(())
    }

    fn dispose(&mut self, engine: &Engine<B>) -> Result<()> {
        self.slots.dispose(engine)
    }
}
