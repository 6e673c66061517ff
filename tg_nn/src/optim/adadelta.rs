//! Adadelta optimizer.

use tg_tensor::prelude::*;
use tg_tensor::EPSILON;

use super::slots::Slots;
use super::{assign_sub, Optimizer};

/// Adadelta: scales each step by the ratio of running RMS of past updates
/// to running RMS of gradients.
#[derive(Debug)]
pub struct Adadelta {
    pub lr: f32,
    /// Decay rate of both running averages.
    pub rho: f32,
    slots: Slots,
}

impl Adadelta {
    pub fn new(lr: f32, rho: f32) -> Self {
        Adadelta {
            lr,
            rho,
            slots: Slots::new(&["accum_grad", "accum_update"], 0.0),
        }
    }
}

impl<B: Backend> Optimizer<B> for Adadelta {
    fn name(&self) -> &'static str {
        "adadelta"
    }

    fn apply_gradients(&mut self, engine: &Engine<B>, grads: &[(Variable, Tensor)]) -> Result<()> {
        let rho = self.rho;
        for (var, grad) in grads {
            let slots = self.slots.get(engine, var)?;
            let (accum_grad, accum_update) = (&slots[0], &slots[1]);

            let a = engine.add(
                &engine.mul_scalar(accum_grad, rho)?,
                &engine.mul_scalar(&engine.square(grad)?, 1.0 - rho)?,
            )?;
            let rms_update = engine.sqrt(&engine.add_scalar(accum_update, EPSILON)?)?;
            let rms_grad = engine.sqrt(&engine.add_scalar(&a, EPSILON)?)?;
            let update = engine.mul(&engine.div(&rms_update, &rms_grad)?, grad)?;
            let au = engine.add(
                &engine.mul_scalar(accum_update, rho)?,
                &engine.mul_scalar(&engine.square(&update)?, 1.0 - rho)?,
            )?;

            engine.assign(accum_grad, &a)?;
            engine.assign(accum_update, &au)?;
            assign_sub(engine, var, &engine.mul_scalar(&update, self.lr)?)?;
        }
        Ok(())
    }

    fn dispose(&mut self, engine: &Engine<B>) -> Result<()> {
        self.slots.dispose(engine)
    }
}
