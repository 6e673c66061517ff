//! Numerical gradients for checking the analytic ones.

use crate::backend::Backend;
use crate::dtype::HostData;
use crate::engine::Engine;
use crate::error::Result;
use crate::tensor::Tensor;

impl<B: Backend> Engine<B> {
    /// Central-difference gradient of the scalar `f(x)` at `x`, one entry per
    /// element of `x`. Nothing is recorded and every temporary is released.
    pub fn finite_diff<F>(&self, f: F, x: &Tensor, eps: f32) -> Result<Vec<f32>>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        let base = self.read_f32(x)?;
        let mut grad = Vec::with_capacity(base.len());

        self.no_grad(|| {
            for i in 0..base.len() {
                let eval_at = |delta: f32| -> Result<f32> {
                    self.scope("finite_diff", || {
                        let mut values = base.clone();
                        values[i] += delta;
                        let probe = self.tensor(HostData::from(values), x.shape())?;
                        let y = f(&probe)?;
                        self.read_scalar(&y)
                    })
                };
                let plus = eval_at(eps)?;
                let minus = eval_at(-eps)?;
                grad.push((plus - minus) / (2.0 * eps));
            }
            Ok(())
        })?;

        Ok(grad)
    }
}
