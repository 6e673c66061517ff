//! Optimizers.
//!
//! Every optimizer follows the same loop: compute the gradients of a scalar
//! loss with respect to the trainable variables, then replace each variable
//! that got a gradient with its updated value through [`Engine::assign`].
//! Only the update rule and its per-variable state differ.

mod adadelta;
mod adagrad;
mod adam;
mod adamax;
mod momentum;
mod rmsprop;
mod sgd;
mod slots;

pub use adadelta::Adadelta;
pub use adagrad::Adagrad;
pub use adam::Adam;
pub use adamax::Adamax;
pub use momentum::Momentum;
pub use rmsprop::RmsProp;
pub use sgd::Sgd;

use tg_tensor::prelude::*;

/// An update rule plus the state it keeps between steps.
pub trait Optimizer<B: Backend> {
    fn name(&self) -> &'static str;

    /// Update each variable from its gradient.
    ///
    /// Temporaries land in the caller's scope; [`minimize`](Self::minimize)
    /// wraps this in one.
    fn apply_gradients(&mut self, engine: &Engine<B>, grads: &[(Variable, Tensor)]) -> Result<()>;

    /// Release every accumulator this optimizer owns.
    fn dispose(&mut self, engine: &Engine<B>) -> Result<()>;

    /// One optimization step on `loss_fn`.
    ///
    /// Gradients are taken with respect to `var_list`, or every trainable
    /// variable when `None`. Variables the loss does not reach are left
    /// alone. Everything created during the step is released except the
    /// cost, which is returned when `return_cost` is set.
    fn minimize(
        &mut self,
        engine: &Engine<B>,
        loss_fn: &dyn Fn() -> Result<Tensor>,
        return_cost: bool,
        var_list: Option<&[Variable]>,
    ) -> Result<Option<Tensor>> {
        engine.scope("minimize", || {
            let (cost, grads) = engine.variable_gradients(loss_fn, var_list)?;
            log::trace!("{}: updating {} variables", self.name(), grads.len());
            engine.no_grad(|| self.apply_gradients(engine, &grads))?;
            Ok(return_cost.then_some(cost))
        })
    }
}

/// `var -= step`, in place.
fn assign_sub<B: Backend>(engine: &Engine<B>, var: &Variable, step: &Tensor) -> Result<()> {
    let next = engine.sub(var, step)?;
    engine.assign(var, &next)
}
