//! Activation functions.

use tg_tensor::prelude::*;

/// Element-wise activation with a closed-form derivative.
///
/// The derivative is expressed with engine ops so it works on any backend
/// and can itself be recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Tanh,
    Relu,
    /// Slope used for negative inputs.
    LeakyRelu(f32),
    Sigmoid,
    Square,
    Elu,
}

impl Activation {
    pub fn name(self) -> &'static str {
        match self {
            Activation::Tanh => "tanh",
            Activation::Relu => "relu",
            Activation::LeakyRelu(_) => "leaky_relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Square => "square",
            Activation::Elu => "elu",
        }
    }

    pub fn output<B: Backend>(self, engine: &Engine<B>, x: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Tanh => engine.tanh(x),
            Activation::Relu => engine.relu(x),
            Activation::LeakyRelu(alpha) => engine.leaky_relu(x, alpha),
            Activation::Sigmoid => engine.sigmoid(x),
            Activation::Square => engine.square(x),
            Activation::Elu => engine.elu(x),
        }
    }

    /// `dy/dx` at `x`, given `y = self.output(x)`.
    pub fn derivative<B: Backend>(self, engine: &Engine<B>, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        engine.scope("activation_derivative", || match self {
            // 1 - y^2
            Activation::Tanh => {
                let one = engine.ones_like(y)?;
                engine.sub(&one, &engine.square(y)?)
            }
            Activation::Relu => engine.step(x, 0.0),
            Activation::LeakyRelu(alpha) => engine.step(x, alpha),
            // y - y^2
            Activation::Sigmoid => engine.sub(y, &engine.square(y)?),
            Activation::Square => engine.mul_scalar(x, 2.0),
            // 1 for x > 0, e^x elsewhere
            Activation::Elu => {
                let positive = engine.step(x, 0.0)?;
                let negative = engine.sub(&engine.ones_like(&positive)?, &positive)?;
                engine.add(&positive, &engine.mul(&negative, &engine.exp(x)?)?)
            }
        })
    }
}

fn last_axis(op: &'static str, x: &Tensor) -> Result<usize> {
    x.ndim().checked_sub(1).ok_or_else(|| Error::InvalidArgument {
        op,
        message: "needs a tensor of rank 1 or more".to_string(),
    })
}

/// `x - max(x)` along `axis`. The shift is a constant for differentiation.
fn shift_by_max<B: Backend>(engine: &Engine<B>, x: &Tensor, axis: usize) -> Result<Tensor> {
    let x_max = engine.no_grad(|| engine.max(x, Some(&[axis]), true))?;
    engine.sub(x, &x_max)
}

/// Softmax along the last axis, computed as `exp(x - max) / sum(exp(x - max))`.
pub fn softmax<B: Backend>(engine: &Engine<B>, x: &Tensor) -> Result<Tensor> {
    let axis = last_axis("softmax", x)?;
    engine.scope("softmax", || {
        let e = engine.exp(&shift_by_max(engine, x, axis)?)?;
        let total = engine.sum(&e, Some(&[axis]), true)?;
        engine.div(&e, &total)
    })
}

/// `log(softmax(x))` along the last axis, without forming the softmax.
pub fn log_softmax<B: Backend>(engine: &Engine<B>, x: &Tensor) -> Result<Tensor> {
    let axis = last_axis("log_softmax", x)?;
    engine.scope("log_softmax", || {
        let shifted = shift_by_max(engine, x, axis)?;
        let log_sum = engine.log(&engine.sum(&engine.exp(&shifted)?, Some(&[axis]), true)?)?;
        engine.sub(&shifted, &log_sum)
    })
}
