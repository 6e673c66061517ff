//! Vector-Jacobian products, one rule per [`Op`].
//!
//! Rules are written with engine ops so they are recorded like any other
//! computation; that is what makes gradients of gradients work.

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::Result;
use crate::op::Op;
use crate::tape::OpRecord;
use crate::tensor::Tensor;

/// Gradients of `record`'s inputs given the upstream gradient `dy`.
///
/// Returns one entry per input. `None` means the input gets no gradient,
/// either because the op is not differentiable with respect to it or because
/// `needs_grad` said it is not wanted.
pub(crate) fn vjp<B: Backend>(
    eng: &Engine<B>,
    record: &OpRecord,
    dy: &Tensor,
    needs_grad: &[bool],
) -> Result<Vec<Option<Tensor>>> {
    let x = &record.inputs;
    let y = &record.output;
    let wanted = |i: usize| needs_grad.get(i).copied().unwrap_or(false);

    let grads = match &record.op {
        Op::Unary(op) => vec![Some(unary_grad(eng, *op, &x[0], y, dy)?)],

        // integer arithmetic carries no gradient
        Op::Binary(_) if x[0].dtype() != DType::F32 => vec![None, None],

        Op::Binary(op) => {
            let (da, db) = binary_grad(eng, *op, &x[0], &x[1], y, dy, wanted(0), wanted(1))?;
            vec![da, db]
        }

        Op::Compare(_)
        | Op::ArgMax { .. }
        | Op::Conv1dBackpropInput { .. }
        | Op::Conv1dBackpropFilter { .. } => vec![None; x.len()],

        Op::Select => {
            let (cond, a, b) = (&x[0], &x[1], &x[2]);
            let zero = eng.scalar(0.0)?;
            let da = match wanted(1) {
                true => Some(eng.sum_to(&eng.select(cond, dy, &zero)?, a.shape())?),
                false => None,
            };
            let db = match wanted(2) {
                true => Some(eng.sum_to(&eng.select(cond, &zero, dy)?, b.shape())?),
                false => None,
            };
            vec![None, da, db]
        }

        Op::Cast(to) => match (x[0].dtype(), to) {
            (DType::F32, DType::F32) => vec![Some(eng.cast(dy, DType::F32)?)],
            _ => vec![None],
        },

        Op::Reduce { op, axes, .. } => vec![Some(reduce_grad(eng, *op, axes, &x[0], y, dy)?)],

        Op::MatMul => {
            let (a, b) = (&x[0], &x[1]);
            let da = match wanted(0) {
                true => {
                    let bt = eng.swap_last_axes(b)?;
                    Some(eng.sum_to(&eng.matmul(dy, &bt)?, a.shape())?)
                }
                false => None,
            };
            let db = match wanted(1) {
                true => {
                    let at = eng.swap_last_axes(a)?;
                    Some(eng.sum_to(&eng.matmul(&at, dy)?, b.shape())?)
                }
                false => None,
            };
            vec![da, db]
        }

        Op::Reshape(_) => vec![Some(eng.reshape(dy, x[0].shape())?)],

        Op::Transpose(perm) => {
            let mut inverse = vec![0; perm.len()];
            for (i, &p) in perm.iter().enumerate() {
                inverse[p] = i;
            }
            vec![Some(eng.transpose(dy, Some(&inverse))?)]
        }

        Op::BroadcastTo(_) => vec![Some(eng.sum_to(dy, x[0].shape())?)],

        Op::SumTo(_) => vec![Some(eng.broadcast_to(dy, x[0].shape())?)],

        Op::Conv1d(spec) => {
            let (input, filter) = (&x[0], &x[1]);
            let dx = match wanted(0) {
                true => Some(eng.conv1d_backprop_input(dy, filter, input.shape(), *spec)?),
                false => None,
            };
            let dw = match wanted(1) {
                true => Some(eng.conv1d_backprop_filter(input, dy, filter.shape(), *spec)?),
                false => None,
            };
            vec![dx, dw]
        }
    };
    Ok(grads)
}

fn unary_grad<B: Backend>(eng: &Engine<B>, op: UnaryOp, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor> {
    match op {
        UnaryOp::Neg => eng.neg(dy),
        // sign(x), 0 at the kink
        UnaryOp::Abs => {
            let sign = eng.sub(&eng.step(x, 0.0)?, &eng.step(&eng.neg(x)?, 0.0)?)?;
            eng.mul(dy, &sign)
        }
        // d/dx e^x = e^x = y
        UnaryOp::Exp => eng.mul(dy, y),
        UnaryOp::Log => eng.div(dy, x),
        UnaryOp::Sqrt => eng.div(dy, &eng.mul_scalar(y, 2.0)?),
        UnaryOp::Square => eng.mul(dy, &eng.mul_scalar(x, 2.0)?),
        UnaryOp::Sin => eng.mul(dy, &eng.cos(x)?),
        UnaryOp::Cos => eng.neg(&eng.mul(dy, &eng.sin(x)?)?),
        // 1 - tanh^2
        UnaryOp::Tanh => {
            let one = eng.scalar(1.0)?;
            eng.mul(dy, &eng.sub(&one, &eng.square(y)?)?)
        }
        // y * (1 - y)
        UnaryOp::Sigmoid => eng.mul(dy, &eng.sub(y, &eng.square(y)?)?),
        UnaryOp::Relu => eng.mul(dy, &eng.step(x, 0.0)?),
        UnaryOp::LeakyRelu(alpha) => eng.mul(dy, &eng.step(x, alpha)?),
        // e^x = y + 1 on the negative side
        UnaryOp::Elu => {
            let positive = eng.greater(x, &eng.scalar(0.0)?)?;
            let negative = eng.mul(dy, &eng.add_scalar(y, 1.0)?)?;
            eng.select(&positive, dy, &negative)
        }
        UnaryOp::Step(_) => eng.zeros_like(x),
    }
}

#[allow(clippy::too_many_arguments)]
fn binary_grad<B: Backend>(
    eng: &Engine<B>,
    op: BinaryOp,
    a: &Tensor,
    b: &Tensor,
    y: &Tensor,
    dy: &Tensor,
    want_a: bool,
    want_b: bool,
) -> Result<(Option<Tensor>, Option<Tensor>)> {
    // Each closure yields the full-size contribution; `sum_to` folds any broadcast.
    let grad = |want: bool, target: &Tensor, f: &dyn Fn() -> Result<Tensor>| -> Result<Option<Tensor>> {
        if !want {
            return Ok(None);
        }
        Ok(Some(eng.sum_to(&f()?, target.shape())?))
    };

    match op {
        BinaryOp::Add => Ok((
            grad(want_a, a, &|| Ok(dy.clone()))?,
            grad(want_b, b, &|| Ok(dy.clone()))?,
        )),
        BinaryOp::Sub => Ok((
            grad(want_a, a, &|| Ok(dy.clone()))?,
            grad(want_b, b, &|| eng.neg(dy))?,
        )),
        BinaryOp::Mul => Ok((
            grad(want_a, a, &|| eng.mul(dy, b))?,
            grad(want_b, b, &|| eng.mul(dy, a))?,
        )),
        BinaryOp::Div => Ok((
            grad(want_a, a, &|| eng.div(dy, b))?,
            grad(want_b, b, &|| {
                let num = eng.mul(dy, a)?;
                eng.neg(&eng.div(&num, &eng.square(b)?)?)
            })?,
        )),
        // d/da a^b = b a^(b-1), d/db a^b = a^b ln a
        BinaryOp::Pow => Ok((
            grad(want_a, a, &|| {
                let exponent = eng.add_scalar(b, -1.0)?;
                let scale = eng.mul(b, &eng.pow(a, &exponent)?)?;
                eng.mul(dy, &scale)
            })?,
            grad(want_b, b, &|| eng.mul(dy, &eng.mul(y, &eng.log(a)?)?))?,
        )),
        // Ties send the gradient to `a`.
        BinaryOp::Maximum => Ok((
            grad(want_a, a, &|| masked(eng, dy, &eng.greater_equal(a, b)?))?,
            grad(want_b, b, &|| masked(eng, dy, &eng.less(a, b)?))?,
        )),
        BinaryOp::Minimum => Ok((
            grad(want_a, a, &|| masked(eng, dy, &eng.less_equal(a, b)?))?,
            grad(want_b, b, &|| masked(eng, dy, &eng.greater(a, b)?))?,
        )),
    }
}

fn masked<B: Backend>(eng: &Engine<B>, dy: &Tensor, mask: &Tensor) -> Result<Tensor> {
    eng.mul(dy, &eng.cast(mask, DType::F32)?)
}

fn reduce_grad<B: Backend>(
    eng: &Engine<B>,
    op: ReduceOp,
    axes: &[usize],
    x: &Tensor,
    y: &Tensor,
    dy: &Tensor,
) -> Result<Tensor> {
    let kept = x.shape().reduced(axes, true);
    let dy = eng.reshape(dy, &kept)?;
    match op {
        ReduceOp::Sum => eng.broadcast_to(&dy, x.shape()),
        ReduceOp::Mean => {
            let count: usize = axes.iter().map(|&axis| x.shape().dim(axis)).product();
            let spread = eng.broadcast_to(&dy, x.shape())?;
            eng.mul_scalar(&spread, 1.0 / count.max(1) as f32)
        }
        // Every element equal to the extreme receives the full gradient.
        ReduceOp::Max | ReduceOp::Min => {
            let y = eng.reshape(y, &kept)?;
            let mask = eng.cast(&eng.equal(x, &y)?, DType::F32)?;
            eng.mul(&mask, &dy)
        }
    }
}
