//! Maps each [`Op`] onto the [`Backend`] method that runs it.

use crate::backend::{Backend, ReduceOp};
use crate::error::{Error, Result};
use crate::op::Op;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Run `op` on already validated inputs. `out_shape` comes from [`Op::infer`].
pub(crate) fn dispatch<B: Backend>(
    backend: &B,
    op: &Op,
    inputs: &[&Tensor],
    buffers: &[&B::Buffer],
    out_shape: &Shape,
) -> Result<B::Buffer> {
    let shape = |i: usize| inputs[i].shape();

    match op {
        Op::Unary(u) => backend.unary(*u, buffers[0], out_shape.numel()),
        Op::Binary(b) => backend.binary(*b, buffers[0], shape(0), buffers[1], shape(1), out_shape),
        Op::Compare(c) => backend.compare(*c, buffers[0], shape(0), buffers[1], shape(1), out_shape),
        Op::Select => backend.select(
            buffers[0],
            shape(0),
            buffers[1],
            shape(1),
            buffers[2],
            shape(2),
            out_shape,
        ),
        Op::Cast(to) => {
            let from = inputs[0].dtype();
            if from == *to {
                backend.copy(buffers[0])
            } else {
                backend.cast(buffers[0], from, *to, out_shape.numel())
            }
        }
        Op::Reduce { op, axes, .. } => backend.reduce(*op, buffers[0], shape(0), axes),
        Op::ArgMax { axis } => backend.arg_max(buffers[0], shape(0), *axis),
        Op::MatMul => backend.matmul(buffers[0], shape(0), buffers[1], shape(1), out_shape),
        // Buffers are always contiguous, so a reshape is a plain copy.
        Op::Reshape(_) => backend.copy(buffers[0]),
        Op::Transpose(perm) => backend.transpose(buffers[0], shape(0), perm),
        Op::BroadcastTo(target) => {
            if target == shape(0) {
                backend.copy(buffers[0])
            } else {
                backend.broadcast_to(buffers[0], shape(0), target)
            }
        }
        Op::SumTo(target) => {
            let axes = target.reduction_axes_from(shape(0));
            if axes.is_empty() {
                backend.copy(buffers[0])
            } else {
                backend.reduce(ReduceOp::Sum, buffers[0], shape(0), &axes)
            }
        }
        Op::Conv1d(spec) => {
            let geom = spec.geometry(shape(0), shape(1))?;
            backend.conv1d(buffers[0], buffers[1], &geom)
        }
        Op::Conv1dBackpropInput { input_shape, spec } => {
            let geom = spec.geometry(input_shape, shape(1))?;
            backend.conv1d_backprop_input(buffers[0], buffers[1], &geom)
        }
        Op::Conv1dBackpropFilter { filter_shape, spec } => {
            let geom = spec.geometry(shape(0), filter_shape)?;
            backend.conv1d_backprop_filter(buffers[0], buffers[1], &geom)
        }
    }
    .map_err(|err| match err {
        Error::Unsupported { backend, .. } => Error::Unsupported { op: op.name(), backend },
        other => other,
    })
}
