//! # tg_backend_cpu - Reference CPU Backend
//!
//! Straightforward host implementation of every kernel in [`Backend`]. Buffers
//! are plain [`HostData`] vectors, so `read` never blocks. Other backends are
//! checked against this one, and fall back to it for kernels their device
//! cannot run.

use tg_tensor::backend::{Backend, BinaryOp, CompareOp, Conv1dGeometry, ReduceOp, UnaryOp};
use tg_tensor::{DType, Error, HostData, Result, Shape, ShapeIndices};

/// CPU backend. Stateless; every kernel allocates its output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Buffer = HostData;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn upload(&self, data: HostData) -> Result<HostData> {
        Ok(data)
    }

    fn read(&self, buffer: &HostData) -> Result<HostData> {
        Ok(buffer.clone())
    }

    fn copy(&self, buffer: &HostData) -> Result<HostData> {
        Ok(buffer.clone())
    }

    // === Element-wise ===

    fn unary(&self, op: UnaryOp, x: &HostData, _len: usize) -> Result<HostData> {
        let x = floats(x, op.name())?;
        Ok(HostData::F32(x.iter().map(|&v| unary_scalar(op, v)).collect()))
    }

    fn binary(
        &self,
        op: BinaryOp,
        a: &HostData,
        a_shape: &Shape,
        b: &HostData,
        b_shape: &Shape,
        out_shape: &Shape,
    ) -> Result<HostData> {
        let ia = broadcast_indices(a_shape, out_shape);
        let ib = broadcast_indices(b_shape, out_shape);
        match (a, b) {
            (HostData::F32(a), HostData::F32(b)) => {
                let data = ia.iter().zip(&ib).map(|(&i, &j)| binary_scalar(op, a[i], b[j])).collect();
                Ok(HostData::F32(data))
            }
            (HostData::I32(a), HostData::I32(b)) => {
                let data = ia
                    .iter()
                    .zip(&ib)
                    .map(|(&i, &j)| binary_int(op, a[i], b[j]))
                    .collect::<Option<Vec<_>>>()
                    .ok_or(Error::DTypeMismatch {
                        op: op.name(),
                        expected: DType::F32,
                        found: DType::I32,
                    })?;
                Ok(HostData::I32(data))
            }
            (HostData::Bool(_), _) => Err(Error::DTypeMismatch {
                op: op.name(),
                expected: DType::F32,
                found: DType::Bool,
            }),
            _ => Err(mismatch(op.name(), a, b)),
        }
    }

    fn compare(
        &self,
        op: CompareOp,
        a: &HostData,
        a_shape: &Shape,
        b: &HostData,
        b_shape: &Shape,
        out_shape: &Shape,
    ) -> Result<HostData> {
        let ia = broadcast_indices(a_shape, out_shape);
        let ib = broadcast_indices(b_shape, out_shape);
        let data = match (a, b) {
            (HostData::F32(a), HostData::F32(b)) => compare_with(op, a, b, &ia, &ib),
            (HostData::I32(a), HostData::I32(b)) => compare_with(op, a, b, &ia, &ib),
            _ => return Err(mismatch(op.name(), a, b)),
        };
        Ok(HostData::Bool(data))
    }

    fn select(
        &self,
        cond: &HostData,
        cond_shape: &Shape,
        a: &HostData,
        a_shape: &Shape,
        b: &HostData,
        b_shape: &Shape,
        out_shape: &Shape,
    ) -> Result<HostData> {
        let cond = cond.as_bool().ok_or(Error::DTypeMismatch {
            op: "select",
            expected: DType::Bool,
            found: cond.dtype(),
        })?;
        let ic = broadcast_indices(cond_shape, out_shape);
        let ia = broadcast_indices(a_shape, out_shape);
        let ib = broadcast_indices(b_shape, out_shape);
        let pick = |i: usize| (cond[ic[i]], ia[i], ib[i]);

        let n = out_shape.numel();
        Ok(match (a, b) {
            (HostData::F32(a), HostData::F32(b)) => HostData::F32(
                (0..n)
                    .map(pick)
                    .map(|(c, i, j)| if c { a[i] } else { b[j] })
                    .collect(),
            ),
            (HostData::I32(a), HostData::I32(b)) => HostData::I32(
                (0..n)
                    .map(pick)
                    .map(|(c, i, j)| if c { a[i] } else { b[j] })
                    .collect(),
            ),
            (HostData::Bool(a), HostData::Bool(b)) => HostData::Bool(
                (0..n)
                    .map(pick)
                    .map(|(c, i, j)| if c { a[i] } else { b[j] })
                    .collect(),
            ),
            _ => return Err(mismatch("select", a, b)),
        })
    }

    fn cast(&self, x: &HostData, _from: DType, to: DType, _len: usize) -> Result<HostData> {
        Ok(x.cast(to))
    }

    // === Reductions ===

    fn reduce(&self, op: ReduceOp, x: &HostData, shape: &Shape, axes: &[usize]) -> Result<HostData> {
        let x = floats(x, op.name())?;
        let data = match op {
            ReduceOp::Sum => reduce_op(x, shape, axes, 0.0, |acc, v| acc + v),
            ReduceOp::Mean => {
                let count: usize = axes.iter().map(|&axis| shape.dim(axis)).product();
                let mut sums = reduce_op(x, shape, axes, 0.0, |acc, v| acc + v);
                for s in &mut sums {
                    *s /= count as f32;
                }
                sums
            }
            ReduceOp::Max => reduce_op(x, shape, axes, f32::NEG_INFINITY, f32::max),
            ReduceOp::Min => reduce_op(x, shape, axes, f32::INFINITY, f32::min),
        };
        Ok(HostData::F32(data))
    }

    fn arg_max(&self, x: &HostData, shape: &Shape, axis: usize) -> Result<HostData> {
        let x = floats(x, "arg_max")?;
        let kept = shape.reduced(&[axis], true);
        let targets = broadcast_indices(&kept, shape);

        let mut best = vec![f32::NEG_INFINITY; kept.numel()];
        let mut arg = vec![0i32; kept.numel()];
        for (i, idx) in ShapeIndices::new(shape).enumerate() {
            let t = targets[i];
            // strict comparison keeps the first maximum
            if x[i] > best[t] {
                best[t] = x[i];
                arg[t] = idx[axis] as i32;
            }
        }
        Ok(HostData::I32(arg))
    }

    // === Linear algebra ===

    fn matmul(
        &self,
        a: &HostData,
        a_shape: &Shape,
        b: &HostData,
        b_shape: &Shape,
        out_shape: &Shape,
    ) -> Result<HostData> {
        let (a, b) = (floats(a, "matmul")?, floats(b, "matmul")?);
        Ok(HostData::F32(matmul_impl(a, a_shape, b, b_shape, out_shape)))
    }

    // === Layout ===

    fn transpose(&self, x: &HostData, shape: &Shape, perm: &[usize]) -> Result<HostData> {
        let src = shape.contiguous_strides();
        let out_shape = Shape::new(perm.iter().map(|&p| shape.dim(p)).collect());
        let indices: Vec<usize> = ShapeIndices::new(&out_shape)
            .map(|idx| idx.iter().zip(perm).map(|(&i, &p)| i * src.0[p]).sum())
            .collect();
        Ok(x.gather(&indices))
    }

    fn broadcast_to(&self, x: &HostData, shape: &Shape, out_shape: &Shape) -> Result<HostData> {
        Ok(x.gather(&broadcast_indices(shape, out_shape)))
    }

    // === Convolution ===

    fn conv1d(&self, x: &HostData, filter: &HostData, g: &Conv1dGeometry) -> Result<HostData> {
        let (x, f) = (floats(x, "conv1d")?, floats(filter, "conv1d")?);
        let (ci, co) = (g.in_channels, g.out_channels);
        let mut out = vec![0.0f32; g.output_shape().numel()];

        for b in 0..g.batch {
            for o in 0..g.out_width {
                for k in 0..g.filter_width {
                    let Some(col) = g.input_column(o, k) else {
                        continue;
                    };
                    for c in 0..ci {
                        let xv = x[(b * g.in_width + col) * ci + c];
                        for d in 0..co {
                            out[(b * g.out_width + o) * co + d] += xv * f[(k * ci + c) * co + d];
                        }
                    }
                }
            }
        }
        Ok(HostData::F32(out))
    }

    fn conv1d_backprop_input(&self, dy: &HostData, filter: &HostData, g: &Conv1dGeometry) -> Result<HostData> {
        let (dy, f) = (
            floats(dy, "conv1d_backprop_input")?,
            floats(filter, "conv1d_backprop_input")?,
        );
        let (ci, co) = (g.in_channels, g.out_channels);
        let mut dx = vec![0.0f32; g.input_shape().numel()];

        for b in 0..g.batch {
            for o in 0..g.out_width {
                for k in 0..g.filter_width {
                    let Some(col) = g.input_column(o, k) else {
                        continue;
                    };
                    for c in 0..ci {
                        let mut acc = 0.0;
                        for d in 0..co {
                            acc += dy[(b * g.out_width + o) * co + d] * f[(k * ci + c) * co + d];
                        }
                        dx[(b * g.in_width + col) * ci + c] += acc;
                    }
                }
            }
        }
        Ok(HostData::F32(dx))
    }

    fn conv1d_backprop_filter(&self, x: &HostData, dy: &HostData, g: &Conv1dGeometry) -> Result<HostData> {
        let (x, dy) = (
            floats(x, "conv1d_backprop_filter")?,
            floats(dy, "conv1d_backprop_filter")?,
        );
        let (ci, co) = (g.in_channels, g.out_channels);
        let mut dw = vec![0.0f32; g.filter_shape().numel()];

        for b in 0..g.batch {
            for o in 0..g.out_width {
                for k in 0..g.filter_width {
                    let Some(col) = g.input_column(o, k) else {
                        continue;
                    };
                    for c in 0..ci {
                        let xv = x[(b * g.in_width + col) * ci + c];
                        for d in 0..co {
                            dw[(k * ci + c) * co + d] += xv * dy[(b * g.out_width + o) * co + d];
                        }
                    }
                }
            }
        }
        Ok(HostData::F32(dw))
    }
}

fn floats<'a>(data: &'a HostData, op: &'static str) -> Result<&'a [f32]> {
    data.as_f32().ok_or(Error::DTypeMismatch {
        op,
        expected: DType::F32,
        found: data.dtype(),
    })
}

fn mismatch(op: &'static str, a: &HostData, b: &HostData) -> Error {
    Error::DTypeMismatch {
        op,
        expected: a.dtype(),
        found: b.dtype(),
    }
}

fn unary_scalar(op: UnaryOp, v: f32) -> f32 {
    match op {
        UnaryOp::Neg => -v,
        UnaryOp::Abs => v.abs(),
        UnaryOp::Exp => v.exp(),
        UnaryOp::Log => v.ln(),
        UnaryOp::Sqrt => v.sqrt(),
        UnaryOp::Square => v * v,
        UnaryOp::Sin => v.sin(),
        UnaryOp::Cos => v.cos(),
        UnaryOp::Tanh => v.tanh(),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-v).exp()),
        UnaryOp::Relu => v.max(0.0),
        UnaryOp::Elu => {
            if v > 0.0 {
                v
            } else {
                v.exp() - 1.0
            }
        }
        UnaryOp::LeakyRelu(alpha) => {
            if v > 0.0 {
                v
            } else {
                alpha * v
            }
        }
        UnaryOp::Step(alpha) => {
            if v > 0.0 {
                1.0
            } else {
                alpha
            }
        }
    }
}

fn binary_scalar(op: BinaryOp, a: f32, b: f32) -> f32 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Pow => a.powf(b),
        BinaryOp::Maximum => a.max(b),
        BinaryOp::Minimum => a.min(b),
    }
}

/// Integer arithmetic wraps on overflow. `None` for the float-only ops.
fn binary_int(op: BinaryOp, a: i32, b: i32) -> Option<i32> {
    match op {
        BinaryOp::Add => Some(a.wrapping_add(b)),
        BinaryOp::Sub => Some(a.wrapping_sub(b)),
        BinaryOp::Mul => Some(a.wrapping_mul(b)),
        BinaryOp::Maximum => Some(a.max(b)),
        BinaryOp::Minimum => Some(a.min(b)),
        BinaryOp::Div | BinaryOp::Pow => None,
    }
}

fn compare_with<T: PartialOrd + Copy>(op: CompareOp, a: &[T], b: &[T], ia: &[usize], ib: &[usize]) -> Vec<bool> {
    ia.iter()
        .zip(ib)
        .map(|(&i, &j)| {
            let (x, y) = (a[i], b[j]);
            match op {
                CompareOp::Greater => x > y,
                CompareOp::GreaterEqual => x >= y,
                CompareOp::Less => x < y,
                CompareOp::LessEqual => x <= y,
                CompareOp::Equal => x == y,
            }
        })
        .collect()
}

/// For every element of `out`, the flat index it reads from a tensor of
/// `shape` broadcast to `out`.
fn broadcast_indices(shape: &Shape, out: &Shape) -> Vec<usize> {
    if shape == out {
        return (0..out.numel()).collect();
    }
    let strides = shape.broadcast_strides(out);
    ShapeIndices::new(out)
        .map(|idx| idx.iter().zip(&strides).map(|(i, s)| i * s).sum())
        .collect()
}

/// Fold `axes` of `x` with `op`. The output keeps the remaining axes in order.
fn reduce_op<F>(x: &[f32], shape: &Shape, axes: &[usize], init: f32, op: F) -> Vec<f32>
where
    F: Fn(f32, f32) -> f32,
{
    let kept = shape.reduced(axes, true);
    let mut data = vec![init; kept.numel()];

    // Reading the kept shape broadcast to the input maps each input
    // element onto the output slot it folds into.
    for (i, target) in broadcast_indices(&kept, shape).into_iter().enumerate() {
        data[target] = op(data[target], x[i]);
    }
    data
}

/// Batched matrix multiplication: (..., M, K) @ (..., K, N) -> (..., M, N).
fn matmul_impl(a: &[f32], a_shape: &Shape, b: &[f32], b_shape: &Shape, out_shape: &Shape) -> Vec<f32> {
    let (a_ndim, b_ndim, out_ndim) = (a_shape.ndim(), b_shape.ndim(), out_shape.ndim());
    let m = a_shape.dim(a_ndim - 2);
    let k = a_shape.dim(a_ndim - 1);
    let n = b_shape.dim(b_ndim - 1);

    let batch_shape = Shape::from(&out_shape.dims()[..out_ndim - 2]);
    let mut data = vec![0.0f32; out_shape.numel()];

    for (batch_idx, batch_indices) in ShapeIndices::new(&batch_shape).enumerate() {
        let a_offset = batch_offset(a_shape, &batch_indices, m * k);
        let b_offset = batch_offset(b_shape, &batch_indices, k * n);
        let out_offset = batch_idx * m * n;

        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0;
                for l in 0..k {
                    sum += a[a_offset + i * k + l] * b[b_offset + l * n + j];
                }
                data[out_offset + i * n + j] = sum;
            }
        }
    }
    data
}

/// Offset of the matrix selected by `batch_indices` in a (possibly
/// broadcast) batched operand.
fn batch_offset(shape: &Shape, batch_indices: &[usize], matrix_size: usize) -> usize {
    let t_batch_ndim = shape.ndim() - 2;
    let offset = batch_indices.len() - t_batch_ndim;

    let mut idx = 0;
    let mut stride = matrix_size;
    for i in (0..t_batch_ndim).rev() {
        let dim = shape.dim(i);
        // broadcast dimension: always the first matrix
        let actual = if dim == 1 { 0 } else { batch_indices[offset + i] };
        idx += actual * stride;
        stride *= dim;
    }
    idx
}
