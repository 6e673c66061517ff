//! The closed table of tensor operations.
//!
//! Each [`Op`] variant owns three things: shape/dtype inference (run before any
//! kernel, see [`Op::infer`]), a kernel dispatch (`kernel.rs`) and a gradient
//! function (`gradient_fns.rs`).

use crate::backend::{BinaryOp, CompareOp, Conv1dGeometry, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Padding policy of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Output width is `ceil(in_width / stride)`.
    Same,
    /// No padding; only full windows.
    Valid,
    /// Explicit zero padding on both sides.
    Explicit(usize),
}

/// Hyper-parameters of a 1-D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv1dSpec {
    pub stride: usize,
    pub dilation: usize,
    pub pad: Padding,
}

impl Conv1dSpec {
    pub fn new(stride: usize, pad: Padding, dilation: usize) -> Self {
        Conv1dSpec { stride, dilation, pad }
    }

    /// Resolve output size and padding for an input and filter shape.
    pub fn geometry(&self, input: &Shape, filter: &Shape) -> Result<Conv1dGeometry> {
        let invalid = |message: String| Error::InvalidArgument { op: "conv1d", message };

        if input.ndim() != 3 {
            return Err(invalid(format!("input must be rank 3 [batch, width, channels], got {input}")));
        }
        if filter.ndim() != 3 {
            return Err(invalid(format!(
                "filter must be rank 3 [width, in_channels, out_channels], got {filter}"
            )));
        }
        if input.dim(2) != filter.dim(1) {
            return Err(Error::ShapeMismatch {
                op: "conv1d",
                lhs: input.clone(),
                rhs: filter.clone(),
            });
        }
        if self.stride == 0 || self.dilation == 0 {
            return Err(invalid("stride and dilation must be at least 1".into()));
        }
        if self.stride > 1 && self.dilation > 1 {
            return Err(invalid(format!(
                "stride ({}) and dilation ({}) cannot both be greater than 1",
                self.stride, self.dilation
            )));
        }

        let in_width = input.dim(1);
        let filter_width = filter.dim(0);
        let effective = (filter_width.max(1) - 1) * self.dilation + 1;
        let stride = self.stride;

        let (out_width, pad_left) = match self.pad {
            Padding::Same => {
                let out = in_width.div_ceil(stride);
                let total = ((out.max(1) - 1) * stride + effective).saturating_sub(in_width);
                (out, total / 2)
            }
            Padding::Valid => {
                if in_width < effective {
                    return Err(invalid(format!(
                        "filter of effective width {effective} does not fit input width {in_width}"
                    )));
                }
                ((in_width - effective + 1).div_ceil(stride), 0)
            }
            Padding::Explicit(pad) => {
                let padded = in_width + 2 * pad;
                if padded < effective {
                    return Err(invalid(format!(
                        "filter of effective width {effective} does not fit padded width {padded}"
                    )));
                }
                ((padded - effective) / stride + 1, pad)
            }
        };

        Ok(Conv1dGeometry {
            batch: input.dim(0),
            in_width,
            in_channels: input.dim(2),
            filter_width,
            out_channels: filter.dim(2),
            out_width,
            stride,
            dilation: self.dilation,
            pad_left,
        })
    }
}

/// A primitive operation. All operations produce exactly one output.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Compare(CompareOp),
    /// Inputs: `[cond, a, b]`.
    Select,
    Cast(DType),
    Reduce {
        op: ReduceOp,
        axes: Vec<usize>,
        keepdims: bool,
    },
    ArgMax {
        axis: usize,
    },
    MatMul,
    Reshape(Shape),
    Transpose(Vec<usize>),
    BroadcastTo(Shape),
    /// Sum a broadcast tensor back down to a shape that broadcasts to it.
    SumTo(Shape),
    /// Inputs: `[x, filter]`.
    Conv1d(Conv1dSpec),
    /// Inputs: `[dy, filter]`.
    Conv1dBackpropInput {
        input_shape: Shape,
        spec: Conv1dSpec,
    },
    /// Inputs: `[x, dy]`.
    Conv1dBackpropFilter {
        filter_shape: Shape,
        spec: Conv1dSpec,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Unary(op) => op.name(),
            Op::Binary(op) => op.name(),
            Op::Compare(op) => op.name(),
            Op::Select => "select",
            Op::Cast(_) => "cast",
            Op::Reduce { op, .. } => op.name(),
            Op::ArgMax { .. } => "arg_max",
            Op::MatMul => "matmul",
            Op::Reshape(_) => "reshape",
            Op::Transpose(_) => "transpose",
            Op::BroadcastTo(_) => "broadcast_to",
            Op::SumTo(_) => "sum_to",
            Op::Conv1d(_) => "conv1d",
            Op::Conv1dBackpropInput { .. } => "conv1d_backprop_input",
            Op::Conv1dBackpropFilter { .. } => "conv1d_backprop_filter",
        }
    }

    /// Number of input tensors.
    pub fn arity(&self) -> usize {
        match self {
            Op::Select => 3,
            Op::Binary(_)
            | Op::Compare(_)
            | Op::MatMul
            | Op::Conv1d(_)
            | Op::Conv1dBackpropInput { .. }
            | Op::Conv1dBackpropFilter { .. } => 2,
            _ => 1,
        }
    }

    /// Validate inputs and compute the output shape and dtype.
    pub fn infer(&self, inputs: &[&Tensor]) -> Result<(Shape, DType)> {
        let name = self.name();
        if inputs.len() != self.arity() {
            return Err(Error::InvalidArgument {
                op: name,
                message: format!("expected {} inputs, got {}", self.arity(), inputs.len()),
            });
        }

        match self {
            Op::Unary(_) => {
                expect_dtype(name, inputs[0], DType::F32)?;
                Ok((inputs[0].shape().clone(), DType::F32))
            }

            Op::Binary(op) => {
                let dtype = match (*op, inputs[0].dtype()) {
                    (BinaryOp::Div | BinaryOp::Pow, _) | (_, DType::Bool) => DType::F32,
                    (_, dtype) => dtype,
                };
                expect_dtype(name, inputs[0], dtype)?;
                expect_dtype(name, inputs[1], dtype)?;
                Ok((broadcast(name, inputs[0].shape(), inputs[1].shape())?, dtype))
            }

            Op::Compare(_) => {
                if inputs[0].dtype() == DType::Bool {
                    return Err(Error::DTypeMismatch {
                        op: name,
                        expected: DType::F32,
                        found: DType::Bool,
                    });
                }
                expect_dtype(name, inputs[1], inputs[0].dtype())?;
                Ok((broadcast(name, inputs[0].shape(), inputs[1].shape())?, DType::Bool))
            }

            Op::Select => {
                let (cond, a, b) = (inputs[0], inputs[1], inputs[2]);
                expect_dtype(name, cond, DType::Bool)?;
                expect_dtype(name, b, a.dtype())?;
                let ab = broadcast(name, a.shape(), b.shape())?;
                Ok((broadcast(name, cond.shape(), &ab)?, a.dtype()))
            }

            Op::Cast(dtype) => Ok((inputs[0].shape().clone(), *dtype)),

            Op::Reduce { axes, keepdims, .. } => {
                expect_dtype(name, inputs[0], DType::F32)?;
                check_axes(name, inputs[0].shape(), axes)?;
                Ok((inputs[0].shape().reduced(axes, *keepdims), DType::F32))
            }

            Op::ArgMax { axis } => {
                expect_dtype(name, inputs[0], DType::F32)?;
                check_axes(name, inputs[0].shape(), &[*axis])?;
                Ok((inputs[0].shape().reduced(&[*axis], false), DType::I32))
            }

            Op::MatMul => {
                let (a, b) = (inputs[0].shape(), inputs[1].shape());
                expect_dtype(name, inputs[0], DType::F32)?;
                expect_dtype(name, inputs[1], DType::F32)?;
                matmul_shape(a, b)
                    .map(|shape| (shape, DType::F32))
                    .ok_or_else(|| Error::ShapeMismatch {
                        op: name,
                        lhs: a.clone(),
                        rhs: b.clone(),
                    })
            }

            Op::Reshape(shape) => {
                if shape.numel() != inputs[0].numel() {
                    return Err(Error::ShapeMismatch {
                        op: name,
                        lhs: inputs[0].shape().clone(),
                        rhs: shape.clone(),
                    });
                }
                Ok((shape.clone(), inputs[0].dtype()))
            }

            Op::Transpose(perm) => {
                let shape = inputs[0].shape();
                let mut seen = vec![false; shape.ndim()];
                let valid = perm.len() == shape.ndim()
                    && perm.iter().all(|&p| p < seen.len() && !std::mem::replace(&mut seen[p], true));
                if !valid {
                    return Err(Error::InvalidArgument {
                        op: name,
                        message: format!("{perm:?} is not a permutation of the axes of {shape}"),
                    });
                }
                let dims = perm.iter().map(|&p| shape.dim(p)).collect();
                Ok((Shape::new(dims), inputs[0].dtype()))
            }

            Op::BroadcastTo(shape) => {
                if !inputs[0].shape().broadcasts_to(shape) {
                    return Err(Error::ShapeMismatch {
                        op: name,
                        lhs: inputs[0].shape().clone(),
                        rhs: shape.clone(),
                    });
                }
                Ok((shape.clone(), inputs[0].dtype()))
            }

            Op::SumTo(shape) => {
                expect_dtype(name, inputs[0], DType::F32)?;
                if !shape.broadcasts_to(inputs[0].shape()) {
                    return Err(Error::ShapeMismatch {
                        op: name,
                        lhs: inputs[0].shape().clone(),
                        rhs: shape.clone(),
                    });
                }
                Ok((shape.clone(), DType::F32))
            }

            Op::Conv1d(spec) => {
                expect_dtype(name, inputs[0], DType::F32)?;
                expect_dtype(name, inputs[1], DType::F32)?;
                let geom = spec.geometry(inputs[0].shape(), inputs[1].shape())?;
                Ok((geom.output_shape(), DType::F32))
            }

            Op::Conv1dBackpropInput { input_shape, spec } => {
                let geom = spec.geometry(input_shape, inputs[1].shape())?;
                expect_shape(name, inputs[0].shape(), &geom.output_shape())?;
                Ok((input_shape.clone(), DType::F32))
            }

            Op::Conv1dBackpropFilter { filter_shape, spec } => {
                let geom = spec.geometry(inputs[0].shape(), filter_shape)?;
                expect_shape(name, inputs[1].shape(), &geom.output_shape())?;
                Ok((filter_shape.clone(), DType::F32))
            }
        }
    }
}

fn expect_dtype(op: &'static str, t: &Tensor, expected: DType) -> Result<()> {
    if t.dtype() != expected {
        return Err(Error::DTypeMismatch {
            op,
            expected,
            found: t.dtype(),
        });
    }
    Ok(())
}

fn expect_shape(op: &'static str, found: &Shape, expected: &Shape) -> Result<()> {
    if found != expected {
        return Err(Error::ShapeMismatch {
            op,
            lhs: found.clone(),
            rhs: expected.clone(),
        });
    }
    Ok(())
}

fn broadcast(op: &'static str, a: &Shape, b: &Shape) -> Result<Shape> {
    a.broadcast_with(b).ok_or_else(|| Error::ShapeMismatch {
        op,
        lhs: a.clone(),
        rhs: b.clone(),
    })
}

fn check_axes(op: &'static str, shape: &Shape, axes: &[usize]) -> Result<()> {
    for (i, &axis) in axes.iter().enumerate() {
        if axis >= shape.ndim() || axes[..i].contains(&axis) {
            return Err(Error::InvalidArgument {
                op,
                message: format!("invalid reduction axes {axes:?} for shape {shape}"),
            });
        }
    }
    Ok(())
}

/// Output shape of a batched matmul, or `None` when the operands don't line up.
pub fn matmul_shape(a: &Shape, b: &Shape) -> Option<Shape> {
    let (an, bn) = (a.ndim(), b.ndim());
    if an < 2 || bn < 2 || a.dim(an - 1) != b.dim(bn - 2) {
        return None;
    }
    let a_batch = Shape::from(&a.dims()[..an - 2]);
    let b_batch = Shape::from(&b.dims()[..bn - 2]);
    let mut dims = a_batch.broadcast_with(&b_batch)?.0;
    dims.push(a.dim(an - 2));
    dims.push(b.dim(bn - 1));
    Some(Shape::new(dims))
}
