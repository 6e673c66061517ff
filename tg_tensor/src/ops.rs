//! Named tensor operations on [`Engine`].
//!
//! Each method builds an [`Op`] and hands it to [`Engine::execute`]. Every
//! call returns a fresh tensor, even when the result equals an input.

use crate::backend::{Backend, BinaryOp, CompareOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::Result;
use crate::op::{Conv1dSpec, Op, Padding};
use crate::shape::Shape;
use crate::tensor::Tensor;

macro_rules! unary_ops {
    ($($(#[$doc:meta])* $name:ident => $op:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&self, x: &Tensor) -> Result<Tensor> {
                self.execute(Op::Unary(UnaryOp::$op), &[x])
            }
        )*
    };
}

macro_rules! binary_ops {
    ($($(#[$doc:meta])* $name:ident => $op:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
                self.execute(Op::Binary(BinaryOp::$op), &[a, b])
            }
        )*
    };
}

macro_rules! compare_ops {
    ($($name:ident => $op:ident;)*) => {
        $(
            pub fn $name(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
                self.execute(Op::Compare(CompareOp::$op), &[a, b])
            }
        )*
    };
}

impl<B: Backend> Engine<B> {
    // === Element-wise ===

    unary_ops! {
        /// -x
        neg => Neg;
        abs => Abs;
        exp => Exp;
        /// Natural logarithm.
        log => Log;
        sqrt => Sqrt;
        square => Square;
        sin => Sin;
        cos => Cos;
        tanh => Tanh;
        /// 1 / (1 + e^-x)
        sigmoid => Sigmoid;
        relu => Relu;
        /// x for x > 0, e^x - 1 elsewhere.
        elu => Elu;
    }

    pub fn leaky_relu(&self, x: &Tensor, alpha: f32) -> Result<Tensor> {
        self.execute(Op::Unary(UnaryOp::LeakyRelu(alpha)), &[x])
    }

    /// 1 where x > 0, `alpha` elsewhere.
    pub fn step(&self, x: &Tensor, alpha: f32) -> Result<Tensor> {
        self.execute(Op::Unary(UnaryOp::Step(alpha)), &[x])
    }

    binary_ops! {
        add => Add;
        sub => Sub;
        mul => Mul;
        div => Div;
        /// a^b
        pow => Pow;
        maximum => Maximum;
        minimum => Minimum;
    }

    pub fn add_scalar(&self, x: &Tensor, value: f32) -> Result<Tensor> {
        let s = self.scalar(value)?;
        self.add(x, &s)
    }

    pub fn mul_scalar(&self, x: &Tensor, value: f32) -> Result<Tensor> {
        let s = self.scalar(value)?;
        self.mul(x, &s)
    }

    pub fn pow_scalar(&self, x: &Tensor, exponent: f32) -> Result<Tensor> {
        let s = self.scalar(exponent)?;
        self.pow(x, &s)
    }

    compare_ops! {
        greater => Greater;
        greater_equal => GreaterEqual;
        less => Less;
        less_equal => LessEqual;
        equal => Equal;
    }

    /// Element-wise `cond ? a : b`, broadcasting all three.
    pub fn select(&self, cond: &Tensor, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.execute(Op::Select, &[cond, a, b])
    }

    pub fn cast(&self, x: &Tensor, dtype: DType) -> Result<Tensor> {
        self.execute(Op::Cast(dtype), &[x])
    }

    // === Reductions ===

    fn reduce(&self, op: ReduceOp, x: &Tensor, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        let axes = match axes {
            Some(axes) => axes.to_vec(),
            None => (0..x.ndim()).collect(),
        };
        self.execute(Op::Reduce { op, axes, keepdims }, &[x])
    }

    /// Sum over `axes`, or over everything when `axes` is `None`.
    pub fn sum(&self, x: &Tensor, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Sum, x, axes, keepdims)
    }

    pub fn mean(&self, x: &Tensor, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Mean, x, axes, keepdims)
    }

    pub fn max(&self, x: &Tensor, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Max, x, axes, keepdims)
    }

    pub fn min(&self, x: &Tensor, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Min, x, axes, keepdims)
    }

    /// Index of the largest element along `axis` (first one on ties), as int32.
    pub fn arg_max(&self, x: &Tensor, axis: usize) -> Result<Tensor> {
        self.execute(Op::ArgMax { axis }, &[x])
    }

    // === Linear algebra ===

    /// Batched matrix product over the last two axes.
    pub fn matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.execute(Op::MatMul, &[a, b])
    }

    // === Layout ===

    pub fn reshape(&self, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        self.execute(Op::Reshape(shape.into()), &[x])
    }

    /// Permute axes. `None` reverses them.
    pub fn transpose(&self, x: &Tensor, perm: Option<&[usize]>) -> Result<Tensor> {
        let perm = match perm {
            Some(perm) => perm.to_vec(),
            None => (0..x.ndim()).rev().collect(),
        };
        self.execute(Op::Transpose(perm), &[x])
    }

    /// Swap the two innermost axes; a matrix transpose for every batch entry.
    pub fn swap_last_axes(&self, x: &Tensor) -> Result<Tensor> {
        let n = x.ndim();
        let mut perm: Vec<usize> = (0..n).collect();
        if n >= 2 {
            perm.swap(n - 1, n - 2);
        }
        self.execute(Op::Transpose(perm), &[x])
    }

    pub fn broadcast_to(&self, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        self.execute(Op::BroadcastTo(shape.into()), &[x])
    }

    /// Sum `x` down to `shape`, undoing a broadcast to `x.shape()`.
    pub fn sum_to(&self, x: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        self.execute(Op::SumTo(shape.into()), &[x])
    }

    // === Convolution ===

    /// 1-D convolution in NWC layout.
    ///
    /// `x` is `[batch, width, in_channels]` or `[width, in_channels]`, `filter`
    /// is `[filter_width, in_channels, out_channels]`. A rank-2 input is run as
    /// a batch of one and the result comes back rank-2.
    pub fn conv1d(
        &self,
        x: &Tensor,
        filter: &Tensor,
        stride: usize,
        pad: Padding,
        dilation: usize,
    ) -> Result<Tensor> {
        let spec = Conv1dSpec::new(stride, pad, dilation);
        if x.ndim() != 2 {
            return self.execute(Op::Conv1d(spec), &[x, filter]);
        }

        let batched = self.reshape(x, [1, x.shape().dim(0), x.shape().dim(1)])?;
        let y = self.execute(Op::Conv1d(spec), &[&batched, filter])?;
        let (width, channels) = (y.shape().dim(1), y.shape().dim(2));
        self.reshape(&y, [width, channels])
    }

    pub fn conv1d_backprop_input(
        &self,
        dy: &Tensor,
        filter: &Tensor,
        input_shape: &Shape,
        spec: Conv1dSpec,
    ) -> Result<Tensor> {
        let op = Op::Conv1dBackpropInput {
            input_shape: input_shape.clone(),
            spec,
        };
        self.execute(op, &[dy, filter])
    }

    pub fn conv1d_backprop_filter(
        &self,
        x: &Tensor,
        dy: &Tensor,
        filter_shape: &Shape,
        spec: Conv1dSpec,
    ) -> Result<Tensor> {
        let op = Op::Conv1dBackpropFilter {
            filter_shape: filter_shape.clone(),
            spec,
        };
        self.execute(op, &[x, dy])
    }
}
