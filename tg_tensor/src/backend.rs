//! Backend trait - abstraction over the devices that own buffers and run kernels.

use crate::dtype::{DType, HostData};
use crate::error::{Error, Result};
use crate::shape::Shape;

/// Element-wise float kernels taking one input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Square,
    Sin,
    Cos,
    Tanh,
    Sigmoid,
    Relu,
    Elu,
    LeakyRelu(f32),
    /// 1 where x > 0, `alpha` elsewhere.
    Step(f32),
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Square => "square",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Relu => "relu",
            UnaryOp::Elu => "elu",
            UnaryOp::LeakyRelu(_) => "leaky_relu",
            UnaryOp::Step(_) => "step",
        }
    }
}

/// Element-wise float kernels with broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Maximum,
    Minimum,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
        }
    }
}

/// Broadcasting comparisons producing boolean tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
}

impl CompareOp {
    pub fn name(self) -> &'static str {
        match self {
            CompareOp::Greater => "greater",
            CompareOp::GreaterEqual => "greater_equal",
            CompareOp::Less => "less",
            CompareOp::LessEqual => "less_equal",
            CompareOp::Equal => "equal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
        }
    }
}

/// Resolved sizes of a 1-D convolution in NWC layout.
///
/// Input is `[batch, in_width, in_channels]`, filter is
/// `[filter_width, in_channels, out_channels]`, output is
/// `[batch, out_width, out_channels]`. Input position of output `o` and tap `k`
/// is `o * stride + k * dilation - pad_left`; positions outside the input read zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv1dGeometry {
    pub batch: usize,
    pub in_width: usize,
    pub in_channels: usize,
    pub filter_width: usize,
    pub out_channels: usize,
    pub out_width: usize,
    pub stride: usize,
    pub dilation: usize,
    pub pad_left: usize,
}

impl Conv1dGeometry {
    pub fn input_shape(&self) -> Shape {
        Shape::new(vec![self.batch, self.in_width, self.in_channels])
    }

    pub fn filter_shape(&self) -> Shape {
        Shape::new(vec![self.filter_width, self.in_channels, self.out_channels])
    }

    pub fn output_shape(&self) -> Shape {
        Shape::new(vec![self.batch, self.out_width, self.out_channels])
    }

    /// Input column read by output column `o` at tap `k`, if it is inside the input.
    pub fn input_column(&self, o: usize, k: usize) -> Option<usize> {
        let pos = (o * self.stride + k * self.dilation) as isize - self.pad_left as isize;
        (pos >= 0 && (pos as usize) < self.in_width).then_some(pos as usize)
    }
}

/// Device executor. One implementation per device.
///
/// Buffers are plain row-major storage; shapes and dtypes are tracked by the
/// engine and passed to every kernel. Kernels never write to their inputs and
/// always return a freshly allocated buffer. Every kernel has a default that
/// reports [`Error::Unsupported`], so a backend only implements what its
/// device can run.
pub trait Backend: 'static {
    /// Device-specific storage for one tensor.
    type Buffer: 'static;

    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    // === Memory ===

    /// Copy host values into a new device buffer.
    fn upload(&self, data: HostData) -> Result<Self::Buffer>;

    /// Copy a buffer back to host memory. Blocks until pending device work
    /// that produces `buffer` has finished.
    fn read(&self, buffer: &Self::Buffer) -> Result<HostData>;

    /// Duplicate a buffer.
    fn copy(&self, buffer: &Self::Buffer) -> Result<Self::Buffer>;

    /// Give a buffer back to the device.
    fn release(&self, buffer: Self::Buffer) {
        drop(buffer);
    }

    /// A buffer holding `len` copies of `value`.
    fn fill(&self, dtype: DType, len: usize, value: f32) -> Result<Self::Buffer> {
        self.upload(HostData::filled(dtype, len, value))
    }

    /// Wait for all submitted device work.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    // === Element-wise ===

    fn unary(&self, op: UnaryOp, _x: &Self::Buffer, _len: usize) -> Result<Self::Buffer> {
        Err(self.unsupported(op.name()))
    }

    fn binary(
        &self,
        op: BinaryOp,
        _a: &Self::Buffer,
        _a_shape: &Shape,
        _b: &Self::Buffer,
        _b_shape: &Shape,
        _out_shape: &Shape,
    ) -> Result<Self::Buffer> {
        Err(self.unsupported(op.name()))
    }

    /// Inputs share a dtype (float or int); the output is boolean.
    fn compare(
        &self,
        op: CompareOp,
        _a: &Self::Buffer,
        _a_shape: &Shape,
        _b: &Self::Buffer,
        _b_shape: &Shape,
        _out_shape: &Shape,
    ) -> Result<Self::Buffer> {
        Err(self.unsupported(op.name()))
    }

    /// `cond ? a : b` with all three operands broadcast to `out_shape`.
    #[allow(clippy::too_many_arguments)]
    fn select(
        &self,
        _cond: &Self::Buffer,
        _cond_shape: &Shape,
        _a: &Self::Buffer,
        _a_shape: &Shape,
        _b: &Self::Buffer,
        _b_shape: &Shape,
        _out_shape: &Shape,
    ) -> Result<Self::Buffer> {
        Err(self.unsupported("select"))
    }

    fn cast(&self, _x: &Self::Buffer, _from: DType, _to: DType, _len: usize) -> Result<Self::Buffer> {
        Err(self.unsupported("cast"))
    }

    // === Reductions ===

    /// Reduce `axes` of a float tensor. The output holds the kept axes in
    /// their original order; `keepdims` only changes the logical shape.
    fn reduce(&self, op: ReduceOp, _x: &Self::Buffer, _shape: &Shape, _axes: &[usize]) -> Result<Self::Buffer> {
        Err(self.unsupported(op.name()))
    }

    /// Index of the largest value along `axis`, as int32.
    fn arg_max(&self, _x: &Self::Buffer, _shape: &Shape, _axis: usize) -> Result<Self::Buffer> {
        Err(self.unsupported("arg_max"))
    }

    // === Linear algebra ===

    /// Batched `(..., M, K) @ (..., K, N)` with broadcasting batch dimensions.
    fn matmul(
        &self,
        _a: &Self::Buffer,
        _a_shape: &Shape,
        _b: &Self::Buffer,
        _b_shape: &Shape,
        _out_shape: &Shape,
    ) -> Result<Self::Buffer> {
        Err(self.unsupported("matmul"))
    }

    // === Layout ===

    fn transpose(&self, _x: &Self::Buffer, _shape: &Shape, _perm: &[usize]) -> Result<Self::Buffer> {
        Err(self.unsupported("transpose"))
    }

    fn broadcast_to(&self, _x: &Self::Buffer, _shape: &Shape, _out_shape: &Shape) -> Result<Self::Buffer> {
        Err(self.unsupported("broadcast_to"))
    }

    // === Convolution ===

    fn conv1d(&self, _x: &Self::Buffer, _filter: &Self::Buffer, _geom: &Conv1dGeometry) -> Result<Self::Buffer> {
        Err(self.unsupported("conv1d"))
    }

    /// Gradient of `conv1d` with respect to its input.
    fn conv1d_backprop_input(
        &self,
        _dy: &Self::Buffer,
        _filter: &Self::Buffer,
        _geom: &Conv1dGeometry,
    ) -> Result<Self::Buffer> {
        Err(self.unsupported("conv1d_backprop_input"))
    }

    /// Gradient of `conv1d` with respect to its filter.
    fn conv1d_backprop_filter(
        &self,
        _x: &Self::Buffer,
        _dy: &Self::Buffer,
        _geom: &Conv1dGeometry,
    ) -> Result<Self::Buffer> {
        Err(self.unsupported("conv1d_backprop_filter"))
    }

    fn unsupported(&self, op: &'static str) -> Error {
        Error::Unsupported {
            op,
            backend: self.name(),
        }
    }
}
