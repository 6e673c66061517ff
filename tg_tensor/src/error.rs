//! Error type shared by the engine, its backends and the layers built on top.

use thiserror::Error;

use crate::dtype::DType;
use crate::shape::Shape;
use crate::tensor::TensorId;

/// Everything that can go wrong while building, running or differentiating tensor ops.
#[derive(Debug, Error)]
pub enum Error {
    /// Operand shapes cannot be combined. Raised before any kernel runs.
    #[error("{op}: incompatible shapes {lhs} and {rhs}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    #[error("{op}: {message}")]
    InvalidArgument { op: &'static str, message: String },

    #[error("{op}: expected dtype {expected}, found {found}")]
    DTypeMismatch {
        op: &'static str,
        expected: DType,
        found: DType,
    },

    #[error("tensor {0} was used after it was disposed")]
    UseAfterDispose(TensorId),

    #[error("tensor {0} was disposed twice")]
    DoubleFree(TensorId),

    /// The source never feeds the differentiated output.
    #[error("tensor {0} is not connected to the output; it has no gradient")]
    MissingGradient(TensorId),

    /// The source feeds the output only through ops without a gradient.
    #[error("tensor {0} reaches the output only through non-differentiable operations")]
    NotDifferentiable(TensorId),

    #[error("gradients need a scalar output, got shape {0}")]
    NonScalarLoss(Shape),

    #[error("{op} is not implemented by the {backend} backend")]
    Unsupported {
        op: &'static str,
        backend: &'static str,
    },

    #[error("end_scope called without a matching start_scope")]
    ScopeUnderflow,

    #[error("a variable named {0:?} already exists")]
    DuplicateVariable(String),

    #[error("expected {expected} values, found {found}")]
    DataLength { expected: usize, found: usize },

    #[error("{op} produced a NaN")]
    NonFinite { op: &'static str },

    #[error("device error: {0}")]
    Device(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
