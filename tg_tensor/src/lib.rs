//! # tg_tensor - Tensor Engine with Pluggable Backends
//!
//! Core of the workspace: a tensor engine that owns device buffers through a
//! backend, releases them through nested scopes and differentiates recorded
//! computations in reverse mode.
//!
//! ## Overview
//!
//! - [`Engine`] - the context: backend, live buffers, scopes and gradient tape
//! - [`Backend`] - trait implemented per device (CPU, wgpu)
//! - [`Tensor`] / [`Variable`] - handles to engine-owned buffers
//! - [`Op`] - the closed table of primitive operations
//! - [`Gradients`] - result of a backward pass
//!
//! ## Example
//!
//! ```ignore
//! use tg_tensor::prelude::*;
//! use tg_backend_cpu::CpuBackend;
//!
//! let eng = Engine::new(CpuBackend);
//! let x = eng.tensor(vec![1.0f32, 2.0, 3.0], [3])?;
//!
//! // d/dx sum(x * x) = 2x
//! let grads = eng.gradients(|| eng.sum(&eng.square(&x)?, None, false), &[&x])?;
//! assert_eq!(eng.read_f32(grads.wrt(&x).unwrap())?, vec![2.0, 4.0, 6.0]);
//! ```

pub mod backend;
pub mod backward;
pub mod config;
pub mod dtype;
pub mod engine;
pub mod error;
mod finite_diff;
mod gradient_fns;
mod kernel;
pub mod memory;
pub mod op;
mod ops;
pub mod shape;
pub mod tape;
pub mod tensor;

pub use backend::{Backend, BinaryOp, CompareOp, Conv1dGeometry, ReduceOp, UnaryOp};
pub use backward::Gradients;
pub use config::EngineConfig;
pub use dtype::{DType, HostData};
pub use engine::Engine;
pub use error::{Error, Result};
pub use memory::MemoryInfo;
pub use op::{Conv1dSpec, Op, Padding};
pub use shape::{Shape, ShapeIndices, Strides};
pub use tensor::{Tensor, TensorContainer, TensorId, Variable};

/// Small constant guarding divisions and logarithms in numeric code.
pub const EPSILON: f32 = 1e-8;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::Backend;
    pub use crate::backward::Gradients;
    pub use crate::config::EngineConfig;
    pub use crate::dtype::{DType, HostData};
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::op::Padding;
    pub use crate::shape::Shape;
    pub use crate::tensor::{Tensor, TensorContainer, Variable};
}
