//! # tg_nn - Training Utilities for tg_tensor
//!
//! Building blocks on top of the tg_tensor engine:
//!
//! - **Optimizers**: SGD, momentum, Adagrad, Adadelta, Adam, Adamax, RMSProp
//! - **Activations**: tanh, ReLU, leaky ReLU, sigmoid, square, ELU, softmax
//! - **Losses**: MSE, binary cross-entropy on logits, soft cross-entropy
//! - **Layers**: Linear
//! - **Weights**: loading named tensors from a JSON manifest
//!
//! ## Example: fitting a line
//!
//! ```ignore
//! use tg_backend_cpu::CpuBackend;
//! use tg_nn::{mse_loss, Linear, Optimizer, Sgd};
//! use tg_tensor::prelude::*;
//!
//! let eng = Engine::new(CpuBackend);
//! let layer = Linear::new(&eng, "fc", 1, 1, true)?;
//! let x = eng.tensor(vec![0.0f32, 1.0, 2.0], [3, 1])?;
//! let y = eng.tensor(vec![1.0f32, 3.0, 5.0], [3, 1])?;
//!
//! let mut opt = Sgd::new(0.1);
//! for _ in 0..100 {
//!     opt.minimize(&eng, &|| mse_loss(&eng, &layer.forward(&eng, &x)?, &y), false, None)?;
//! }
//! ```

pub mod activations;
pub mod layers;
pub mod loss;
pub mod optim;
pub mod weights;

pub use activations::{log_softmax, softmax, Activation};
pub use layers::Linear;
pub use loss::{binary_cross_entropy_with_logits, mse_loss, soft_cross_entropy_loss};
pub use optim::{Adadelta, Adagrad, Adam, Adamax, Momentum, Optimizer, RmsProp, Sgd};
pub use weights::{group_offsets, load_weights, load_weights_with, parse_manifest, WeightsError, WeightsManifest};
