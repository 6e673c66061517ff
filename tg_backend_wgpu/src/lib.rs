//! # tg_backend_wgpu - GPU Backend on wgpu
//!
//! Runs tensor kernels as WGSL compute shaders on whatever adapter wgpu finds
//! (Vulkan, Metal, DX12 or GL). Work is queued asynchronously; reads block
//! until the queue has drained. Kernels without a shader fall back to
//! [`tg_backend_cpu::CpuBackend`].
//!
//! ```ignore
//! use tg_backend_wgpu::WgpuBackend;
//! use tg_tensor::Engine;
//!
//! let engine = Engine::new(WgpuBackend::new()?);
//! let x = engine.tensor(vec![1.0f32, 2.0, 3.0], [3])?;
//! let y = engine.exp(&x)?;
//! println!("{:?}", engine.read_f32(&y)?);
//! ```

mod backend;
mod context;
mod pool;
pub mod shaders;

pub use backend::{WgpuBackend, WgpuBuffer};
pub use context::GpuContext;
pub use wgpu;

/// Adapter selection and buffer pooling options.
#[derive(Debug, Clone)]
pub struct WgpuConfig {
    pub power_preference: wgpu::PowerPreference,
    /// Keep released buffers for reuse instead of freeing them.
    pub pool_buffers: bool,
    /// Released buffers past this total are freed.
    pub max_pooled_bytes: usize,
}

impl Default for WgpuConfig {
    fn default() -> Self {
        WgpuConfig {
            power_preference: wgpu::PowerPreference::HighPerformance,
            pool_buffers: true,
            max_pooled_bytes: 256 << 20,
        }
    }
}
