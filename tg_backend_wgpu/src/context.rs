//! Device acquisition and pipeline compilation.

use tg_tensor::{Error, Result};

use crate::shaders;
use crate::WgpuConfig;

/// Device and queue of the selected adapter.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub info: wgpu::AdapterInfo,
}

impl GpuContext {
    /// Pick an adapter and open a device on it. Blocks until both are ready.
    pub fn new(config: &WgpuConfig) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: config.power_preference,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .map_err(|err| Error::Device(format!("failed to request adapter: {err}")))?;

        let info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("tg_tensor"),
            required_limits: adapter.limits(),
            ..Default::default()
        }))
        .map_err(|err| Error::Device(format!("failed to request device: {err}")))?;

        log::info!("wgpu adapter: {} ({:?})", info.name, info.backend);
        Ok(GpuContext { device, queue, info })
    }
}

/// Compiled compute pipelines, one per shader.
pub(crate) struct Pipelines {
    pub unary: wgpu::ComputePipeline,
    pub binary: wgpu::ComputePipeline,
    pub strided_copy: wgpu::ComputePipeline,
    pub reduce: wgpu::ComputePipeline,
    pub matmul: wgpu::ComputePipeline,
}

impl Pipelines {
    pub fn new(device: &wgpu::Device) -> Self {
        Pipelines {
            unary: compile(device, "unary", shaders::UNARY),
            binary: compile(device, "binary", shaders::BINARY),
            strided_copy: compile(device, "strided_copy", shaders::STRIDED_COPY),
            reduce: compile(device, "reduce", shaders::REDUCE),
            matmul: compile(device, "matmul", shaders::MATMUL),
        }
    }
}

fn compile(device: &wgpu::Device, label: &str, source: &str) -> wgpu::ComputePipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: None,
        module: &module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}
