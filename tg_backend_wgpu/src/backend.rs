//! [`Backend`] implementation on wgpu compute shaders.
//!
//! Kernels are submitted to the device queue and return immediately; only
//! [`Backend::read`] and [`Backend::flush`] wait for the device. Ops without
//! a shader here run on the host through [`CpuBackend`].

use std::cell::RefCell;

use tg_backend_cpu::CpuBackend;
use tg_tensor::backend::{Backend, BinaryOp, CompareOp, Conv1dGeometry, ReduceOp, UnaryOp};
use tg_tensor::{DType, Error, HostData, Result, Shape};
use wgpu::util::DeviceExt;

use crate::context::{GpuContext, Pipelines};
use crate::pool::BufferPool;
use crate::shaders::WORKGROUP_SIZE;
use crate::WgpuConfig;

/// Per-dimension workgroup limit guaranteed by WebGPU.
const MAX_GROUPS_PER_DIM: u32 = 65535;

/// A device buffer of 32-bit words plus the dtype needed to decode it.
#[derive(Debug)]
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    dtype: DType,
    len: usize,
}

impl WgpuBuffer {
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn size(&self) -> u64 {
        word_bytes(self.len)
    }
}

/// Empty tensors still get one word; zero-sized bindings are invalid.
fn word_bytes(len: usize) -> u64 {
    (len.max(1) * 4) as u64
}

/// GPU backend.
pub struct WgpuBackend {
    ctx: GpuContext,
    pipelines: Pipelines,
    pool: Option<RefCell<BufferPool<wgpu::Buffer>>>,
    host: CpuBackend,
}

impl WgpuBackend {
    /// Open the default adapter with [`WgpuConfig::default`].
    pub fn new() -> Result<Self> {
        Self::with_config(WgpuConfig::default())
    }

    pub fn with_config(config: WgpuConfig) -> Result<Self> {
        let ctx = GpuContext::new(&config)?;
        let pipelines = Pipelines::new(&ctx.device);
        let pool = config
            .pool_buffers
            .then(|| RefCell::new(BufferPool::new(config.max_pooled_bytes as u64)));
        Ok(WgpuBackend {
            ctx,
            pipelines,
            pool,
            host: CpuBackend,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.ctx.info
    }

    /// Bytes currently parked in the buffer pool.
    pub fn pooled_bytes(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.borrow().pooled_bytes() as usize)
    }

    /// Free every pooled buffer. Returns how many were freed.
    pub fn clear_pool(&self) -> usize {
        let Some(pool) = &self.pool else {
            return 0;
        };
        let freed = pool.borrow_mut().drain();
        log::debug!("freed {} pooled buffers", freed.len());
        freed.len()
    }

    fn alloc(&self, dtype: DType, len: usize) -> WgpuBuffer {
        let size = word_bytes(len);
        let pooled = self.pool.as_ref().and_then(|pool| pool.borrow_mut().take(size));
        let buffer = pooled.unwrap_or_else(|| {
            self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("tensor"),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        WgpuBuffer { buffer, dtype, len }
    }

    /// Bind `params`, `inputs` and `output` in that order and dispatch one
    /// thread per output element.
    fn launch(
        &self,
        label: &'static str,
        pipeline: &wgpu::ComputePipeline,
        params: &[u32],
        inputs: &[&wgpu::Buffer],
        output: &wgpu::Buffer,
        threads: usize,
    ) -> Result<()> {
        if threads == 0 {
            return Ok(());
        }
        let threads = to_u32(threads)?;
        let device = &self.ctx.device;

        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: bytemuck::cast_slice(params),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        }];
        for (i, buffer) in inputs.iter().chain(std::iter::once(&output)).enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }
        let layout = pipeline.get_bind_group_layout(0);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &entries,
        });

        let groups = threads.div_ceil(WORKGROUP_SIZE);
        let (x, y) = (groups.min(MAX_GROUPS_PER_DIM), groups.div_ceil(MAX_GROUPS_PER_DIM));

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.ctx.queue.submit(Some(encoder.finish()));
        log::trace!("{label}: {threads} threads in {x}x{y} workgroups");
        Ok(())
    }

    /// Copy a buffer into a mappable staging buffer and wait for it.
    fn read_words(&self, x: &WgpuBuffer) -> Result<Vec<u32>> {
        if x.is_empty() {
            return Ok(Vec::new());
        }
        let device = &self.ctx.device;
        let size = x.size();
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_buffer_to_buffer(&x.buffer, 0, &staging, 0, size);
        self.ctx.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = flume::bounded(1);
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            _ = sender.send(result);
        });
        device.poll(wgpu::PollType::Wait).map_err(device_error)?;
        pollster::block_on(receiver.recv_async())
            .map_err(device_error)?
            .map_err(device_error)?;

        let mut words = {
            let view = staging.slice(..).get_mapped_range();
            bytemuck::pod_collect_to_vec::<u8, u32>(&view[..])
        };
        staging.unmap();
        words.truncate(x.len);
        Ok(words)
    }

    /// Run a kernel on the host: read the inputs back, compute with the CPU
    /// backend and upload the result.
    fn on_host<F>(&self, op: &'static str, inputs: &[&WgpuBuffer], f: F) -> Result<WgpuBuffer>
    where
        F: FnOnce(&CpuBackend, &[HostData]) -> Result<HostData>,
    {
        log::debug!("{op}: running on the host");
        let host = inputs.iter().map(|x| self.read(x)).collect::<Result<Vec<_>>>()?;
        let result = f(&self.host, &host)?;
        self.upload(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn broadcast_kernel(
        &self,
        label: &'static str,
        code: u32,
        out_dtype: DType,
        a: &WgpuBuffer,
        a_shape: &Shape,
        b: &WgpuBuffer,
        b_shape: &Shape,
        out_shape: &Shape,
    ) -> Result<WgpuBuffer> {
        let len = out_shape.numel();
        let mut params = vec![to_u32(len)?, code, to_u32(out_shape.ndim())?];
        params.extend(words(out_shape.dims())?);
        params.extend(words(&a_shape.broadcast_strides(out_shape))?);
        params.extend(words(&b_shape.broadcast_strides(out_shape))?);

        let out = self.alloc(out_dtype, len);
        self.launch(label, &self.pipelines.binary, &params, &[&a.buffer, &b.buffer], &out.buffer, len)?;
        Ok(out)
    }

    fn strided_copy(
        &self,
        label: &'static str,
        x: &WgpuBuffer,
        out_shape: &Shape,
        src_strides: &[usize],
    ) -> Result<WgpuBuffer> {
        let len = out_shape.numel();
        let mut params = vec![to_u32(len)?, to_u32(out_shape.ndim())?];
        params.extend(words(out_shape.dims())?);
        params.extend(words(src_strides)?);

        let out = self.alloc(x.dtype, len);
        self.launch(label, &self.pipelines.strided_copy, &params, &[&x.buffer], &out.buffer, len)?;
        Ok(out)
    }
}

impl Backend for WgpuBackend {
    type Buffer = WgpuBuffer;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn upload(&self, data: HostData) -> Result<WgpuBuffer> {
        let out = self.alloc(data.dtype(), data.len());
        let words = encode(&data);
        if !words.is_empty() {
            self.ctx.queue.write_buffer(&out.buffer, 0, bytemuck::cast_slice(&words));
        }
        Ok(out)
    }

    fn read(&self, buffer: &WgpuBuffer) -> Result<HostData> {
        Ok(decode(&self.read_words(buffer)?, buffer.dtype))
    }

    fn copy(&self, buffer: &WgpuBuffer) -> Result<WgpuBuffer> {
        let out = self.alloc(buffer.dtype, buffer.len);
        if !buffer.is_empty() {
            let mut encoder = self
                .ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("copy") });
            encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &out.buffer, 0, buffer.size());
            self.ctx.queue.submit(Some(encoder.finish()));
        }
        Ok(out)
    }

    fn release(&self, buffer: WgpuBuffer) {
        let size = buffer.size();
        if let Some(pool) = &self.pool {
            // a full pool hands the buffer back and it is dropped here
            let _ = pool.borrow_mut().give(size, buffer.buffer);
        }
    }

    fn flush(&self) -> Result<()> {
        self.ctx.device.poll(wgpu::PollType::Wait).map_err(device_error)?;
        Ok(())
    }

    // === Element-wise ===

    fn unary(&self, op: UnaryOp, x: &WgpuBuffer, len: usize) -> Result<WgpuBuffer> {
        if x.dtype != DType::F32 {
            return self.on_host(op.name(), &[x], |cpu, h| cpu.unary(op, &h[0], len));
        }
        let (code, alpha) = unary_code(op);
        let out = self.alloc(DType::F32, len);
        let params = [to_u32(len)?, code, alpha.to_bits()];
        self.launch(op.name(), &self.pipelines.unary, &params, &[&x.buffer], &out.buffer, len)?;
        Ok(out)
    }

    fn binary(
        &self,
        op: BinaryOp,
        a: &WgpuBuffer,
        a_shape: &Shape,
        b: &WgpuBuffer,
        b_shape: &Shape,
        out_shape: &Shape,
    ) -> Result<WgpuBuffer> {
        if a.dtype != DType::F32 || b.dtype != DType::F32 {
            return self.on_host(op.name(), &[a, b], |cpu, h| {
                cpu.binary(op, &h[0], a_shape, &h[1], b_shape, out_shape)
            });
        }
        self.broadcast_kernel(op.name(), binary_code(op), DType::F32, a, a_shape, b, b_shape, out_shape)
    }

    fn compare(
        &self,
        op: CompareOp,
        a: &WgpuBuffer,
        a_shape: &Shape,
        b: &WgpuBuffer,
        b_shape: &Shape,
        out_shape: &Shape,
    ) -> Result<WgpuBuffer> {
        if a.dtype != DType::F32 || b.dtype != DType::F32 {
            return self.on_host(op.name(), &[a, b], |cpu, h| {
                cpu.compare(op, &h[0], a_shape, &h[1], b_shape, out_shape)
            });
        }
        self.broadcast_kernel(op.name(), compare_code(op), DType::Bool, a, a_shape, b, b_shape, out_shape)
    }

    fn select(
        &self,
        cond: &WgpuBuffer,
        cond_shape: &Shape,
        a: &WgpuBuffer,
        a_shape: &Shape,
        b: &WgpuBuffer,
        b_shape: &Shape,
        out_shape: &Shape,
    ) -> Result<WgpuBuffer> {
        self.on_host("select", &[cond, a, b], |cpu, h| {
            cpu.select(&h[0], cond_shape, &h[1], a_shape, &h[2], b_shape, out_shape)
        })
    }

    fn cast(&self, x: &WgpuBuffer, from: DType, to: DType, len: usize) -> Result<WgpuBuffer> {
        // bools are already stored as 0.0 / 1.0 floats
        if from == DType::Bool && to == DType::F32 {
            let out = self.copy(x)?;
            return Ok(WgpuBuffer { dtype: DType::F32, ..out });
        }
        self.on_host("cast", &[x], |cpu, h| cpu.cast(&h[0], from, to, len))
    }

    // === Reductions ===

    fn reduce(&self, op: ReduceOp, x: &WgpuBuffer, shape: &Shape, axes: &[usize]) -> Result<WgpuBuffer> {
        if x.dtype != DType::F32 {
            return self.on_host(op.name(), &[x], |cpu, h| cpu.reduce(op, &h[0], shape, axes));
        }

        let kept: Vec<usize> = (0..shape.ndim()).filter(|a| !axes.contains(a)).collect();
        let outer: usize = kept.iter().map(|&a| shape.dim(a)).product();
        let inner: usize = axes.iter().map(|&a| shape.dim(a)).product();

        // Move reduced axes innermost so each output folds one contiguous block.
        let perm: Vec<usize> = kept.iter().chain(axes).copied().collect();
        let in_place = perm.iter().enumerate().all(|(i, &p)| i == p);
        let moved = match in_place {
            true => None,
            false => Some(self.transpose(x, shape, &perm)?),
        };
        let source = moved.as_ref().unwrap_or(x);

        let init = match op {
            ReduceOp::Max => f32::NEG_INFINITY,
            ReduceOp::Min => f32::INFINITY,
            ReduceOp::Sum | ReduceOp::Mean => 0.0,
        };
        let params = [to_u32(outer)?, reduce_code(op), to_u32(inner)?, init.to_bits()];
        let out = self.alloc(DType::F32, outer);
        let launched = self.launch(
            op.name(),
            &self.pipelines.reduce,
            &params,
            &[&source.buffer],
            &out.buffer,
            outer,
        );
        if let Some(tmp) = moved {
            self.release(tmp);
        }
        launched?;
        Ok(out)
    }

    fn arg_max(&self, x: &WgpuBuffer, shape: &Shape, axis: usize) -> Result<WgpuBuffer> {
        self.on_host("arg_max", &[x], |cpu, h| cpu.arg_max(&h[0], shape, axis))
    }

    // === Linear algebra ===

    fn matmul(
        &self,
        a: &WgpuBuffer,
        a_shape: &Shape,
        b: &WgpuBuffer,
        b_shape: &Shape,
        out_shape: &Shape,
    ) -> Result<WgpuBuffer> {
        let (an, bn, on) = (a_shape.ndim(), b_shape.ndim(), out_shape.ndim());
        let (m, k, n) = (a_shape.dim(an - 2), a_shape.dim(an - 1), b_shape.dim(bn - 1));
        let batch: usize = out_shape.dims()[..on - 2].iter().product();

        // Each operand either has every batch entry or a single shared matrix.
        let batch_stride = |shape: &Shape, matrix: usize| {
            let count: usize = shape.dims()[..shape.ndim() - 2].iter().product();
            match count {
                c if c == batch => Some(matrix),
                1 => Some(0),
                _ => None,
            }
        };
        let (Some(sa), Some(sb)) = (batch_stride(a_shape, m * k), batch_stride(b_shape, k * n)) else {
            return self.on_host("matmul", &[a, b], |cpu, h| {
                cpu.matmul(&h[0], a_shape, &h[1], b_shape, out_shape)
            });
        };

        let len = out_shape.numel();
        let params = [to_u32(len)?, to_u32(m)?, to_u32(k)?, to_u32(n)?, to_u32(sa)?, to_u32(sb)?];
        let out = self.alloc(DType::F32, len);
        self.launch("matmul", &self.pipelines.matmul, &params, &[&a.buffer, &b.buffer], &out.buffer, len)?;
        Ok(out)
    }

    // === Layout ===

    fn transpose(&self, x: &WgpuBuffer, shape: &Shape, perm: &[usize]) -> Result<WgpuBuffer> {
        let src = shape.contiguous_strides();
        let out_shape = Shape::new(perm.iter().map(|&p| shape.dim(p)).collect());
        let strides: Vec<usize> = perm.iter().map(|&p| src.0[p]).collect();
        self.strided_copy("transpose", x, &out_shape, &strides)
    }

    fn broadcast_to(&self, x: &WgpuBuffer, shape: &Shape, out_shape: &Shape) -> Result<WgpuBuffer> {
        self.strided_copy("broadcast_to", x, out_shape, &shape.broadcast_strides(out_shape))
    }

    // === Convolution ===

    fn conv1d(&self, x: &WgpuBuffer, filter: &WgpuBuffer, geom: &Conv1dGeometry) -> Result<WgpuBuffer> {
        self.on_host("conv1d", &[x, filter], |cpu, h| cpu.conv1d(&h[0], &h[1], geom))
    }

    fn conv1d_backprop_input(
        &self,
        dy: &WgpuBuffer,
        filter: &WgpuBuffer,
        geom: &Conv1dGeometry,
    ) -> Result<WgpuBuffer> {
        self.on_host("conv1d_backprop_input", &[dy, filter], |cpu, h| {
            cpu.conv1d_backprop_input(&h[0], &h[1], geom)
        })
    }

    fn conv1d_backprop_filter(&self, x: &WgpuBuffer, dy: &WgpuBuffer, geom: &Conv1dGeometry) -> Result<WgpuBuffer> {
        self.on_host("conv1d_backprop_filter", &[x, dy], |cpu, h| {
            cpu.conv1d_backprop_filter(&h[0], &h[1], geom)
        })
    }
}

fn device_error(err: impl std::fmt::Display) -> Error {
    Error::Device(err.to_string())
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Device(format!("{value} does not fit a 32-bit shader index")))
}

fn words(values: &[usize]) -> Result<Vec<u32>> {
    values.iter().map(|&v| to_u32(v)).collect()
}

fn encode(data: &HostData) -> Vec<u32> {
    match data {
        HostData::F32(v) => bytemuck::cast_slice(v).to_vec(),
        HostData::I32(v) => bytemuck::cast_slice(v).to_vec(),
        HostData::Bool(v) => v.iter().map(|&b| if b { 1.0f32 } else { 0.0 }.to_bits()).collect(),
    }
}

fn decode(words: &[u32], dtype: DType) -> HostData {
    match dtype {
        DType::F32 => HostData::F32(bytemuck::cast_slice(words).to_vec()),
        DType::I32 => HostData::I32(bytemuck::cast_slice(words).to_vec()),
        DType::Bool => HostData::Bool(words.iter().map(|&w| f32::from_bits(w) != 0.0).collect()),
    }
}

/// Op code and parameter for the unary shader.
fn unary_code(op: UnaryOp) -> (u32, f32) {
    match op {
        UnaryOp::Neg => (0, 0.0),
        UnaryOp::Abs => (1, 0.0),
        UnaryOp::Exp => (2, 0.0),
        UnaryOp::Log => (3, 0.0),
        UnaryOp::Sqrt => (4, 0.0),
        UnaryOp::Square => (5, 0.0),
        UnaryOp::Sin => (6, 0.0),
        UnaryOp::Cos => (7, 0.0),
        UnaryOp::Tanh => (8, 0.0),
        UnaryOp::Sigmoid => (9, 0.0),
        UnaryOp::Relu => (10, 0.0),
        UnaryOp::Elu => (11, 0.0),
        UnaryOp::LeakyRelu(alpha) => (12, alpha),
        UnaryOp::Step(alpha) => (13, alpha),
    }
}

fn binary_code(op: BinaryOp) -> u32 {
    match op {
        BinaryOp::Add => 0,
        BinaryOp::Sub => 1,
        BinaryOp::Mul => 2,
        BinaryOp::Div => 3,
        BinaryOp::Pow => 4,
        BinaryOp::Maximum => 5,
        BinaryOp::Minimum => 6,
    }
}

fn compare_code(op: CompareOp) -> u32 {
    match op {
        CompareOp::Greater => 7,
        CompareOp::GreaterEqual => 8,
        CompareOp::Less => 9,
        CompareOp::LessEqual => 10,
        CompareOp::Equal => 11,
    }
}

fn reduce_code(op: ReduceOp) -> u32 {
    match op {
        ReduceOp::Sum => 0,
        ReduceOp::Mean => 1,
        ReduceOp::Max => 2,
        ReduceOp::Min => 3,
    }
}
