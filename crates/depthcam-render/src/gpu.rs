use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use wgpu::{Adapter, Buffer, BufferDescriptor, BufferUsages, Device, Instance, Queue};

use depthcam_core::{DepthcamError, DepthcamResult};

#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
struct BufferDescKey {
    size: u64,
    usage: BufferUsages,
}

/// Recycles GPU buffers between dispatches of the same shape.
///
/// Every renderer owns one; it is emptied on `reset` so no GPU memory
/// outlives a renderer's prepared state.
pub struct BufferCache {
    free_buffers: Mutex<HashMap<BufferDescKey, Vec<Buffer>>>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self {
            free_buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Round a byte length up to a cache-friendly allocation size.
    pub fn padded_size(len: u64) -> u64 {
        len.max(16).next_multiple_of(256)
    }

    pub fn acquire(
        &self,
        device: &Device,
        label: Option<&str>,
        len: u64,
        usage: BufferUsages,
    ) -> Buffer {
        let key = BufferDescKey {
            size: Self::padded_size(len),
            usage,
        };
        if let Some(buffer) = self
            .free_buffers
            .lock()
            .get_mut(&key)
            .and_then(|buffers| buffers.pop())
        {
            return buffer;
        }

        device.create_buffer(&BufferDescriptor {
            label,
            size: key.size,
            usage,
            mapped_at_creation: false,
        })
    }

    pub fn release(&self, buffer: Buffer) {
        let key = BufferDescKey {
            size: buffer.size(),
            usage: buffer.usage(),
        };
        self.free_buffers.lock().entry(key).or_default().push(buffer);
    }

    /// Number of idle buffers held.
    pub fn len(&self) -> usize {
        self.free_buffers.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for (_, buffers) in self.free_buffers.lock().drain() {
            for buffer in buffers {
                buffer.destroy();
            }
        }
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared context for all GPU compute work.
pub struct GpuContext {
    pub instance: Instance,
    pub adapter: Adapter,
    pub device: Device,
    pub queue: Queue,
}

impl GpuContext {
    /// Initializes WGPU headless, selecting the best available backend.
    pub fn init() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| anyhow::anyhow!("Failed to find suitable wgpu adapter"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("depthcam compute device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
            },
            None,
        ))?;

        let info = adapter.get_info();
        tracing::info!("GPU compute on {} ({:?})", info.name, info.backend);

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }

    pub fn adapter_name(&self) -> String {
        self.adapter.get_info().name
    }
}

/// A compiled compute pipeline with a fixed binding convention:
/// binding 0 is a uniform parameter block, bindings `1..=inputs` are
/// read-only storage buffers and binding `inputs + 1` is the output.
pub struct GpuKernel {
    label: &'static str,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    input_count: u32,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuKernel {
    /// Compile `source` (WGSL, entry point `main`). Validation failures are fatal.
    pub fn new(
        gpu: &GpuContext,
        label: &'static str,
        source: &str,
        input_count: u32,
    ) -> DepthcamResult<Self> {
        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        entries.extend((1..=input_count).map(|b| storage_entry(b, true)));
        entries.push(storage_entry(input_count + 1, false));

        let layout = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &entries,
            });

        let pipeline_layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });

        if let Some(err) = pollster::block_on(gpu.device.pop_error_scope()) {
            return Err(DepthcamError::gpu(format!(
                "{}: pipeline creation failed: {}",
                label, err
            )));
        }

        Ok(Self {
            label,
            pipeline,
            layout,
            input_count,
        })
    }

    /// Run the kernel and return the first `output_len` bytes of its output.
    ///
    /// Blocks until the GPU has finished: the readback buffer is mapped only
    /// after the submission completes, so the returned bytes are final.
    pub fn dispatch(
        &self,
        gpu: &GpuContext,
        cache: &BufferCache,
        params: &[u8],
        inputs: &[&[u8]],
        output_len: u64,
        workgroups: (u32, u32, u32),
    ) -> DepthcamResult<Vec<u8>> {
        if inputs.len() != self.input_count as usize {
            return Err(DepthcamError::gpu(format!(
                "{}: expected {} inputs, got {}",
                self.label,
                self.input_count,
                inputs.len()
            )));
        }

        let device = &gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let params_buf = cache.acquire(
            device,
            Some("params"),
            params.len() as u64,
            BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        );
        gpu.queue.write_buffer(&params_buf, 0, params);

        let input_bufs: Vec<Buffer> = inputs
            .iter()
            .map(|data| {
                let buf = cache.acquire(
                    device,
                    Some("input"),
                    data.len() as u64,
                    BufferUsages::STORAGE | BufferUsages::COPY_DST,
                );
                if !data.is_empty() {
                    gpu.queue.write_buffer(&buf, 0, data);
                }
                buf
            })
            .collect();

        let output_buf = cache.acquire(
            device,
            Some("output"),
            output_len,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        );
        let readback = cache.acquire(
            device,
            Some("readback"),
            output_len,
            BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        );

        let mut bind_entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params_buf.as_entire_binding(),
        }];
        for (i, buf) in input_bufs.iter().enumerate() {
            bind_entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: buf.as_entire_binding(),
            });
        }
        bind_entries.push(wgpu::BindGroupEntry {
            binding: self.input_count + 1,
            resource: output_buf.as_entire_binding(),
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout: &self.layout,
            entries: &bind_entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(self.label),
        });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
            cpass.set_pipeline(&self.pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
        }
        encoder.copy_buffer_to_buffer(&output_buf, 0, &readback, 0, output_len);
        gpu.queue.submit(Some(encoder.finish()));

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(DepthcamError::gpu(format!("{}: dispatch failed: {}", self.label, err)));
        }

        // Completion fence: wait for the submission, then map.
        let slice = readback.slice(..output_len);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::Maintain::Wait);

        let mapped = rx
            .recv()
            .map_err(|_| DepthcamError::gpu(format!("{}: map callback dropped", self.label)))?;
        mapped.map_err(|e| DepthcamError::gpu(format!("{}: readback failed: {}", self.label, e)))?;

        let bytes = slice.get_mapped_range().to_vec();
        readback.unmap();

        cache.release(params_buf);
        for buf in input_bufs {
            cache.release(buf);
        }
        cache.release(output_buf);
        cache.release(readback);

        Ok(bytes)
    }
}

/// Workgroup counts for a 16x16 image kernel.
pub fn image_workgroups(width: u32, height: u32) -> (u32, u32, u32) {
    (width.div_ceil(16), height.div_ceil(16), 1)
}
