use std::sync::Arc;

use depthcam_core::{DepthcamError, DepthcamResult, RenderBackend};

use crate::gpu::{BufferCache, GpuContext, GpuKernel};

/// Where a renderer executes its kernel.
///
/// The CPU path runs the same arithmetic as the WGSL shaders on rayon, so
/// output is interchangeable and tests run without an adapter.
#[derive(Clone)]
pub enum ComputeDevice {
    Gpu(Arc<GpuContext>),
    Cpu,
}

impl ComputeDevice {
    pub fn from_backend(backend: RenderBackend) -> DepthcamResult<Self> {
        match backend {
            RenderBackend::Cpu => Ok(ComputeDevice::Cpu),
            RenderBackend::Gpu => GpuContext::init()
                .map(|gpu| ComputeDevice::Gpu(Arc::new(gpu)))
                .map_err(|e| DepthcamError::gpu(e.to_string())),
            RenderBackend::Auto => match GpuContext::init() {
                Ok(gpu) => Ok(ComputeDevice::Gpu(Arc::new(gpu))),
                Err(e) => {
                    tracing::warn!("no usable GPU ({}), falling back to CPU renderers", e);
                    Ok(ComputeDevice::Cpu)
                }
            },
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, ComputeDevice::Gpu(_))
    }

    pub fn describe(&self) -> String {
        match self {
            ComputeDevice::Gpu(gpu) => format!("GPU ({})", gpu.adapter_name()),
            ComputeDevice::Cpu => format!("CPU ({} threads)", rayon::current_num_threads()),
        }
    }

    /// Compile a kernel for the GPU path. `None` on CPU.
    pub(crate) fn compile(
        &self,
        label: &'static str,
        source: &str,
        input_count: u32,
    ) -> DepthcamResult<Option<GpuStage>> {
        match self {
            ComputeDevice::Cpu => Ok(None),
            ComputeDevice::Gpu(gpu) => {
                let kernel = GpuKernel::new(gpu, label, source, input_count)?;
                Ok(Some(GpuStage {
                    gpu: Arc::clone(gpu),
                    kernel,
                    cache: BufferCache::new(),
                }))
            }
        }
    }
}

impl std::fmt::Debug for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// GPU half of a prepared renderer: pipeline plus its buffer cache.
pub(crate) struct GpuStage {
    pub gpu: Arc<GpuContext>,
    pub kernel: GpuKernel,
    pub cache: BufferCache,
}

impl GpuStage {
    pub fn dispatch(
        &self,
        params: &[u8],
        inputs: &[&[u8]],
        output_len: u64,
        workgroups: (u32, u32, u32),
    ) -> DepthcamResult<Vec<u8>> {
        self.kernel
            .dispatch(&self.gpu, &self.cache, params, inputs, output_len, workgroups)
    }
}

impl Drop for GpuStage {
    fn drop(&mut self) {
        self.cache.clear();
    }
}
