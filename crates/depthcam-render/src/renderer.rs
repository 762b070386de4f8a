//! Common lifecycle for frame-transform renderers.

use depthcam_core::{DepthcamResult, FormatDescription, FramePool, ImageBuffer, PooledFrame};

use crate::device::GpuStage;

/// A compute unit that turns one input into one output per call.
///
/// Lifecycle: unprepared, then `prepare` negotiates formats and allocates,
/// then `render` any number of times, then `reset` back to unprepared.
/// `render` takes `&mut self`, so calls on one renderer are serialized.
pub trait FrameRenderer {
    type Input<'a>;
    type Output;

    fn name(&self) -> &'static str;

    /// Negotiate formats and allocate the output pool (`hint + OUTPUT_POOL_MARGIN`
    /// buffers) and GPU resources. An unsupported input format leaves the
    /// renderer unprepared and is fatal for the pipeline.
    fn prepare(
        &mut self,
        input_format: FormatDescription,
        output_retained_buffer_count_hint: usize,
    ) -> DepthcamResult<()>;

    /// Transform one input. Returns `None` (and logs) when unprepared, when
    /// the input does not match the prepared format, when the output pool is
    /// exhausted or when the kernel fails.
    fn render(&mut self, input: Self::Input<'_>) -> Option<Self::Output>;

    /// Release the output pool and GPU resources. Idempotent.
    fn reset(&mut self);

    fn is_prepared(&self) -> bool;

    fn output_format(&self) -> Option<FormatDescription>;
}

/// Prepared state shared by the image-to-image renderers.
pub(crate) struct ImageStage {
    pub input_format: FormatDescription,
    pub pool: FramePool,
    pub gpu: Option<GpuStage>,
}

impl ImageStage {
    pub fn output_format(&self) -> FormatDescription {
        self.pool.format()
    }

    /// Validate `input` against the prepared format and take an output frame.
    pub fn begin(&self, renderer: &'static str, input: &ImageBuffer) -> Option<PooledFrame> {
        if input.format != self.input_format {
            tracing::warn!(
                "{}: input {:?} does not match prepared {:?}, dropping frame",
                renderer,
                input.format,
                self.input_format
            );
            return None;
        }
        if input.data.len() != input.format.byte_size() {
            tracing::warn!(
                "{}: input holds {} bytes, expected {}",
                renderer,
                input.data.len(),
                input.format.byte_size()
            );
            return None;
        }
        let Some(mut frame) = self.pool.acquire() else {
            tracing::warn!(
                "{}: output pool exhausted ({} in flight), dropping frame",
                renderer,
                self.pool.outstanding()
            );
            return None;
        };
        frame.timestamp = input.timestamp;
        Some(frame)
    }
}

/// Log and drop a render call made before `prepare`.
pub(crate) fn unprepared<T>(renderer: &'static str) -> Option<T> {
    tracing::warn!("{}: render called before prepare, dropping frame", renderer);
    None
}
