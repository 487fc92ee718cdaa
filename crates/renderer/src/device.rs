//! Device seams.
//!
//! The pooling and scheduling layers talk to the GPU only through these
//! traits. [`GpuDevice`] covers resource creation used by binding data,
//! descriptor pools and pipelines; [`FrameBackend`] adds the per-frame
//! acquire/record/submit/present cycle; [`CommandRecorder`] receives compiled
//! draw commands. `VulkanBackend` implements all three on top of
//! `vkframe-rhi`.

use ash::vk;

use crate::error::RenderResult;
use crate::pipeline::PipelineDesc;
use crate::render_state::{DescriptorWrite, UploadBatch};
use crate::resource::BufferBinding;

/// Host-visible uniform buffer that binding data sub-allocates.
pub trait UniformStorage: Send + Sync + 'static {
    /// Buffer handle.
    fn handle(&self) -> vk::Buffer;

    /// Size in bytes.
    fn size(&self) -> vk::DeviceSize;

    /// Copies `data` to `offset`.
    fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> RenderResult<()>;
}

/// Pipeline and layout handles of one graphics pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineHandles {
    /// Pipeline handle.
    pub pipeline: vk::Pipeline,
    /// Layout handle, `[scene, material, instance]` sets.
    pub layout: vk::PipelineLayout,
}

/// Resource creation and destruction.
pub trait GpuDevice: Send + Sync + 'static {
    /// Uniform buffer type handed to binding data.
    type UniformBuffer: UniformStorage;

    /// Required alignment of uniform buffer offsets.
    fn min_uniform_alignment(&self) -> vk::DeviceSize;

    /// Creates a descriptor set layout.
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RenderResult<vk::DescriptorSetLayout>;

    /// Destroys a descriptor set layout.
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Creates a descriptor pool for `max_sets` sets.
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RenderResult<vk::DescriptorPool>;

    /// Destroys a descriptor pool with all its sets.
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocates one set. `Ok(None)` means the pool is exhausted.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RenderResult<Option<vk::DescriptorSet>>;

    /// Applies descriptor writes in one batch.
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    /// Creates a persistently mapped uniform buffer.
    fn create_uniform_buffer(&self, size: vk::DeviceSize) -> RenderResult<Self::UniformBuffer>;

    /// Creates a graphics pipeline whose layout uses `set_layouts` in order.
    fn create_pipeline(
        &self,
        desc: &PipelineDesc,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> RenderResult<PipelineHandles>;

    /// Destroys a pipeline and its layout.
    fn destroy_pipeline(&self, handles: PipelineHandles);
}

/// Result of acquiring a presentable image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Image acquired; `suboptimal` asks for a surface rebuild soon.
    Acquired { image_index: u32, suboptimal: bool },
    /// The surface must be rebuilt before anything can be acquired.
    OutOfDate,
}

/// Result of presenting an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally.
    Presented,
    /// Presented, but the surface no longer matches exactly.
    Suboptimal,
    /// Not presented; the surface must be rebuilt.
    OutOfDate,
}

/// The per-frame cycle of a device with a presentation surface.
///
/// All methods are called from the single thread driving the scheduler.
pub trait FrameBackend: GpuDevice {
    /// Command recorder handed out by [`begin_recording`](Self::begin_recording).
    type Recorder: CommandRecorder;

    /// Blocks until the GPU has retired the last submission of `slot`.
    fn wait_for_slot(&self, slot: usize) -> RenderResult<()>;

    /// Current surface size. Zero while minimized.
    fn surface_extent(&self) -> vk::Extent2D;

    /// Rebuilds the surface images after a resize or out-of-date report.
    fn recreate_surface(&self) -> RenderResult<()>;

    /// Acquires the next presentable image for `slot`.
    fn acquire_image(&self, slot: usize) -> RenderResult<AcquireOutcome>;

    /// Resets the slot's command buffer and begins recording.
    ///
    /// On failure the slot fence must end up signaled again and the acquired
    /// image's semaphore consumed, so the next `wait_for_slot` returns.
    fn begin_recording(&self, slot: usize) -> RenderResult<Self::Recorder>;

    /// Records the frame's uploads with batched barriers.
    fn record_uploads(&self, recorder: &mut Self::Recorder, uploads: &UploadBatch);

    /// Begins the render pass on `image_index`, clearing to `clear_color`.
    fn begin_render_pass(
        &self,
        recorder: &mut Self::Recorder,
        image_index: u32,
        clear_color: [f32; 4],
    );

    /// Ends the render pass and prepares `image_index` for presentation.
    fn end_render_pass(&self, recorder: &mut Self::Recorder, image_index: u32);

    /// Ends recording, resets the slot fence and submits, signaling it.
    fn submit(&self, slot: usize, image_index: u32, recorder: Self::Recorder) -> RenderResult<()>;

    /// Presents `image_index` once the submission of `slot` has rendered it.
    fn present(&self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome>;

    /// Blocks until the device is idle.
    fn wait_idle(&self) -> RenderResult<()>;
}

/// Sink for compiled draw commands.
pub trait CommandRecorder {
    /// Binds a graphics pipeline.
    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);

    /// Binds `set` at set index `index` of `layout`.
    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, index: u32, set: vk::DescriptorSet);

    /// Binds vertex input.
    fn bind_vertex_buffer(&mut self, binding: BufferBinding);

    /// Binds index input.
    fn bind_index_buffer(&mut self, binding: BufferBinding, index_type: vk::IndexType);

    /// Sets the scissor rectangle.
    fn set_scissor(&mut self, rect: vk::Rect2D);

    /// Draws indexed primitives, one instance.
    fn draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32);
}
