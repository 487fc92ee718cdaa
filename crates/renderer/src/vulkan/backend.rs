//! Vulkan implementation of the device seams.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use tracing::{debug, error, info, trace, warn};
use vkframe_core::RendererConfig;
use vkframe_rhi::buffer::{Buffer, BufferUsage};
use vkframe_rhi::command::{CommandBuffer, CommandPool, ImageTransition};
use vkframe_rhi::device::Device;
use vkframe_rhi::image::{DEFAULT_DEPTH_FORMAT, Image, ImageDesc, ImageKind};
use vkframe_rhi::pipeline::GraphicsPipelineDesc;
use vkframe_rhi::sampler::SamplerCache;
use vkframe_rhi::sync::{Fence, Semaphore};
use vkframe_rhi::{RhiError, RhiResult, descriptor, pipeline};

use super::presenter::Presenter;
use super::recorder::VulkanRecorder;
use crate::MAX_FRAMES_IN_FLIGHT;
use crate::device::{
    AcquireOutcome, FrameBackend, GpuDevice, PipelineHandles, PresentOutcome, UniformStorage,
};
use crate::error::RenderResult;
use crate::pipeline::PipelineDesc;
use crate::render_state::{DescriptorWrite, UploadBatch};

/// Per-slot command buffer and synchronization.
struct FrameData {
    /// Owns the command buffer; destroyed after it.
    _command_pool: CommandPool,
    command_buffer: CommandBuffer,
    /// Signaled when the acquired image may be rendered to.
    image_available: Semaphore,
    /// Signaled when the slot's submission retires.
    in_flight: Fence,
}

impl FrameData {
    fn new(device: &Arc<Device>) -> RhiResult<Self> {
        let command_pool = CommandPool::new(Arc::clone(device), device.graphics_family())?;
        let command_buffer = CommandBuffer::new(Arc::clone(device), &command_pool)?;
        Ok(Self {
            _command_pool: command_pool,
            command_buffer,
            image_available: Semaphore::new(Arc::clone(device))?,
            // Signaled so the first wait on each slot returns immediately
            in_flight: Fence::new(Arc::clone(device), true)?,
        })
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn render_finished_semaphores(device: &Arc<Device>, count: u32) -> RhiResult<Vec<Semaphore>> {
    (0..count)
        .map(|_| Semaphore::new(Arc::clone(device)))
        .collect()
}

fn depth_image(device: &Arc<Device>, extent: vk::Extent2D) -> RhiResult<Option<Image>> {
    if extent.width == 0 || extent.height == 0 {
        return Ok(None);
    }
    let image = Image::new(
        Arc::clone(device),
        &ImageDesc {
            width: extent.width,
            height: extent.height,
            layers: 1,
            array: false,
            format: DEFAULT_DEPTH_FORMAT,
            kind: ImageKind::Depth,
        },
    )?;
    Ok(Some(image))
}

fn full_rect(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Frame backend over a `vkframe-rhi` device and an application presenter.
///
/// Owns one command buffer, acquire semaphore and fence per frame slot, one
/// render-finished semaphore per presentable image, the depth attachment and
/// the sampler cache.
pub struct VulkanBackend {
    device: Arc<Device>,
    frames: Vec<FrameData>,
    /// Indexed by image; an image is only presented once its submission
    /// signaled its own semaphore.
    render_finished: Mutex<Vec<Semaphore>>,
    depth: Mutex<Option<Image>>,
    samplers: SamplerCache,
    presenter: Mutex<Box<dyn Presenter>>,
    fence_timeout: u64,
}

impl VulkanBackend {
    /// Creates per-slot command buffers and synchronization objects.
    ///
    /// # Errors
    ///
    /// Returns an error if any Vulkan object cannot be created.
    pub fn new(
        device: Arc<Device>,
        presenter: Box<dyn Presenter>,
        config: &RendererConfig,
    ) -> RenderResult<Self> {
        config.validate()?;

        let frames = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameData::new(&device))
            .collect::<RhiResult<Vec<_>>>()?;
        let render_finished = render_finished_semaphores(&device, presenter.image_count())?;
        let depth = depth_image(&device, presenter.extent())?;

        info!(
            "Vulkan backend ready: {} frame slots, {} surface images, {:?}",
            frames.len(),
            presenter.image_count(),
            presenter.extent()
        );

        Ok(Self {
            samplers: SamplerCache::new(Arc::clone(&device)),
            device,
            frames,
            render_finished: Mutex::new(render_finished),
            depth: Mutex::new(depth),
            presenter: Mutex::new(presenter),
            fence_timeout: config.fence_timeout_ns,
        })
    }

    /// The logical device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Shared sampler cache.
    pub fn samplers(&self) -> &SamplerCache {
        &self.samplers
    }

    /// Color format of the surface images.
    pub fn surface_format(&self) -> vk::Format {
        lock(&self.presenter).format()
    }

    fn frame(&self, slot: usize) -> &FrameData {
        &self.frames[slot % self.frames.len()]
    }

    /// Submits an empty batch that waits on the slot's acquire semaphore and
    /// signals its fence, for a frame abandoned after acquiring an image.
    fn release_acquire(&self, frame: &FrameData) -> RenderResult<()> {
        let wait_semaphores = [frame.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);

        frame.in_flight.reset()?;
        unsafe {
            self.device
                .submit_graphics(&[submit_info], frame.in_flight.handle())?;
        }
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle: {}", e);
        }
        debug!("Vulkan backend destroyed");
    }
}

impl UniformStorage for Buffer {
    fn handle(&self) -> vk::Buffer {
        Buffer::handle(self)
    }

    fn size(&self) -> vk::DeviceSize {
        Buffer::size(self)
    }

    fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> RenderResult<()> {
        Ok(self.write_data(offset, data)?)
    }
}

impl GpuDevice for VulkanBackend {
    type UniformBuffer = Buffer;

    fn min_uniform_alignment(&self) -> vk::DeviceSize {
        self.device.min_uniform_alignment()
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RenderResult<vk::DescriptorSetLayout> {
        Ok(descriptor::create_set_layout(&self.device, bindings)?)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        descriptor::destroy_set_layout(&self.device, layout);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RenderResult<vk::DescriptorPool> {
        Ok(descriptor::create_pool(&self.device, max_sets, pool_sizes)?)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        descriptor::destroy_pool(&self.device, pool);
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RenderResult<Option<vk::DescriptorSet>> {
        match descriptor::allocate_set(&self.device, pool, layout) {
            Ok(set) => Ok(Some(set)),
            Err(RhiError::PoolExhausted) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        descriptor::update_descriptor_sets(&self.device, writes);
    }

    fn create_uniform_buffer(&self, size: vk::DeviceSize) -> RenderResult<Buffer> {
        Ok(Buffer::new(
            Arc::clone(&self.device),
            BufferUsage::Uniform,
            size,
        )?)
    }

    fn create_pipeline(
        &self,
        desc: &PipelineDesc,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> RenderResult<PipelineHandles> {
        let layout = pipeline::create_pipeline_layout(&self.device, set_layouts)?;
        let graphics = GraphicsPipelineDesc {
            vertex_spirv: &desc.vertex_spirv,
            fragment_spirv: &desc.fragment_spirv,
            vertex_bindings: &desc.vertex_bindings,
            vertex_attributes: &desc.vertex_attributes,
            color_format: self.surface_format(),
            depth_format: Some(DEFAULT_DEPTH_FORMAT),
            material: desc.material,
        };

        match pipeline::create_graphics_pipeline(&self.device, &graphics, layout) {
            Ok(pipeline) => Ok(PipelineHandles { pipeline, layout }),
            Err(e) => {
                pipeline::destroy_pipeline(&self.device, vk::Pipeline::null(), layout);
                Err(e.into())
            }
        }
    }

    fn destroy_pipeline(&self, handles: PipelineHandles) {
        pipeline::destroy_pipeline(&self.device, handles.pipeline, handles.layout);
    }
}

impl FrameBackend for VulkanBackend {
    type Recorder = VulkanRecorder;

    fn wait_for_slot(&self, slot: usize) -> RenderResult<()> {
        let fence = &self.frame(slot).in_flight;
        if fence.is_signaled() {
            return Ok(());
        }
        trace!("Waiting for frame slot {}", slot);
        Ok(fence.wait(self.fence_timeout)?)
    }

    fn surface_extent(&self) -> vk::Extent2D {
        lock(&self.presenter).extent()
    }

    fn recreate_surface(&self) -> RenderResult<()> {
        // Nothing may still reference the old images
        self.device.wait_idle()?;

        let mut presenter = lock(&self.presenter);
        presenter.recreate()?;
        let extent = presenter.extent();

        *lock(&self.render_finished) =
            render_finished_semaphores(&self.device, presenter.image_count())?;
        let mut depth = lock(&self.depth);
        *depth = None;
        *depth = depth_image(&self.device, extent)?;

        info!(
            "Surface recreated: {}x{}, {} images",
            extent.width,
            extent.height,
            presenter.image_count()
        );
        Ok(())
    }

    fn acquire_image(&self, slot: usize) -> RenderResult<AcquireOutcome> {
        let signal = self.frame(slot).image_available.handle();
        match lock(&self.presenter).acquire(signal) {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(RhiError::VulkanError(e).into()),
        }
    }

    fn begin_recording(&self, slot: usize) -> RenderResult<VulkanRecorder> {
        let frame = self.frame(slot);
        let started = frame
            .command_buffer
            .reset()
            .and_then(|()| frame.command_buffer.begin());
        if let Err(e) = started {
            warn!("Frame slot {}: command buffer could not begin: {}", slot, e);
            self.release_acquire(frame)?;
            return Err(e.into());
        }
        Ok(VulkanRecorder::new(frame.command_buffer.clone()))
    }

    fn record_uploads(&self, recorder: &mut VulkanRecorder, uploads: &UploadBatch) {
        if uploads.is_empty() {
            return;
        }
        let cmd = recorder.command_buffer();

        let transitions = |old_layout, new_layout| -> Vec<ImageTransition> {
            uploads
                .images
                .iter()
                .map(|upload| ImageTransition {
                    image: upload.image,
                    aspect: upload.aspect,
                    layer_count: upload.layer_count,
                    old_layout,
                    new_layout,
                })
                .collect()
        };

        cmd.transition_images(&transitions(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ));

        for upload in &uploads.buffers {
            cmd.copy_buffer(upload.src, upload.dst, &[upload.region]);
        }
        for upload in &uploads.images {
            cmd.copy_buffer_to_image(upload.src, upload.image, &upload.regions);
        }

        cmd.transition_images(&transitions(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ));

        if !uploads.buffers.is_empty() {
            let barriers: Vec<_> = uploads
                .buffers
                .iter()
                .map(|upload| {
                    vk::BufferMemoryBarrier::default()
                        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                        .dst_access_mask(
                            vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ,
                        )
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(upload.dst)
                        .offset(upload.region.dst_offset)
                        .size(upload.region.size)
                })
                .collect();
            cmd.pipeline_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_INPUT,
                &barriers,
                &[],
            );
        }

        debug!(
            "Recorded {} buffer and {} image upload(s)",
            uploads.buffers.len(),
            uploads.images.len()
        );
    }

    fn begin_render_pass(
        &self,
        recorder: &mut VulkanRecorder,
        image_index: u32,
        clear_color: [f32; 4],
    ) {
        let cmd = recorder.command_buffer();
        let (extent, color_image, color_view) = {
            let presenter = lock(&self.presenter);
            (
                presenter.extent(),
                presenter.image(image_index),
                presenter.image_view(image_index),
            )
        };
        let depth = lock(&self.depth);

        let mut transitions = vec![ImageTransition {
            image: color_image,
            aspect: vk::ImageAspectFlags::COLOR,
            layer_count: 1,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        if let Some(depth) = depth.as_ref() {
            transitions.push(ImageTransition {
                image: depth.handle(),
                aspect: vk::ImageAspectFlags::DEPTH,
                layer_count: 1,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            });
        } else {
            warn!("Rendering without a depth attachment");
        }
        cmd.transition_images(&transitions);

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            });

        let depth_attachment = depth.as_ref().map(|depth| {
            vk::RenderingAttachmentInfo::default()
                .image_view(depth.view())
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                })
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(full_rect(extent))
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }

        cmd.begin_rendering(&rendering_info);
        cmd.set_viewport(&vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        cmd.set_scissor(&full_rect(extent));
    }

    fn end_render_pass(&self, recorder: &mut VulkanRecorder, image_index: u32) {
        let cmd = recorder.command_buffer();
        cmd.end_rendering();

        let color_image = lock(&self.presenter).image(image_index);
        cmd.transition_images(&[ImageTransition {
            image: color_image,
            aspect: vk::ImageAspectFlags::COLOR,
            layer_count: 1,
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }]);
    }

    fn submit(&self, slot: usize, image_index: u32, recorder: VulkanRecorder) -> RenderResult<()> {
        let frame = self.frame(slot);
        let cmd = recorder.command_buffer();
        cmd.end()?;

        let render_finished = lock(&self.render_finished);
        let signal = render_finished
            .get(image_index as usize)
            .map(Semaphore::handle)
            .ok_or_else(|| {
                RhiError::InvalidHandle(format!("No semaphore for surface image {}", image_index))
            })?;

        let wait_semaphores = [frame.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [signal];
        let command_buffers = [cmd.handle()];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // The fence stays signaled until a submission is certain to follow
        frame.in_flight.reset()?;
        unsafe {
            self.device
                .submit_graphics(&[submit_info], frame.in_flight.handle())?;
        }
        Ok(())
    }

    fn present(&self, _slot: usize, image_index: u32) -> RenderResult<PresentOutcome> {
        let wait = lock(&self.render_finished)
            .get(image_index as usize)
            .map(Semaphore::handle)
            .ok_or_else(|| {
                RhiError::InvalidHandle(format!("No semaphore for surface image {}", image_index))
            })?;

        let result =
            lock(&self.presenter).present(self.device.present_queue(), image_index, wait);
        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(vk::Result::SUBOPTIMAL_KHR) => Ok(PresentOutcome::Suboptimal),
            Err(e) => Err(RhiError::VulkanError(e).into()),
        }
    }

    fn wait_idle(&self) -> RenderResult<()> {
        Ok(self.device.wait_idle()?)
    }
}
