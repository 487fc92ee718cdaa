//! In-memory device for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk::{self, Handle};

use crate::device::{
    AcquireOutcome, CommandRecorder, FrameBackend, GpuDevice, PipelineHandles, PresentOutcome,
    UniformStorage,
};
use crate::draw::GpuCommand;
use crate::error::{RenderError, RenderResult};
use crate::pipeline::PipelineDesc;
use crate::render_state::{DescriptorWrite, FrameRenderState, UploadBatch};
use crate::resource::{BufferBinding, GeometryBuffer, RenderResource, TextureResource};
use crate::scheduler::FrameEvent;

const IMAGE_COUNT: u32 = 3;

/// Calls observed by the mock, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MockEvent {
    WaitForSlot(usize),
    RecreateSurface,
    Acquire(usize),
    BeginRecording(usize),
    RecordUploads,
    UpdateDescriptors(usize),
    BeginRenderPass(u32),
    EndRenderPass(u32),
    Submit(usize, u32),
    Present(usize, u32),
    WaitIdle,
    Callback(FrameEvent),
}

struct MockPool {
    capacity: u32,
    allocated: u32,
}

#[derive(Default)]
struct MockState {
    pools: HashMap<vk::DescriptorPool, MockPool>,
    pool_capacities: Vec<u32>,
    destroyed_pools: usize,
    destroyed_layouts: usize,
    allocated_sets: usize,
    exhaust_pools: bool,
    uniform_buffers: Vec<(vk::DeviceSize, Arc<Mutex<Vec<u8>>>)>,
    fail_uniform_buffers: bool,
    fail_begin_recording: bool,
    pipelines: HashMap<vk::Pipeline, Vec<vk::DescriptorSetLayout>>,
    destroyed_pipelines: usize,
    descriptor_batches: Vec<usize>,
    extent: vk::Extent2D,
    next_image: u32,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    submitted: Vec<Vec<GpuCommand>>,
    clear_colors: Vec<[f32; 4]>,
    events: Vec<MockEvent>,
}

/// Device that fabricates handles and logs every call.
pub(crate) struct MockDevice {
    next_handle: AtomicU64,
    uniform_writes: Arc<AtomicUsize>,
    state: Mutex<MockState>,
}

impl MockDevice {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(1),
            uniform_writes: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(MockState {
                extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn log(&self, event: MockEvent) {
        self.lock().events.push(event);
    }

    pub(crate) fn events(&self) -> Vec<MockEvent> {
        self.lock().events.clone()
    }

    pub(crate) fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// A uniform buffer not tracked by the device.
    pub(crate) fn uniform_buffer(&self, size: vk::DeviceSize) -> MockUniformBuffer {
        MockUniformBuffer {
            handle: self.handle(),
            data: Arc::new(Mutex::new(vec![0; size as usize])),
            writes: Arc::clone(&self.uniform_writes),
        }
    }

    pub(crate) fn pool_capacities(&self) -> Vec<u32> {
        self.lock().pool_capacities.clone()
    }

    pub(crate) fn destroyed_pool_count(&self) -> usize {
        self.lock().destroyed_pools
    }

    pub(crate) fn destroyed_layout_count(&self) -> usize {
        self.lock().destroyed_layouts
    }

    pub(crate) fn allocated_set_count(&self) -> usize {
        self.lock().allocated_sets
    }

    pub(crate) fn exhaust_pools(&self, exhaust: bool) {
        self.lock().exhaust_pools = exhaust;
    }

    pub(crate) fn fail_uniform_buffers(&self, fail: bool) {
        self.lock().fail_uniform_buffers = fail;
    }

    pub(crate) fn uniform_buffer_count(&self) -> usize {
        self.lock().uniform_buffers.len()
    }

    pub(crate) fn uniform_buffer_sizes(&self) -> Vec<vk::DeviceSize> {
        self.lock().uniform_buffers.iter().map(|(size, _)| *size).collect()
    }

    pub(crate) fn uniform_contents(&self, buffer: usize, offset: u64, len: usize) -> Vec<u8> {
        let state = self.lock();
        let data = state.uniform_buffers[buffer].1.lock().unwrap();
        data[offset as usize..offset as usize + len].to_vec()
    }

    pub(crate) fn uniform_write_count(&self) -> usize {
        self.uniform_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn pipeline_set_layouts(&self, handles: PipelineHandles) -> Vec<vk::DescriptorSetLayout> {
        self.lock().pipelines[&handles.pipeline].clone()
    }

    pub(crate) fn destroyed_pipeline_count(&self) -> usize {
        self.lock().destroyed_pipelines
    }

    pub(crate) fn descriptor_write_batches(&self) -> Vec<usize> {
        self.lock().descriptor_batches.clone()
    }

    pub(crate) fn set_extent(&self, width: u32, height: u32) {
        self.lock().extent = vk::Extent2D { width, height };
    }

    pub(crate) fn script_acquire(&self, outcome: AcquireOutcome) {
        self.lock().acquire_script.push_back(outcome);
    }

    pub(crate) fn script_present(&self, outcome: PresentOutcome) {
        self.lock().present_script.push_back(outcome);
    }

    pub(crate) fn submitted_commands(&self) -> Vec<Vec<GpuCommand>> {
        self.lock().submitted.clone()
    }

    pub(crate) fn fail_begin_recording(&self, fail: bool) {
        self.lock().fail_begin_recording = fail;
    }

    pub(crate) fn clear_colors(&self) -> Vec<[f32; 4]> {
        self.lock().clear_colors.clone()
    }
}

/// Host memory standing in for a mapped uniform buffer.
pub(crate) struct MockUniformBuffer {
    handle: vk::Buffer,
    data: Arc<Mutex<Vec<u8>>>,
    writes: Arc<AtomicUsize>,
}

impl UniformStorage for MockUniformBuffer {
    fn handle(&self) -> vk::Buffer {
        self.handle
    }

    fn size(&self) -> vk::DeviceSize {
        self.data.lock().unwrap().len() as vk::DeviceSize
    }

    fn write(&self, offset: vk::DeviceSize, bytes: &[u8]) -> RenderResult<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl GpuDevice for MockDevice {
    type UniformBuffer = MockUniformBuffer;

    fn min_uniform_alignment(&self) -> vk::DeviceSize {
        256
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RenderResult<vk::DescriptorSetLayout> {
        Ok(self.handle())
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.lock().destroyed_layouts += 1;
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RenderResult<vk::DescriptorPool> {
        let pool = self.handle();
        let mut state = self.lock();
        state.pools.insert(
            pool,
            MockPool {
                capacity: max_sets,
                allocated: 0,
            },
        );
        state.pool_capacities.push(max_sets);
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.lock();
        state.pools.remove(&pool);
        state.destroyed_pools += 1;
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> RenderResult<Option<vk::DescriptorSet>> {
        let set = self.handle();
        let mut state = self.lock();
        if state.exhaust_pools {
            return Ok(None);
        }
        let Some(entry) = state.pools.get_mut(&pool) else {
            return Err(RenderError::Allocation("unknown pool".to_string()));
        };
        if entry.allocated >= entry.capacity {
            return Ok(None);
        }
        entry.allocated += 1;
        state.allocated_sets += 1;
        Ok(Some(set))
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.lock();
        state.descriptor_batches.push(writes.len());
        state.events.push(MockEvent::UpdateDescriptors(writes.len()));
    }

    fn create_uniform_buffer(&self, size: vk::DeviceSize) -> RenderResult<MockUniformBuffer> {
        if self.lock().fail_uniform_buffers {
            return Err(RenderError::Allocation("uniform buffer".to_string()));
        }
        let buffer = self.uniform_buffer(size);
        self.lock()
            .uniform_buffers
            .push((size, Arc::clone(&buffer.data)));
        Ok(buffer)
    }

    fn create_pipeline(
        &self,
        _desc: &PipelineDesc,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> RenderResult<PipelineHandles> {
        let handles = PipelineHandles {
            pipeline: self.handle(),
            layout: self.handle(),
        };
        self.lock()
            .pipelines
            .insert(handles.pipeline, set_layouts.to_vec());
        Ok(handles)
    }

    fn destroy_pipeline(&self, handles: PipelineHandles) {
        let mut state = self.lock();
        state.pipelines.remove(&handles.pipeline);
        state.destroyed_pipelines += 1;
    }
}

impl FrameBackend for MockDevice {
    type Recorder = MockRecorder;

    fn wait_for_slot(&self, slot: usize) -> RenderResult<()> {
        self.log(MockEvent::WaitForSlot(slot));
        Ok(())
    }

    fn surface_extent(&self) -> vk::Extent2D {
        self.lock().extent
    }

    fn recreate_surface(&self) -> RenderResult<()> {
        self.log(MockEvent::RecreateSurface);
        Ok(())
    }

    fn acquire_image(&self, slot: usize) -> RenderResult<AcquireOutcome> {
        let mut state = self.lock();
        state.events.push(MockEvent::Acquire(slot));
        if let Some(outcome) = state.acquire_script.pop_front() {
            return Ok(outcome);
        }
        let image_index = state.next_image;
        state.next_image = (image_index + 1) % IMAGE_COUNT;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn begin_recording(&self, slot: usize) -> RenderResult<MockRecorder> {
        let mut state = self.lock();
        state.events.push(MockEvent::BeginRecording(slot));
        if state.fail_begin_recording {
            return Err(RenderError::Allocation("command buffer".to_string()));
        }
        Ok(MockRecorder::default())
    }

    fn record_uploads(&self, _recorder: &mut MockRecorder, _uploads: &UploadBatch) {
        self.log(MockEvent::RecordUploads);
    }

    fn begin_render_pass(
        &self,
        _recorder: &mut MockRecorder,
        image_index: u32,
        clear_color: [f32; 4],
    ) {
        let mut state = self.lock();
        state.events.push(MockEvent::BeginRenderPass(image_index));
        state.clear_colors.push(clear_color);
    }

    fn end_render_pass(&self, _recorder: &mut MockRecorder, image_index: u32) {
        self.log(MockEvent::EndRenderPass(image_index));
    }

    fn submit(&self, slot: usize, image_index: u32, recorder: MockRecorder) -> RenderResult<()> {
        let mut state = self.lock();
        state.events.push(MockEvent::Submit(slot, image_index));
        state.submitted.push(recorder.commands);
        Ok(())
    }

    fn present(&self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome> {
        let mut state = self.lock();
        state.events.push(MockEvent::Present(slot, image_index));
        Ok(state
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn wait_idle(&self) -> RenderResult<()> {
        self.log(MockEvent::WaitIdle);
        Ok(())
    }
}

/// Records the compiled commands it receives.
#[derive(Default)]
pub(crate) struct MockRecorder {
    pub(crate) commands: Vec<GpuCommand>,
}

impl CommandRecorder for MockRecorder {
    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.commands.push(GpuCommand::BindPipeline(pipeline));
    }

    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, index: u32, set: vk::DescriptorSet) {
        self.commands
            .push(GpuCommand::BindDescriptorSet { layout, index, set });
    }

    fn bind_vertex_buffer(&mut self, binding: BufferBinding) {
        self.commands.push(GpuCommand::BindVertexBuffer(binding));
    }

    fn bind_index_buffer(&mut self, binding: BufferBinding, index_type: vk::IndexType) {
        self.commands
            .push(GpuCommand::BindIndexBuffer(binding, index_type));
    }

    fn set_scissor(&mut self, rect: vk::Rect2D) {
        self.commands.push(GpuCommand::SetScissor(rect));
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32) {
        self.commands.push(GpuCommand::DrawIndexed {
            index_count,
            first_index,
            vertex_offset,
        });
    }
}

/// Texture with a settable version.
pub(crate) struct MockTexture {
    version: AtomicU64,
    renders: AtomicUsize,
}

impl MockTexture {
    pub(crate) fn new(version: u64) -> Arc<Self> {
        Arc::new(Self {
            version: AtomicU64::new(version),
            renders: AtomicUsize::new(0),
        })
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

impl RenderResource for MockTexture {
    fn on_render(&self, _state: &mut FrameRenderState) -> RenderResult<()> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl TextureResource for MockTexture {
    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: vk::Sampler::from_raw(0xa),
            image_view: vk::ImageView::from_raw(0xb + self.version()),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

/// Geometry with a fixed handle and element count.
pub(crate) struct MockGeometry {
    buffer: vk::Buffer,
    len: u32,
}

impl MockGeometry {
    pub(crate) fn new(raw: u64, len: u32) -> Arc<Self> {
        Arc::new(Self {
            buffer: vk::Buffer::from_raw(0x1000 + raw),
            len,
        })
    }
}

impl RenderResource for MockGeometry {
    fn on_render(&self, _state: &mut FrameRenderState) -> RenderResult<()> {
        Ok(())
    }
}

impl GeometryBuffer for MockGeometry {
    fn binding(&self, _slot: usize) -> BufferBinding {
        BufferBinding {
            buffer: self.buffer,
            offset: 0,
        }
    }

    fn len(&self) -> u32 {
        self.len
    }
}
