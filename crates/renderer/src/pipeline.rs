//! Scene types, scenes and render pipelines.
//!
//! Every pipeline layout has three descriptor sets: set 0 holds scene-level
//! bindings (camera, lights), set 1 material bindings and set 2 instance
//! bindings. A [`RenderSceneType`] owns the set 0 layout and factory, so all
//! pipelines created for one scene type agree on set 0 and a scene's set stays
//! bound across pipeline switches.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use ash::vk;
use tracing::{debug, info};
use vkframe_core::RendererConfig;
use vkframe_rhi::pipeline::MaterialConfig;

use crate::binding::{BindingData, BindingDataFactory, BindingDesc, BindingLayout};
use crate::device::{GpuDevice, PipelineHandles};
use crate::error::RenderResult;
use crate::frame::FrameCounter;
use crate::garbage::GarbageQueue;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Shaders, vertex input and bindings of a pipeline.
#[derive(Clone, Debug, Default)]
pub struct PipelineDesc {
    /// Vertex stage SPIR-V words.
    pub vertex_spirv: Vec<u32>,
    /// Fragment stage SPIR-V words.
    pub fragment_spirv: Vec<u32>,
    /// Vertex input bindings.
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    /// Vertex input attributes.
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    /// Cull, blend and depth state.
    pub material: MaterialConfig,
    /// Bindings of set 1.
    pub material_bindings: Vec<BindingDesc>,
    /// Bindings of set 2.
    pub instance_bindings: Vec<BindingDesc>,
}

/// Bindings shared by all scenes of one kind.
pub struct RenderSceneType<D: GpuDevice> {
    id: u64,
    factory: BindingDataFactory<D>,
}

impl<D: GpuDevice> RenderSceneType<D> {
    /// Creates a scene type with scene-level `bindings`.
    pub fn new(
        device: Arc<D>,
        bindings: Vec<BindingDesc>,
        config: &RendererConfig,
        frames: FrameCounter,
        garbage: GarbageQueue<D>,
    ) -> RenderResult<Self> {
        let layout = BindingLayout::new(bindings, device.min_uniform_alignment())?;
        let factory = BindingDataFactory::new(device, layout, config, frames, garbage)?;
        Ok(Self {
            id: next_object_id(),
            factory,
        })
    }

    /// Unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Factory of scene binding data.
    pub fn factory(&self) -> &BindingDataFactory<D> {
        &self.factory
    }
}

/// A group of draws sharing scene bindings.
///
/// Scenes are drawn in ascending `order`, ties broken by creation order.
pub struct RenderScene<D: GpuDevice> {
    id: u64,
    order: AtomicI32,
    scene_type: Arc<RenderSceneType<D>>,
    data: Arc<BindingData<D>>,
}

impl<D: GpuDevice> RenderScene<D> {
    /// Creates a scene of `scene_type` drawn at `order`.
    pub fn new(scene_type: Arc<RenderSceneType<D>>, order: i32) -> RenderResult<Self> {
        let data = scene_type.factory().new_binding_data()?;
        Ok(Self {
            id: next_object_id(),
            order: AtomicI32::new(order),
            scene_type,
            data,
        })
    }

    /// Unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Draw order.
    pub fn order(&self) -> i32 {
        self.order.load(Ordering::Relaxed)
    }

    /// Changes the draw order, effective from the next accumulated draw.
    pub fn set_order(&self, order: i32) {
        self.order.store(order, Ordering::Relaxed);
    }

    /// Scene type.
    pub fn scene_type(&self) -> &Arc<RenderSceneType<D>> {
        &self.scene_type
    }

    /// Scene binding data (set 0).
    pub fn data(&self) -> &Arc<BindingData<D>> {
        &self.data
    }
}

/// A graphics pipeline with factories for its material and instance data.
pub struct RenderPipeline<D: GpuDevice> {
    id: u64,
    handles: PipelineHandles,
    scene_type: Arc<RenderSceneType<D>>,
    material_factory: BindingDataFactory<D>,
    instance_factory: BindingDataFactory<D>,
    garbage: GarbageQueue<D>,
}

impl<D: GpuDevice> RenderPipeline<D> {
    /// Creates the material and instance factories and the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if a binding list is invalid or the device fails to
    /// build the pipeline.
    pub fn new(
        device: Arc<D>,
        scene_type: Arc<RenderSceneType<D>>,
        desc: &PipelineDesc,
        config: &RendererConfig,
        frames: FrameCounter,
        garbage: GarbageQueue<D>,
    ) -> RenderResult<Self> {
        let alignment = device.min_uniform_alignment();
        let material_factory = BindingDataFactory::new(
            Arc::clone(&device),
            BindingLayout::new(desc.material_bindings.clone(), alignment)?,
            config,
            frames.clone(),
            garbage.clone(),
        )?;
        let instance_factory = BindingDataFactory::new(
            Arc::clone(&device),
            BindingLayout::new(desc.instance_bindings.clone(), alignment)?,
            config,
            frames,
            garbage.clone(),
        )?;

        let set_layouts = [
            scene_type.factory().set_layout(),
            material_factory.set_layout(),
            instance_factory.set_layout(),
        ];
        let handles = device.create_pipeline(desc, &set_layouts)?;

        let id = next_object_id();
        info!(
            "Render pipeline #{} created: {} material, {} instance binding(s)",
            id,
            desc.material_bindings.len(),
            desc.instance_bindings.len()
        );

        Ok(Self {
            id,
            handles,
            scene_type,
            material_factory,
            instance_factory,
            garbage,
        })
    }

    /// Unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pipeline and layout handles.
    pub fn handles(&self) -> PipelineHandles {
        self.handles
    }

    /// Scene type whose set 0 layout this pipeline uses.
    pub fn scene_type(&self) -> &Arc<RenderSceneType<D>> {
        &self.scene_type
    }

    /// Allocates material binding data (set 1).
    pub fn new_material_data(&self) -> RenderResult<Arc<BindingData<D>>> {
        self.material_factory.new_binding_data()
    }

    /// Allocates instance binding data (set 2).
    pub fn new_instance_data(&self) -> RenderResult<Arc<BindingData<D>>> {
        self.instance_factory.new_binding_data()
    }

    /// Material factory.
    pub fn material_factory(&self) -> &BindingDataFactory<D> {
        &self.material_factory
    }

    /// Instance factory.
    pub fn instance_factory(&self) -> &BindingDataFactory<D> {
        &self.instance_factory
    }
}

impl<D: GpuDevice> Drop for RenderPipeline<D> {
    fn drop(&mut self) {
        let handles = self.handles;
        self.garbage
            .dispose("graphics pipeline", move |device: &D| {
                device.destroy_pipeline(handles)
            });
        debug!("Render pipeline #{} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::ALL_GRAPHICS;

    fn scene_type(
        device: &Arc<MockDevice>,
        garbage: &GarbageQueue<MockDevice>,
    ) -> Arc<RenderSceneType<MockDevice>> {
        Arc::new(
            RenderSceneType::new(
                device.clone(),
                vec![BindingDesc::constants(0, 128, STAGES)],
                &RendererConfig::default(),
                FrameCounter::new(),
                garbage.clone(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_pipeline_layout_has_three_sets() {
        let device = MockDevice::new();
        let garbage = GarbageQueue::new(FrameCounter::new());
        let scene_type = scene_type(&device, &garbage);
        let desc = PipelineDesc {
            material_bindings: vec![BindingDesc::texture(0, STAGES)],
            ..Default::default()
        };

        let pipeline = RenderPipeline::new(
            device.clone(),
            scene_type.clone(),
            &desc,
            &RendererConfig::default(),
            FrameCounter::new(),
            garbage.clone(),
        )
        .unwrap();

        let layouts = device.pipeline_set_layouts(pipeline.handles());
        assert_eq!(layouts.len(), 3);
        assert_eq!(layouts[0], scene_type.factory().set_layout());
        assert_eq!(layouts[1], pipeline.material_factory().set_layout());
        assert_eq!(layouts[2], pipeline.instance_factory().set_layout());
    }

    #[test]
    fn test_pipeline_destroyed_through_garbage() {
        let device = MockDevice::new();
        let garbage = GarbageQueue::new(FrameCounter::new());
        let pipeline = RenderPipeline::new(
            device.clone(),
            scene_type(&device, &garbage),
            &PipelineDesc::default(),
            &RendererConfig::default(),
            FrameCounter::new(),
            garbage.clone(),
        )
        .unwrap();

        drop(pipeline);
        assert_eq!(device.destroyed_pipeline_count(), 0);
        garbage.flush(&device);
        assert_eq!(device.destroyed_pipeline_count(), 1);
    }

    #[test]
    fn test_scene_ids_and_order() {
        let device = MockDevice::new();
        let garbage = GarbageQueue::new(FrameCounter::new());
        let scene_type = scene_type(&device, &garbage);

        let a = RenderScene::new(scene_type.clone(), 5).unwrap();
        let b = RenderScene::new(scene_type, 5).unwrap();
        assert!(a.id() < b.id());

        b.set_order(-1);
        assert_eq!(b.order(), -1);
        assert!(a.data().layout().has_values());
    }
}
