//! Bound resources of one draw-level object.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ash::vk;
use bytemuck::Pod;
use vkframe_rhi::descriptor::{DescriptorWrite, DescriptorWriteKind, buffer_info};

use crate::MAX_FRAMES_IN_FLIGHT;
use crate::binding::factory::FactoryShared;
use crate::binding::layout::{BindingKind, BindingLayout};
use crate::device::{GpuDevice, UniformStorage};
use crate::error::{RenderError, RenderResult};
use crate::garbage::GarbageQueue;
use crate::render_state::FrameRenderState;
use crate::resource::{RenderResource, TextureResource};

/// Value slot of a binding data within a buffer group.
pub(crate) struct ValueSlot<D: GpuDevice> {
    pub(crate) storage: Arc<D::UniformBuffer>,
    pub(crate) group: usize,
    pub(crate) slot: u32,
}

enum DataItem {
    Texture {
        texture: Option<Arc<dyn TextureResource>>,
        bound: [Option<u64>; MAX_FRAMES_IN_FLIGHT],
    },
    Constants {
        offset: u64,
        size: u64,
        bound: [bool; MAX_FRAMES_IN_FLIGHT],
    },
}

struct BindingState {
    items: Vec<DataItem>,
    values: Vec<u8>,
    value_version: u64,
    uploaded_version: [u64; MAX_FRAMES_IN_FLIGHT],
}

/// Textures and uniform values bound to one scene, material or instance.
///
/// The shape is fixed by the [`BindingLayout`] of the factory that created
/// it. Values are staged on the CPU and written to the current frame slot's
/// region of the uniform storage in [`on_render`](RenderResource::on_render),
/// so updating a value never touches memory an in-flight frame reads.
pub struct BindingData<D: GpuDevice> {
    factory: Weak<FactoryShared<D>>,
    garbage: GarbageQueue<D>,
    layout: Arc<BindingLayout>,
    value_slot: Option<ValueSlot<D>>,
    buffer_slots: u32,
    descriptor_sets: Vec<vk::DescriptorSet>,
    state: Mutex<BindingState>,
}

impl<D: GpuDevice> BindingData<D> {
    pub(crate) fn new(
        factory: Weak<FactoryShared<D>>,
        garbage: GarbageQueue<D>,
        layout: Arc<BindingLayout>,
        value_slot: Option<ValueSlot<D>>,
        buffer_slots: u32,
        descriptor_sets: Vec<vk::DescriptorSet>,
    ) -> Self {
        let items = layout
            .descs()
            .iter()
            .enumerate()
            .map(|(index, desc)| match desc.kind {
                BindingKind::Texture => DataItem::Texture {
                    texture: None,
                    bound: [None; MAX_FRAMES_IN_FLIGHT],
                },
                BindingKind::Constants { size } => DataItem::Constants {
                    offset: layout.value_offset(index).unwrap_or(0),
                    size: size as u64,
                    bound: [false; MAX_FRAMES_IN_FLIGHT],
                },
            })
            .collect();

        let state = BindingState {
            items,
            values: vec![0; layout.stride() as usize],
            // Uploaded versions start at 0 so zeroed values reach the GPU
            value_version: 1,
            uploaded_version: [0; MAX_FRAMES_IN_FLIGHT],
        };

        Self {
            factory,
            garbage,
            layout,
            value_slot,
            buffer_slots,
            descriptor_sets,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BindingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Layout of this data.
    pub fn layout(&self) -> &BindingLayout {
        &self.layout
    }

    /// Descriptor set for frame slot `slot`, or null for an empty layout.
    pub fn descriptor_set(&self, slot: usize) -> vk::DescriptorSet {
        self.descriptor_sets
            .get(slot)
            .copied()
            .unwrap_or_else(vk::DescriptorSet::null)
    }

    /// All descriptor sets, one per frame slot.
    pub fn descriptor_sets(&self) -> &[vk::DescriptorSet] {
        &self.descriptor_sets
    }

    /// Buffer group and slot holding the values, if the layout has any.
    pub fn value_slot(&self) -> Option<(usize, u32)> {
        self.value_slot.as_ref().map(|v| (v.group, v.slot))
    }

    /// Binds `texture` at binding index `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of range or not a texture binding.
    pub fn set_texture(
        &self,
        index: usize,
        texture: Option<Arc<dyn TextureResource>>,
    ) -> RenderResult<()> {
        let mut state = self.lock();
        match state.items.get_mut(index) {
            Some(DataItem::Texture {
                texture: current,
                bound,
            }) => {
                *current = texture;
                *bound = [None; MAX_FRAMES_IN_FLIGHT];
                Ok(())
            }
            _ => Err(self.kind_error(index, BindingKind::Texture)),
        }
    }

    /// Texture bound at `index`.
    pub fn texture(&self, index: usize) -> RenderResult<Option<Arc<dyn TextureResource>>> {
        match self.lock().items.get(index) {
            Some(DataItem::Texture { texture, .. }) => Ok(texture.clone()),
            _ => Err(self.kind_error(index, BindingKind::Texture)),
        }
    }

    /// Replaces the values of constant binding `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is not a constant binding or `bytes` does
    /// not match its declared size.
    pub fn set_constants(&self, index: usize, bytes: &[u8]) -> RenderResult<()> {
        let mut state = self.lock();
        let (offset, size) = self.constants_range(&state, index)?;
        if bytes.len() as u64 != size {
            return Err(RenderError::ValueSize {
                index,
                expected: size,
                actual: bytes.len() as u64,
            });
        }

        let start = offset as usize;
        state.values[start..start + bytes.len()].copy_from_slice(bytes);
        state.value_version += 1;
        Ok(())
    }

    /// Current values of constant binding `index`.
    pub fn constants(&self, index: usize) -> RenderResult<Vec<u8>> {
        let state = self.lock();
        let (offset, size) = self.constants_range(&state, index)?;
        let start = offset as usize;
        Ok(state.values[start..start + size as usize].to_vec())
    }

    /// Typed form of [`set_constants`](Self::set_constants).
    pub fn set_value<T: Pod>(&self, index: usize, value: &T) -> RenderResult<()> {
        self.set_constants(index, bytemuck::bytes_of(value))
    }

    /// Typed form of [`constants`](Self::constants).
    pub fn value<T: Pod>(&self, index: usize) -> RenderResult<T> {
        let bytes = self.constants(index)?;
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(RenderError::ValueSize {
                index,
                expected: bytes.len() as u64,
                actual: std::mem::size_of::<T>() as u64,
            });
        }
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    fn kind_error(&self, index: usize, expected: BindingKind) -> RenderError {
        match self.layout.desc(index) {
            Ok(desc) => RenderError::BindingKind {
                index,
                expected: expected.name(),
                actual: desc.kind.name(),
            },
            Err(e) => e,
        }
    }

    fn constants_range(&self, state: &BindingState, index: usize) -> RenderResult<(u64, u64)> {
        match state.items.get(index) {
            Some(DataItem::Constants { offset, size, .. }) => Ok((*offset, *size)),
            _ => Err(self.kind_error(index, BindingKind::Constants { size: 0 })),
        }
    }

    /// Start of this data's value block for frame slot `frame_slot`.
    fn region_offset(&self, value_slot: &ValueSlot<D>, frame_slot: usize) -> u64 {
        let index = frame_slot as u64 * self.buffer_slots as u64 + value_slot.slot as u64;
        index * self.layout.stride()
    }
}

impl<D: GpuDevice> RenderResource for BindingData<D> {
    fn on_render(&self, render_state: &mut FrameRenderState) -> RenderResult<()> {
        let slot = render_state.slot();
        let Some(&set) = self.descriptor_sets.get(slot) else {
            return Ok(());
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        let region = self
            .value_slot
            .as_ref()
            .map(|value_slot| (value_slot, self.region_offset(value_slot, slot)));

        if let Some((value_slot, base)) = region
            && state.uploaded_version[slot] != state.value_version
        {
            value_slot.storage.write(base, &state.values)?;
            state.uploaded_version[slot] = state.value_version;
        }

        for (item, desc) in state.items.iter_mut().zip(self.layout.descs()) {
            match item {
                DataItem::Texture {
                    texture: Some(texture),
                    bound,
                } => {
                    let version = texture.version();
                    if bound[slot] != Some(version) {
                        render_state.push_descriptor_write(DescriptorWrite {
                            set,
                            binding: desc.binding,
                            kind: DescriptorWriteKind::Image(texture.descriptor_info()),
                        });
                        bound[slot] = Some(version);
                    }
                    let participant: Arc<dyn RenderResource> = texture.clone();
                    render_state.add_participant(participant);
                }
                DataItem::Texture { texture: None, .. } => {}
                DataItem::Constants {
                    offset,
                    size,
                    bound,
                } => {
                    if !bound[slot]
                        && let Some((value_slot, base)) = region
                    {
                        render_state.push_descriptor_write(DescriptorWrite {
                            set,
                            binding: desc.binding,
                            kind: DescriptorWriteKind::Buffer(buffer_info(
                                value_slot.storage.handle(),
                                base + *offset,
                                *size,
                            )),
                        });
                        bound[slot] = true;
                    }
                }
            }
        }

        Ok(())
    }
}

impl<D: GpuDevice> Drop for BindingData<D> {
    fn drop(&mut self) {
        let sets = std::mem::take(&mut self.descriptor_sets);
        let value_slot = self.value_slot.take();

        if let Some(factory) = self.factory.upgrade() {
            factory.reclaim(value_slot.as_ref().map(|v| (v.group, v.slot)), &sets);
        }

        // Frames in flight may still read the storage through this data
        if let Some(value_slot) = value_slot {
            let storage = value_slot.storage;
            self.garbage
                .dispose("uniform storage", move |_: &D| drop(storage));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::factory::BindingDataFactory;
    use crate::binding::layout::BindingDesc;
    use crate::frame::FrameCounter;
    use crate::testing::{MockDevice, MockTexture};
    use vkframe_core::RendererConfig;

    const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::ALL_GRAPHICS;

    fn material_factory(device: &Arc<MockDevice>) -> BindingDataFactory<MockDevice> {
        let layout = BindingLayout::new(
            vec![
                BindingDesc::constants(0, 16, STAGES),
                BindingDesc::texture(1, STAGES),
            ],
            device.min_uniform_alignment(),
        )
        .unwrap();
        BindingDataFactory::new(
            device.clone(),
            layout,
            &RendererConfig::default().with_buffer_slots(4),
            FrameCounter::new(),
            GarbageQueue::new(FrameCounter::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_kind_and_size_checked() {
        let device = MockDevice::new();
        let data = material_factory(&device).new_binding_data().unwrap();

        assert!(matches!(
            data.set_constants(1, &[0; 16]),
            Err(RenderError::BindingKind { index: 1, .. })
        ));
        assert!(matches!(
            data.set_texture(0, None),
            Err(RenderError::BindingKind { index: 0, .. })
        ));
        assert!(matches!(
            data.set_constants(0, &[0; 8]),
            Err(RenderError::ValueSize { expected: 16, actual: 8, .. })
        ));
        assert!(matches!(
            data.constants(5),
            Err(RenderError::BindingIndex { index: 5, len: 2 })
        ));
    }

    #[test]
    fn test_typed_values() {
        let device = MockDevice::new();
        let data = material_factory(&device).new_binding_data().unwrap();

        let color = [0.25f32, 0.5, 0.75, 1.0];
        data.set_value(0, &color).unwrap();
        assert_eq!(data.value::<[f32; 4]>(0).unwrap(), color);
        assert!(data.value::<[f32; 2]>(0).is_err());
    }

    #[test]
    fn test_on_render_writes_values_and_descriptors() {
        let device = MockDevice::new();
        let data = material_factory(&device).new_binding_data().unwrap();
        let texture = MockTexture::new(7);
        data.set_value(0, &[1u32, 2, 3, 4]).unwrap();
        data.set_texture(1, Some(texture.clone())).unwrap();

        let mut state = FrameRenderState::new(1);
        data.on_render(&mut state).unwrap();

        // One buffer write for the constants, one image write for the texture
        let writes = state.descriptor_writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.set == data.descriptor_set(1)));
        assert!(matches!(writes[0].kind, DescriptorWriteKind::Buffer(_)));
        assert!(matches!(writes[1].kind, DescriptorWriteKind::Image(_)));
        assert_eq!(state.participant_count(), 1);

        // Slot 1 region of value slot 0: (1 * 4 + 0) * stride
        let stride = data.layout().stride();
        let written = device.uniform_contents(0, 4 * stride, 16);
        assert_eq!(written, bytemuck::bytes_of(&[1u32, 2, 3, 4]).to_vec());
    }

    #[test]
    fn test_on_render_skips_unchanged_state() {
        let device = MockDevice::new();
        let data = material_factory(&device).new_binding_data().unwrap();
        let texture = MockTexture::new(1);
        data.set_texture(1, Some(texture.clone())).unwrap();

        let mut state = FrameRenderState::new(0);
        data.on_render(&mut state).unwrap();
        assert_eq!(state.descriptor_writes().len(), 2);
        let uploads = device.uniform_write_count();

        // Same slot two frames later, nothing changed
        state.reset(2);
        data.on_render(&mut state).unwrap();
        assert!(state.descriptor_writes().is_empty());
        assert_eq!(device.uniform_write_count(), uploads);

        // Replacing the image bumps the version and rewrites only that binding
        texture.bump_version();
        state.reset(4);
        data.on_render(&mut state).unwrap();
        assert_eq!(state.descriptor_writes().len(), 1);
        assert_eq!(state.descriptor_writes()[0].binding, 1);
    }

    #[test]
    fn test_each_slot_tracked_separately() {
        let device = MockDevice::new();
        let data = material_factory(&device).new_binding_data().unwrap();

        let mut state = FrameRenderState::new(0);
        data.on_render(&mut state).unwrap();
        let first = state.descriptor_writes().len();

        state.reset(1);
        data.on_render(&mut state).unwrap();
        assert_eq!(state.descriptor_writes().len(), first);
        assert_ne!(data.descriptor_set(0), data.descriptor_set(1));
    }

    #[test]
    fn test_empty_data_renders_nothing() {
        let device = MockDevice::new();
        let factory = BindingDataFactory::new(
            device.clone(),
            BindingLayout::empty(),
            &RendererConfig::default(),
            FrameCounter::new(),
            GarbageQueue::new(FrameCounter::new()),
        )
        .unwrap();
        let data = factory.new_binding_data().unwrap();

        let mut state = FrameRenderState::new(0);
        data.on_render(&mut state).unwrap();
        assert!(state.descriptor_writes().is_empty());
        assert_eq!(data.descriptor_set(0), vk::DescriptorSet::null());
    }

    #[test]
    fn test_empty_data_rejects_every_accessor() {
        let device = MockDevice::new();
        let factory = BindingDataFactory::new(
            device.clone(),
            BindingLayout::empty(),
            &RendererConfig::default(),
            FrameCounter::new(),
            GarbageQueue::new(FrameCounter::new()),
        )
        .unwrap();
        let data = factory.new_binding_data().unwrap();
        let texture: Arc<dyn TextureResource> = MockTexture::new(1);

        assert!(matches!(
            data.set_texture(0, Some(texture)),
            Err(RenderError::BindingIndex { index: 0, len: 0 })
        ));
        assert!(matches!(
            data.texture(0),
            Err(RenderError::BindingIndex { index: 0, len: 0 })
        ));
        assert!(matches!(
            data.set_constants(0, &[0; 16]),
            Err(RenderError::BindingIndex { index: 0, len: 0 })
        ));
        assert!(matches!(
            data.constants(0),
            Err(RenderError::BindingIndex { index: 0, len: 0 })
        ));
    }
}
