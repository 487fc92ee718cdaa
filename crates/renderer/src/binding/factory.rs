//! Pooled allocation of binding data.
//!
//! A [`BindingDataFactory`] serves one [`BindingLayout`]. It owns the
//! descriptor set layout, a [`DescriptorPool`] for it, and a list of buffer
//! groups. A buffer group is one uniform buffer split into `buffer_slots`
//! value blocks per frame slot, with an intrusive free list of slots. Groups
//! are appended when all are full and never shrink.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use tracing::{debug, info};
use vkframe_core::RendererConfig;

use crate::MAX_FRAMES_IN_FLIGHT;
use crate::binding::data::{BindingData, ValueSlot};
use crate::binding::layout::BindingLayout;
use crate::descriptor_pool::{DescriptorPool, DescriptorPoolStats};
use crate::device::GpuDevice;
use crate::error::{RenderError, RenderResult};
use crate::frame::FrameCounter;
use crate::garbage::GarbageQueue;

/// Uniform buffer with a free list of value slots.
pub(crate) struct BufferGroup<D: GpuDevice> {
    storage: Arc<D::UniformBuffer>,
    next: Vec<Option<u32>>,
    head: Option<u32>,
    in_use: u32,
}

impl<D: GpuDevice> BufferGroup<D> {
    fn new(storage: Arc<D::UniformBuffer>, slots: u32) -> Self {
        let next = (0..slots)
            .map(|slot| (slot + 1 < slots).then_some(slot + 1))
            .collect();
        Self {
            storage,
            next,
            head: (slots > 0).then_some(0),
            in_use: 0,
        }
    }

    fn take(&mut self) -> Option<u32> {
        let slot = self.head?;
        self.head = self.next[slot as usize].take();
        self.in_use += 1;
        Some(slot)
    }

    fn give_back(&mut self, slot: u32) {
        self.next[slot as usize] = self.head;
        self.head = Some(slot);
        self.in_use -= 1;
    }
}

struct FactoryInner<D: GpuDevice> {
    groups: Vec<BufferGroup<D>>,
    descriptors: Option<DescriptorPool<D>>,
}

/// Allocation counters of a factory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FactoryStats {
    /// Buffer groups created.
    pub group_count: usize,
    /// Value slots currently handed out.
    pub slots_in_use: u32,
    /// Descriptor pool counters.
    pub descriptors: DescriptorPoolStats,
}

pub(crate) struct FactoryShared<D: GpuDevice> {
    device: Arc<D>,
    layout: Arc<BindingLayout>,
    set_layout: vk::DescriptorSetLayout,
    buffer_slots: u32,
    garbage: GarbageQueue<D>,
    inner: Mutex<FactoryInner<D>>,
}

impl<D: GpuDevice> FactoryShared<D> {
    fn lock(&self) -> MutexGuard<'_, FactoryInner<D>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a value slot and descriptor sets of a dropped binding data.
    pub(crate) fn reclaim(&self, value: Option<(usize, u32)>, sets: &[vk::DescriptorSet]) {
        let mut inner = self.lock();
        if let Some((group, slot)) = value {
            inner.groups[group].give_back(slot);
        }
        if let Some(pool) = inner.descriptors.as_mut() {
            for &set in sets {
                pool.dispose_set(set);
            }
        }
    }
}

impl<D: GpuDevice> Drop for FactoryShared<D> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for group in inner.groups.drain(..) {
            let storage = group.storage;
            self.garbage
                .dispose("uniform storage", move |_: &D| drop(storage));
        }

        let set_layout = self.set_layout;
        self.garbage
            .dispose("descriptor set layout", move |device: &D| {
                device.destroy_descriptor_set_layout(set_layout)
            });
    }
}

/// Allocates [`BindingData`] for one layout.
///
/// Cloning yields another handle to the same pools.
pub struct BindingDataFactory<D: GpuDevice> {
    shared: Arc<FactoryShared<D>>,
}

impl<D: GpuDevice> Clone for BindingDataFactory<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: GpuDevice> BindingDataFactory<D> {
    /// Creates the descriptor set layout for `layout` and an empty pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the descriptor
    /// set layout cannot be created.
    pub fn new(
        device: Arc<D>,
        layout: BindingLayout,
        config: &RendererConfig,
        frames: FrameCounter,
        garbage: GarbageQueue<D>,
    ) -> RenderResult<Self> {
        config.validate()?;

        let bindings = layout.vk_bindings();
        let set_layout = device.create_descriptor_set_layout(&bindings)?;

        let descriptors = if layout.is_empty() {
            None
        } else {
            Some(DescriptorPool::new(
                Arc::clone(&device),
                set_layout,
                bindings,
                frames,
                garbage.clone(),
                config.descriptor_pool_initial_sets,
                config.descriptor_pool_max_sets,
            )?)
        };

        debug!(
            "Binding data factory created: {} binding(s), {} value bytes per slot",
            layout.len(),
            layout.stride()
        );

        Ok(Self {
            shared: Arc::new(FactoryShared {
                device,
                layout: Arc::new(layout),
                set_layout,
                buffer_slots: config.buffer_slots,
                garbage,
                inner: Mutex::new(FactoryInner {
                    groups: Vec::new(),
                    descriptors,
                }),
            }),
        })
    }

    /// The layout served by this factory.
    pub fn layout(&self) -> &BindingLayout {
        &self.shared.layout
    }

    /// Descriptor set layout handle.
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.shared.set_layout
    }

    /// Allocates binding data.
    ///
    /// An empty layout yields binding data without descriptor sets or
    /// uniform storage. Otherwise the data gets one descriptor set per frame
    /// slot and, if the layout has value bindings, one value slot.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Allocation`] if a descriptor set or buffer
    /// group cannot be allocated. Nothing is leaked on failure.
    pub fn new_binding_data(&self) -> RenderResult<Arc<BindingData<D>>> {
        let shared = &self.shared;
        if shared.layout.is_empty() {
            return Ok(Arc::new(BindingData::new(
                Arc::downgrade(shared),
                shared.garbage.clone(),
                Arc::clone(&shared.layout),
                None,
                shared.buffer_slots,
                Vec::new(),
            )));
        }

        let mut inner = shared.lock();
        let sets = Self::allocate_sets(&mut inner)?;

        let value_slot = if shared.layout.has_values() {
            match self.take_value_slot(&mut inner) {
                Ok(slot) => Some(slot),
                Err(e) => {
                    if let Some(pool) = inner.descriptors.as_mut() {
                        for &set in sets.iter().rev() {
                            pool.release_unused(set);
                        }
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };
        drop(inner);

        Ok(Arc::new(BindingData::new(
            Arc::downgrade(shared),
            shared.garbage.clone(),
            Arc::clone(&shared.layout),
            value_slot,
            shared.buffer_slots,
            sets,
        )))
    }

    /// Allocation counters.
    pub fn stats(&self) -> FactoryStats {
        let inner = self.shared.lock();
        FactoryStats {
            group_count: inner.groups.len(),
            slots_in_use: inner.groups.iter().map(|g| g.in_use).sum(),
            descriptors: inner
                .descriptors
                .as_ref()
                .map(DescriptorPool::stats)
                .unwrap_or_default(),
        }
    }

    fn allocate_sets(inner: &mut FactoryInner<D>) -> RenderResult<Vec<vk::DescriptorSet>> {
        let Some(pool) = inner.descriptors.as_mut() else {
            return Ok(Vec::new());
        };

        let mut sets = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            match pool.new_set() {
                Ok(set) => sets.push(set),
                Err(e) => {
                    for set in sets.into_iter().rev() {
                        pool.release_unused(set);
                    }
                    return Err(RenderError::Allocation(format!("descriptor set: {}", e)));
                }
            }
        }
        Ok(sets)
    }

    fn take_value_slot(&self, inner: &mut FactoryInner<D>) -> RenderResult<ValueSlot<D>> {
        for (group_index, group) in inner.groups.iter_mut().enumerate() {
            if let Some(slot) = group.take() {
                return Ok(ValueSlot {
                    storage: Arc::clone(&group.storage),
                    group: group_index,
                    slot,
                });
            }
        }

        let shared = &self.shared;
        let size = shared.layout.stride()
            * shared.buffer_slots as u64
            * MAX_FRAMES_IN_FLIGHT as u64;
        let storage = shared
            .device
            .create_uniform_buffer(size)
            .map_err(|e| RenderError::Allocation(format!("buffer group: {}", e)))?;

        let mut group = BufferGroup::new(Arc::new(storage), shared.buffer_slots);
        let slot = group
            .take()
            .ok_or_else(|| RenderError::Allocation("buffer group has no slots".to_string()))?;
        let value_slot = ValueSlot {
            storage: Arc::clone(&group.storage),
            group: inner.groups.len(),
            slot,
        };
        inner.groups.push(group);

        info!(
            "Buffer group #{} created: {} slots of {} bytes",
            inner.groups.len(),
            shared.buffer_slots,
            shared.layout.stride()
        );

        Ok(value_slot)
    }
}
