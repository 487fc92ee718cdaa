//! Growable descriptor pool with delayed set reuse.
//!
//! Sets handed back through [`DescriptorPool::dispose_set`] are stamped with
//! the first frame allowed to reuse them and sit in a FIFO. A set is reused
//! only once `dispose_frame + MAX_FRAMES_IN_FLIGHT + 1 <= current_frame`, by
//! which point every frame that could have bound it has retired. Sets that
//! were never written or bound go back through
//! [`DescriptorPool::release_unused`] and are reusable at once. Otherwise a fresh
//! set is allocated from the newest underlying pool; when that pool is full a
//! new one with double the capacity (capped) is created.

use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};
use vkframe_rhi::descriptor::pool_sizes;

use crate::MAX_FRAMES_IN_FLIGHT;
use crate::device::GpuDevice;
use crate::error::{RenderError, RenderResult};
use crate::frame::FrameCounter;
use crate::garbage::GarbageQueue;

/// Allocation counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorPoolStats {
    /// Sets allocated from an underlying pool.
    pub fresh_allocations: u64,
    /// Sets reused from the disposal queue.
    pub recycled_allocations: u64,
    /// Underlying pools created.
    pub pool_count: usize,
}

struct PoolBlock {
    pool: vk::DescriptorPool,
    capacity: u32,
    allocated: u32,
}

/// Descriptor sets of one layout.
pub struct DescriptorPool<D: GpuDevice> {
    device: Arc<D>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    frames: FrameCounter,
    garbage: GarbageQueue<D>,
    blocks: Vec<PoolBlock>,
    next_capacity: u32,
    max_capacity: u32,
    /// `(first reusable frame, set)`, non-decreasing in frame.
    available: VecDeque<(u64, vk::DescriptorSet)>,
    stats: DescriptorPoolStats,
}

impl<D: GpuDevice> DescriptorPool<D> {
    /// Creates a pool for sets of `layout`. No Vulkan pool exists until the
    /// first allocation.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout has no bindings or the capacities are
    /// inconsistent.
    pub fn new(
        device: Arc<D>,
        layout: vk::DescriptorSetLayout,
        bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
        frames: FrameCounter,
        garbage: GarbageQueue<D>,
        initial_capacity: u32,
        max_capacity: u32,
    ) -> RenderResult<Self> {
        if bindings.is_empty() {
            return Err(RenderError::Allocation(
                "descriptor pool for a layout without bindings".to_string(),
            ));
        }
        if initial_capacity == 0 || max_capacity < initial_capacity {
            return Err(RenderError::Allocation(format!(
                "invalid descriptor pool capacities: initial {}, max {}",
                initial_capacity, max_capacity
            )));
        }

        Ok(Self {
            device,
            layout,
            bindings,
            frames,
            garbage,
            blocks: Vec::new(),
            next_capacity: initial_capacity,
            max_capacity,
            available: VecDeque::new(),
            stats: DescriptorPoolStats::default(),
        })
    }

    /// Returns a set that no in-flight frame can be using.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Allocation`] if a new underlying pool cannot
    /// satisfy the request.
    pub fn new_set(&mut self) -> RenderResult<vk::DescriptorSet> {
        let current = self.frames.current();
        if let Some(&(reusable_from, set)) = self.available.front()
            && reusable_from <= current
        {
            self.available.pop_front();
            self.stats.recycled_allocations += 1;
            return Ok(set);
        }

        if let Some(set) = self.allocate_from_current()? {
            return Ok(set);
        }

        self.grow()?;
        match self.allocate_from_current()? {
            Some(set) => Ok(set),
            None => Err(RenderError::Allocation(
                "fresh descriptor pool could not allocate a set".to_string(),
            )),
        }
    }

    /// Queues `set` for reuse once the frames that may bind it have retired.
    pub fn dispose_set(&mut self, set: vk::DescriptorSet) {
        let reusable_from = self.frames.current() + MAX_FRAMES_IN_FLIGHT as u64 + 1;
        self.available.push_back((reusable_from, set));
    }

    /// Returns a set that was never written or bound; the next `new_set`
    /// hands it out again.
    pub fn release_unused(&mut self, set: vk::DescriptorSet) {
        self.available.push_front((0, set));
    }

    /// Allocation counters.
    pub fn stats(&self) -> DescriptorPoolStats {
        self.stats
    }

    /// Sets waiting in the disposal queue.
    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    fn allocate_from_current(&mut self) -> RenderResult<Option<vk::DescriptorSet>> {
        let Some(block) = self.blocks.last_mut() else {
            return Ok(None);
        };
        if block.allocated >= block.capacity {
            return Ok(None);
        }

        let set = self.device.allocate_descriptor_set(block.pool, self.layout)?;
        if set.is_some() {
            block.allocated += 1;
            self.stats.fresh_allocations += 1;
        } else {
            // Driver ran out before the nominal capacity; stop using this pool
            block.allocated = block.capacity;
        }
        Ok(set)
    }

    fn grow(&mut self) -> RenderResult<()> {
        let capacity = self.next_capacity;
        let sizes = pool_sizes(&self.bindings, capacity);
        let pool = self.device.create_descriptor_pool(capacity, &sizes)?;

        self.blocks.push(PoolBlock {
            pool,
            capacity,
            allocated: 0,
        });
        self.stats.pool_count = self.blocks.len();
        self.next_capacity = capacity.saturating_mul(2).min(self.max_capacity);

        if self.blocks.len() == 1 {
            debug!("Descriptor pool created with capacity {}", capacity);
        } else {
            info!(
                "Descriptor pool grown: pool #{} with capacity {}",
                self.blocks.len(),
                capacity
            );
        }
        Ok(())
    }
}

impl<D: GpuDevice> Drop for DescriptorPool<D> {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            let pool = block.pool;
            self.garbage
                .dispose("descriptor pool", move |device: &D| {
                    device.destroy_descriptor_pool(pool)
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;
    use vkframe_rhi::descriptor::DescriptorBindingBuilder;

    struct Fixture {
        device: Arc<MockDevice>,
        frames: FrameCounter,
        garbage: GarbageQueue<MockDevice>,
    }

    impl Fixture {
        fn new() -> Self {
            let frames = FrameCounter::new();
            Self {
                device: MockDevice::new(),
                garbage: GarbageQueue::new(frames.clone()),
                frames,
            }
        }

        fn pool(&self, initial: u32, max: u32) -> DescriptorPool<MockDevice> {
            let bindings = vec![DescriptorBindingBuilder::uniform_buffer(
                0,
                vk::ShaderStageFlags::VERTEX,
            )];
            let layout = self.device.create_descriptor_set_layout(&bindings).unwrap();
            DescriptorPool::new(
                self.device.clone(),
                layout,
                bindings,
                self.frames.clone(),
                self.garbage.clone(),
                initial,
                max,
            )
            .unwrap()
        }
    }

    #[test]
    fn test_disposed_set_not_reused_while_in_flight() {
        let fx = Fixture::new();
        let mut pool = fx.pool(4, 16);

        fx.frames.set(0);
        let first = pool.new_set().unwrap();
        pool.dispose_set(first);

        // Frame 0 itself may have `first` bound
        assert_ne!(pool.new_set().unwrap(), first);

        // Frames 1 and 2 may still have `first` bound
        fx.frames.set(1);
        assert_ne!(pool.new_set().unwrap(), first);
        fx.frames.set(2);
        assert_ne!(pool.new_set().unwrap(), first);

        // Frame 3 = 0 + N + 1
        fx.frames.set(3);
        assert_eq!(pool.new_set().unwrap(), first);

        let stats = pool.stats();
        assert_eq!(stats.fresh_allocations, 4);
        assert_eq!(stats.recycled_allocations, 1);
    }

    #[test]
    fn test_unused_set_reusable_at_once() {
        let fx = Fixture::new();
        let mut pool = fx.pool(4, 16);

        let disposed = pool.new_set().unwrap();
        pool.dispose_set(disposed);
        let unused = pool.new_set().unwrap();
        pool.release_unused(unused);

        assert_eq!(pool.new_set().unwrap(), unused);
        assert_ne!(pool.new_set().unwrap(), disposed);
        assert_eq!(pool.stats().recycled_allocations, 1);
    }

    #[test]
    fn test_reuse_is_fifo() {
        let fx = Fixture::new();
        let mut pool = fx.pool(4, 16);

        let a = pool.new_set().unwrap();
        let b = pool.new_set().unwrap();
        pool.dispose_set(a);
        pool.dispose_set(b);

        fx.frames.set(10);
        assert_eq!(pool.new_set().unwrap(), a);
        assert_eq!(pool.new_set().unwrap(), b);
        assert_eq!(pool.available_len(), 0);
    }

    #[test]
    fn test_pool_grows_geometrically_up_to_cap() {
        let fx = Fixture::new();
        let mut pool = fx.pool(2, 4);

        // 2 + 4 + 4 sets
        for _ in 0..10 {
            pool.new_set().unwrap();
        }

        assert_eq!(pool.stats().pool_count, 3);
        assert_eq!(fx.device.pool_capacities(), vec![2, 4, 4]);
    }

    #[test]
    fn test_pools_destroyed_through_garbage() {
        let fx = Fixture::new();
        let mut pool = fx.pool(1, 1);
        pool.new_set().unwrap();
        pool.new_set().unwrap();
        drop(pool);

        assert_eq!(fx.device.destroyed_pool_count(), 0);
        assert_eq!(fx.garbage.pending(), 2);
        fx.garbage.flush(&fx.device);
        assert_eq!(fx.device.destroyed_pool_count(), 2);
    }

    #[test]
    fn test_driver_exhaustion_moves_to_new_pool() {
        let fx = Fixture::new();
        let mut pool = fx.pool(8, 8);
        pool.new_set().unwrap();

        fx.device.exhaust_pools(true);
        assert!(pool.new_set().is_err());
        fx.device.exhaust_pools(false);

        pool.new_set().unwrap();
        assert_eq!(pool.stats().pool_count, 3);
    }

    #[test]
    fn test_rejects_empty_layout() {
        let fx = Fixture::new();
        let result = DescriptorPool::new(
            fx.device.clone(),
            vk::DescriptorSetLayout::null(),
            Vec::new(),
            fx.frames.clone(),
            fx.garbage.clone(),
            4,
            8,
        );
        assert!(matches!(result, Err(RenderError::Allocation(_))));
    }
}
