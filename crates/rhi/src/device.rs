//! Vulkan logical device and memory allocator.
//!
//! The application bootstrap creates the instance, picks a physical device and
//! creates the logical device. [`Device`] takes ownership of that logical
//! device, retrieves its queues and initializes gpu-allocator on top of it.
//!
//! # Example
//!
//! ```no_run
//! use vkframe_rhi::device::{Device, DeviceDesc};
//! use ash::vk;
//!
//! # fn example(instance: &ash::Instance, raw: ash::Device, physical: vk::PhysicalDevice) -> Result<(), vkframe_rhi::RhiError> {
//! let device = Device::new(DeviceDesc {
//!     instance,
//!     device: raw,
//!     physical_device: physical,
//!     graphics_family: 0,
//!     present_family: 0,
//! })?;
//!
//! let graphics_queue = device.graphics_queue();
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator, AllocatorCreateDesc};
use tracing::{debug, error, info};

use crate::error::RhiError;

/// Handles produced by the application bootstrap.
pub struct DeviceDesc<'a> {
    /// The instance the device was created from.
    pub instance: &'a ash::Instance,
    /// The logical device. Ownership moves into [`Device`].
    pub device: ash::Device,
    /// The physical device backing `device`.
    pub physical_device: vk::PhysicalDevice,
    /// Queue family used for graphics and transfer work.
    pub graphics_family: u32,
    /// Queue family used for presentation.
    pub present_family: u32,
}

/// Vulkan logical device wrapper.
///
/// This struct manages the lifetime of the Vulkan logical device together
/// with its queues and the memory allocator.
///
/// # Thread Safety
///
/// The [`Device`] is designed to be shared across threads using `Arc`. The
/// internal allocator is protected by a `Mutex`.
pub struct Device {
    /// Vulkan logical device handle.
    device: ash::Device,
    /// Physical device handle.
    physical_device: vk::PhysicalDevice,
    /// GPU memory allocator (thread-safe via Mutex).
    allocator: Mutex<Allocator>,
    /// Graphics queue handle.
    graphics_queue: vk::Queue,
    /// Presentation queue handle.
    present_queue: vk::Queue,
    /// Queue family of the graphics queue.
    graphics_family: u32,
    /// Device limits that influence sub-allocation.
    limits: vk::PhysicalDeviceLimits,
}

impl Device {
    /// Wraps a logical device and initializes the memory allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if allocator initialization fails.
    pub fn new(desc: DeviceDesc<'_>) -> Result<Arc<Self>, RhiError> {
        let DeviceDesc {
            instance,
            device,
            physical_device,
            graphics_family,
            present_family,
        } = desc;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        debug!("Graphics queue retrieved from family {}", graphics_family);

        let present_queue = unsafe { device.get_device_queue(present_family, 0) };
        debug!("Present queue retrieved from family {}", present_family);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        info!(
            "Device ready (min uniform offset alignment {})",
            properties.limits.min_uniform_buffer_offset_alignment
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            allocator: Mutex::new(allocator),
            graphics_queue,
            present_queue,
            graphics_family,
            limits: properties.limits,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the graphics queue handle.
    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Returns the presentation queue handle.
    #[inline]
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Returns the graphics queue family index.
    #[inline]
    pub fn graphics_family(&self) -> u32 {
        self.graphics_family
    }

    /// Minimum alignment for uniform buffer descriptor offsets.
    #[inline]
    pub fn min_uniform_alignment(&self) -> vk::DeviceSize {
        self.limits.min_uniform_buffer_offset_alignment.max(1)
    }

    /// Locks the GPU memory allocator.
    ///
    /// A poisoned lock is recovered: the allocator holds no invariants that a
    /// panic on another thread could have broken halfway.
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns an allocation to the allocator, logging failures.
    pub fn free_allocation(&self, allocation: Allocation) {
        if let Err(e) = self.allocator().free(allocation) {
            error!("Failed to free allocation: {:?}", e);
        }
    }

    /// Waits for the device to become idle.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails.
    pub fn wait_idle(&self) -> Result<(), RhiError> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Submits command buffers to the graphics queue.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - All command buffers are valid and fully recorded
    /// - The fence (if not null) is unsignaled and not in use
    ///
    /// # Errors
    ///
    /// Returns an error if the submission fails.
    pub unsafe fn submit_graphics(
        &self,
        submit_infos: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> Result<(), RhiError> {
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, submit_infos, fence)?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// Safety: ash::Device is Send+Sync, the remaining fields are plain handles or
// data, and the allocator is behind a Mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
    }
}
