//! Descriptor set management for shader resource binding.
//!
//! Descriptor objects here are plain handles: layouts, pools and sets are
//! owned by the renderer's pooling layer, which decides when the GPU can no
//! longer see them and destroys them through its deferred-destruction queue.
//! This module only creates, allocates, updates and destroys.
//!
//! # Example
//!
//! ```no_run
//! use ash::vk;
//! use vkframe_rhi::device::Device;
//! use vkframe_rhi::descriptor::{self, DescriptorBindingBuilder};
//!
//! # fn example(device: &Device) -> Result<(), vkframe_rhi::RhiError> {
//! let bindings = [
//!     DescriptorBindingBuilder::uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
//!     DescriptorBindingBuilder::combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT),
//! ];
//! let layout = descriptor::create_set_layout(device, &bindings)?;
//!
//! let sizes = descriptor::pool_sizes(&bindings, 16);
//! let pool = descriptor::create_pool(device, 16, &sizes)?;
//! let set = descriptor::allocate_set(device, pool, layout)?;
//! # Ok(())
//! # }
//! ```

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Creates a descriptor set layout.
///
/// # Errors
///
/// Returns an error if layout creation fails.
pub fn create_set_layout(
    device: &Device,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> RhiResult<vk::DescriptorSetLayout> {
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);

    let layout = unsafe {
        device
            .handle()
            .create_descriptor_set_layout(&create_info, None)?
    };

    debug!(
        "Created descriptor set layout with {} binding(s)",
        bindings.len()
    );

    Ok(layout)
}

/// Destroys a descriptor set layout.
pub fn destroy_set_layout(device: &Device, layout: vk::DescriptorSetLayout) {
    unsafe {
        device.handle().destroy_descriptor_set_layout(layout, None);
    }
    debug!("Destroyed descriptor set layout");
}

/// Descriptor counts a pool needs to hold `max_sets` sets of `bindings`.
pub fn pool_sizes(
    bindings: &[vk::DescriptorSetLayoutBinding],
    max_sets: u32,
) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let count = binding.descriptor_count * max_sets;
        match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(
                vk::DescriptorPoolSize::default()
                    .ty(binding.descriptor_type)
                    .descriptor_count(count),
            ),
        }
    }
    sizes
}

/// Creates a descriptor pool for `max_sets` sets.
///
/// Sets are never freed individually; the pool is destroyed as a whole.
///
/// # Errors
///
/// Returns an error if pool creation fails.
pub fn create_pool(
    device: &Device,
    max_sets: u32,
    pool_sizes: &[vk::DescriptorPoolSize],
) -> RhiResult<vk::DescriptorPool> {
    let create_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(max_sets)
        .pool_sizes(pool_sizes);

    let pool = unsafe { device.handle().create_descriptor_pool(&create_info, None)? };

    debug!(
        "Created descriptor pool: max_sets={}, pool_sizes={}",
        max_sets,
        pool_sizes.len()
    );

    Ok(pool)
}

/// Destroys a descriptor pool and every set allocated from it.
pub fn destroy_pool(device: &Device, pool: vk::DescriptorPool) {
    unsafe {
        device.handle().destroy_descriptor_pool(pool, None);
    }
    debug!("Destroyed descriptor pool");
}

/// Allocates one descriptor set from `pool`.
///
/// # Errors
///
/// Returns [`RhiError::PoolExhausted`] when the pool has no room left, any
/// other failure as a Vulkan error.
pub fn allocate_set(
    device: &Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> RhiResult<vk::DescriptorSet> {
    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    match unsafe { device.handle().allocate_descriptor_sets(&alloc_info) } {
        Ok(sets) => Ok(sets[0]),
        Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
            Err(RhiError::PoolExhausted)
        }
        Err(e) => Err(e.into()),
    }
}

/// What a [`DescriptorWrite`] points its binding at.
#[derive(Clone, Copy, Debug)]
pub enum DescriptorWriteKind {
    /// A uniform buffer range.
    Buffer(vk::DescriptorBufferInfo),
    /// A combined image sampler.
    Image(vk::DescriptorImageInfo),
}

/// One pending descriptor update, applied in a batch by
/// [`update_descriptor_sets`].
#[derive(Clone, Copy, Debug)]
pub struct DescriptorWrite {
    /// Set to update.
    pub set: vk::DescriptorSet,
    /// Binding within the set.
    pub binding: u32,
    /// New contents of the binding.
    pub kind: DescriptorWriteKind,
}

impl DescriptorWrite {
    /// Vulkan descriptor type this write targets.
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self.kind {
            DescriptorWriteKind::Buffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorWriteKind::Image(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

/// Applies all `writes` in a single `vkUpdateDescriptorSets` call.
pub fn update_descriptor_sets(device: &Device, writes: &[DescriptorWrite]) {
    if writes.is_empty() {
        return;
    }

    let vk_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .map(|write| {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(write.set)
                .dst_binding(write.binding)
                .dst_array_element(0)
                .descriptor_type(write.descriptor_type());
            match &write.kind {
                DescriptorWriteKind::Buffer(info) => base.buffer_info(std::slice::from_ref(info)),
                DescriptorWriteKind::Image(info) => base.image_info(std::slice::from_ref(info)),
            }
        })
        .collect();

    unsafe {
        device.handle().update_descriptor_sets(&vk_writes, &[]);
    }

    debug!("Applied {} descriptor write(s)", writes.len());
}

/// Creates a buffer info for descriptor set updates.
#[inline]
pub fn buffer_info(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range)
}

/// Creates an image info for a shader-read-only sampled image.
#[inline]
pub fn image_info(sampler: vk::Sampler, image_view: vk::ImageView) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(image_view)
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
}

/// Builder for creating descriptor set layout bindings.
pub struct DescriptorBindingBuilder;

impl DescriptorBindingBuilder {
    /// Creates a uniform buffer binding.
    #[inline]
    pub fn uniform_buffer(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(stage_flags)
    }

    /// Creates a combined image sampler binding.
    #[inline]
    pub fn combined_image_sampler(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(stage_flags)
    }
}
