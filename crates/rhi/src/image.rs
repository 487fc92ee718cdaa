//! GPU image management.
//!
//! [`Image`] owns a device-local VkImage, its memory and a view covering every
//! layer. It backs sampled textures, texture arrays and the depth attachment.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use vkframe_rhi::device::Device;
//! use vkframe_rhi::image::{Image, ImageDesc, ImageKind};
//!
//! # fn example(device: Arc<Device>) -> Result<(), vkframe_rhi::RhiError> {
//! let texture = Image::new(device, &ImageDesc {
//!     width: 256,
//!     height: 256,
//!     layers: 1,
//!     array: false,
//!     format: vk::Format::R8G8B8A8_SRGB,
//!     kind: ImageKind::Sampled,
//! })?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Default depth attachment format (32-bit floating point).
pub const DEFAULT_DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// What an image is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    /// Filled by transfer copies and sampled by shaders
    Sampled,
    /// Depth attachment of the render pass
    Depth,
}

impl ImageKind {
    /// Converts to Vulkan image usage flags.
    pub fn to_vk_usage(self) -> vk::ImageUsageFlags {
        match self {
            ImageKind::Sampled => vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            ImageKind::Depth => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        }
    }

    /// Aspect covered by views of this kind of image.
    pub fn aspect(self) -> vk::ImageAspectFlags {
        match self {
            ImageKind::Sampled => vk::ImageAspectFlags::COLOR,
            ImageKind::Depth => vk::ImageAspectFlags::DEPTH,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ImageKind::Sampled => "sampled image",
            ImageKind::Depth => "depth image",
        }
    }
}

/// Image creation parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Array layers.
    pub layers: u32,
    /// Forces a 2D array view even for a single layer.
    pub array: bool,
    /// Texel format.
    pub format: vk::Format,
    /// Usage.
    pub kind: ImageKind,
}

impl ImageDesc {
    /// View type matching the layer count.
    pub fn view_type(&self) -> vk::ImageViewType {
        if self.array || self.layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        }
    }

    /// Subresource range covering every layer.
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(self.kind.aspect())
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(self.layers)
    }

    fn validate(&self) -> RhiResult<()> {
        if self.width == 0 || self.height == 0 || self.layers == 0 {
            return Err(RhiError::InvalidHandle(format!(
                "Image dimensions must be greater than 0 (got {}x{}x{})",
                self.width, self.height, self.layers
            )));
        }
        Ok(())
    }
}

/// Device-local image with a view.
///
/// # Resource Destruction
///
/// Resources are destroyed in the following order:
/// 1. Image view
/// 2. Image
/// 3. Memory allocation
pub struct Image {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan image handle.
    image: vk::Image,
    /// Vulkan image view handle.
    view: vk::ImageView,
    /// GPU memory allocation.
    allocation: Option<Allocation>,
    /// Creation parameters.
    desc: ImageDesc,
}

impl Image {
    /// Creates an image, binds device-local memory and creates its view.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A dimension is zero
    /// - Image creation fails
    /// - Memory allocation fails
    /// - Image view creation fails
    pub fn new(device: Arc<Device>, desc: &ImageDesc) -> RhiResult<Self> {
        desc.validate()?;

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.kind.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&image_info, None)? };

        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name: desc.kind.name(),
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false, // Optimal tiling is not linear
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(e.into());
            }
        };

        let mut this = Self {
            device,
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            desc: *desc,
        };

        // From here on Drop cleans up whatever was created
        if let Some(allocation) = this.allocation.as_ref() {
            unsafe {
                this.device.handle().bind_image_memory(
                    image,
                    allocation.memory(),
                    allocation.offset(),
                )?;
            }
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(desc.view_type())
            .format(desc.format)
            .subresource_range(desc.subresource_range());

        this.view = unsafe { this.device.handle().create_image_view(&view_info, None)? };

        info!(
            "Created {}: {}x{}x{} ({:?})",
            desc.kind.name(),
            desc.width,
            desc.height,
            desc.layers,
            desc.format
        );

        Ok(this)
    }

    /// Returns the Vulkan image handle.
    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Returns the Vulkan image view handle.
    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Returns the creation parameters.
    #[inline]
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Returns the image extent.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.width,
            height: self.desc.height,
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.handle().destroy_image_view(self.view, None);
            }
            self.device.handle().destroy_image(self.image, None);
        }

        if let Some(allocation) = self.allocation.take() {
            self.device.free_allocation(allocation);
        }

        debug!(
            "Destroyed {}: {}x{}",
            self.desc.kind.name(),
            self.desc.width,
            self.desc.height
        );
    }
}

/// Copy region for one tightly packed layer of an image.
pub fn layer_copy_region(
    desc: &ImageDesc,
    layer: u32,
    buffer_offset: vk::DeviceSize,
) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(buffer_offset)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(desc.kind.aspect())
                .mip_level(0)
                .base_array_layer(layer)
                .layer_count(1),
        )
        .image_extent(vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        })
}
