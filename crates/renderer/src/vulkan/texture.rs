//! Sampled textures and texture arrays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use tracing::debug;
use vkframe_rhi::buffer::{Buffer, BufferUsage};
use vkframe_rhi::descriptor;
use vkframe_rhi::device::Device;
use vkframe_rhi::image::{Image, ImageDesc, ImageKind, layer_copy_region};
use vkframe_rhi::sampler::{SamplerCache, SamplerDesc};

use super::VulkanBackend;
use crate::error::{RenderError, RenderResult};
use crate::garbage::GarbageQueue;
use crate::render_state::{FrameRenderState, ImageUpload};
use crate::resource::{RenderResource, TextureResource};

/// Bytes per texel of the formats textures accept.
pub fn texel_size(format: vk::Format) -> Option<u64> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB | vk::Format::R16_SFLOAT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::R16G16_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// Shape, format and sampling of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    /// Array layers; 1 for a plain texture.
    pub layers: u32,
    pub format: vk::Format,
    pub sampler: SamplerDesc,
}

impl TextureDesc {
    /// A single-layer texture with the default sampler.
    pub fn new(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            layers: 1,
            format,
            sampler: SamplerDesc::default(),
        }
    }

    /// Sets the layer count.
    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    /// Sets the sampler.
    pub fn with_sampler(mut self, sampler: SamplerDesc) -> Self {
        self.sampler = sampler;
        self
    }

    /// Bytes of one tightly packed layer.
    ///
    /// # Errors
    ///
    /// Returns an error for an unsupported format.
    pub fn layer_size(&self) -> RenderResult<u64> {
        let texel = texel_size(self.format).ok_or_else(|| {
            RenderError::InvalidData(format!("Unsupported texture format {:?}", self.format))
        })?;
        Ok(self.width as u64 * self.height as u64 * texel)
    }

    fn image_desc(&self, array: bool) -> ImageDesc {
        ImageDesc {
            width: self.width,
            height: self.height,
            layers: self.layers,
            array,
            format: self.format,
            kind: ImageKind::Sampled,
        }
    }

    fn check_data(&self, data: &[u8]) -> RenderResult<()> {
        if self.width == 0 || self.height == 0 || self.layers == 0 {
            return Err(RenderError::InvalidData(format!(
                "Texture dimensions must be non-zero (got {}x{}x{})",
                self.width, self.height, self.layers
            )));
        }
        let expected = self.layer_size()? * self.layers as u64;
        if data.len() as u64 != expected {
            return Err(RenderError::InvalidData(format!(
                "Texture {}x{}x{} {:?} needs {} bytes, got {}",
                self.width,
                self.height,
                self.layers,
                self.format,
                expected,
                data.len()
            )));
        }
        Ok(())
    }
}

struct TextureState {
    image: Arc<Image>,
    staging: Option<Arc<Buffer>>,
}

/// Device-local image sampled by shaders.
///
/// Texel data is staged on creation and on [`replace`](Self::replace) and
/// copied into the image at the start of the next frame the texture is used
/// in. Replacing allocates a new image and bumps the version, so binding data
/// rewrites its descriptors; the old image is destroyed once no frame in
/// flight can reference it.
pub struct Texture {
    device: Arc<Device>,
    garbage: GarbageQueue<VulkanBackend>,
    desc: TextureDesc,
    array: bool,
    sampler: vk::Sampler,
    version: AtomicU64,
    state: Mutex<TextureState>,
}

impl Texture {
    /// Creates a texture and stages `data`, every layer tightly packed.
    ///
    /// `array` selects a 2D array view regardless of the layer count.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not match `desc` or any GPU object
    /// cannot be created.
    pub fn new(
        device: Arc<Device>,
        garbage: GarbageQueue<VulkanBackend>,
        samplers: &SamplerCache,
        desc: TextureDesc,
        array: bool,
        data: &[u8],
    ) -> RenderResult<Self> {
        let sampler = samplers.get(desc.sampler)?;
        let state = stage(&device, &desc, array, data)?;

        debug!(
            "Created texture{}: {}x{}x{} {:?}",
            if array { " array" } else { "" },
            desc.width,
            desc.height,
            desc.layers,
            desc.format
        );

        Ok(Self {
            device,
            garbage,
            desc,
            array,
            sampler,
            version: AtomicU64::new(1),
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TextureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shape and format.
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    /// Returns true if the texture has an array view.
    pub fn is_array(&self) -> bool {
        self.array
    }

    /// Replaces the texels with `data` of the same shape.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not match or allocation fails.
    pub fn replace(&self, data: &[u8]) -> RenderResult<()> {
        let fresh = stage(&self.device, &self.desc, self.array, data)?;
        let old = std::mem::replace(&mut *self.lock(), fresh);
        self.version.fetch_add(1, Ordering::AcqRel);

        let image = old.image;
        self.garbage.dispose("texture image", move |_| drop(image));
        Ok(())
    }
}

fn stage(
    device: &Arc<Device>,
    desc: &TextureDesc,
    array: bool,
    data: &[u8],
) -> RenderResult<TextureState> {
    desc.check_data(data)?;
    let image = Image::new(Arc::clone(device), &desc.image_desc(array))?;
    let staging = Buffer::new_with_data(Arc::clone(device), BufferUsage::Staging, data)?;
    Ok(TextureState {
        image: Arc::new(image),
        staging: Some(Arc::new(staging)),
    })
}

fn upload_regions(desc: &TextureDesc, image: &ImageDesc) -> RenderResult<Vec<vk::BufferImageCopy>> {
    let layer_size = desc.layer_size()?;
    Ok((0..desc.layers)
        .map(|layer| layer_copy_region(image, layer, layer as u64 * layer_size))
        .collect())
}

impl RenderResource for Texture {
    fn on_render(&self, render_state: &mut FrameRenderState) -> RenderResult<()> {
        let mut state = self.lock();
        let Some(staging) = state.staging.take() else {
            return Ok(());
        };

        render_state.push_image_upload(ImageUpload {
            src: staging.handle(),
            image: state.image.handle(),
            aspect: vk::ImageAspectFlags::COLOR,
            layer_count: self.desc.layers,
            regions: upload_regions(&self.desc, state.image.desc())?,
        });
        self.garbage
            .dispose("texture staging", move |_| drop(staging));
        Ok(())
    }
}

impl TextureResource for Texture {
    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        descriptor::image_info(self.sampler, self.lock().image.view())
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let image = Arc::clone(&state.image);
        self.garbage.dispose("texture image", move |_| drop(image));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8_UNORM), Some(1));
        assert_eq!(texel_size(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }

    #[test]
    fn test_data_must_cover_every_layer() {
        let desc = TextureDesc::new(4, 2, vk::Format::R8G8B8A8_UNORM).with_layers(3);
        assert_eq!(desc.layer_size().unwrap(), 32);
        assert!(desc.check_data(&[0; 96]).is_ok());
        assert!(desc.check_data(&[0; 32]).is_err());
        assert!(
            TextureDesc::new(0, 2, vk::Format::R8G8B8A8_UNORM)
                .check_data(&[])
                .is_err()
        );
    }

    #[test]
    fn test_upload_regions_one_per_layer() {
        let desc = TextureDesc::new(8, 8, vk::Format::R8_UNORM).with_layers(2);
        let regions = upload_regions(&desc, &desc.image_desc(true)).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].buffer_offset, 64);
        assert_eq!(regions[1].image_subresource.base_array_layer, 1);
    }

    #[test]
    fn test_array_flag_selects_view() {
        let desc = TextureDesc::new(8, 8, vk::Format::R8_UNORM);
        assert_eq!(
            desc.image_desc(true).view_type(),
            vk::ImageViewType::TYPE_2D_ARRAY
        );
        assert_eq!(desc.image_desc(false).view_type(), vk::ImageViewType::TYPE_2D);
    }
}
