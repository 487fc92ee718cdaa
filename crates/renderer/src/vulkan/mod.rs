//! Vulkan backend.
//!
//! [`VulkanBackend`] implements the device seams on top of `vkframe-rhi`.
//! The swapchain stays with the application behind the [`Presenter`] trait.
//! [`RenderBuffer`] and [`Texture`] are the frame participants the backend
//! knows how to create.

mod backend;
mod buffer;
mod presenter;
mod recorder;
mod texture;

use std::sync::Arc;

pub use backend::VulkanBackend;
pub use buffer::{GeometryKind, RenderBuffer, Volatility};
pub use presenter::Presenter;
pub use recorder::VulkanRecorder;
pub use texture::{Texture, TextureDesc, texel_size};

use crate::error::RenderResult;
use crate::scheduler::FrameScheduler;

impl FrameScheduler<VulkanBackend> {
    /// Creates a vertex buffer of `capacity` elements of `stride` bytes.
    pub fn create_vertex_buffer(
        &self,
        volatility: Volatility,
        stride: u32,
        capacity: u32,
    ) -> RenderResult<Arc<RenderBuffer>> {
        self.create_geometry_buffer(GeometryKind::Vertex, volatility, stride, capacity)
    }

    /// Creates an index buffer; `stride` is 2 or 4.
    pub fn create_index_buffer(
        &self,
        volatility: Volatility,
        stride: u32,
        capacity: u32,
    ) -> RenderResult<Arc<RenderBuffer>> {
        self.create_geometry_buffer(GeometryKind::Index, volatility, stride, capacity)
    }

    fn create_geometry_buffer(
        &self,
        kind: GeometryKind,
        volatility: Volatility,
        stride: u32,
        capacity: u32,
    ) -> RenderResult<Arc<RenderBuffer>> {
        Ok(Arc::new(RenderBuffer::new(
            Arc::clone(self.backend().device()),
            self.garbage().clone(),
            kind,
            volatility,
            stride,
            capacity,
        )?))
    }

    /// Creates a single-layer texture from tightly packed texels.
    pub fn create_texture(&self, desc: TextureDesc, data: &[u8]) -> RenderResult<Arc<Texture>> {
        self.create_texture_with(desc.with_layers(1), false, data)
    }

    /// Creates a texture array from layers packed back to back.
    pub fn create_texture_array(
        &self,
        desc: TextureDesc,
        data: &[u8],
    ) -> RenderResult<Arc<Texture>> {
        self.create_texture_with(desc, true, data)
    }

    fn create_texture_with(
        &self,
        desc: TextureDesc,
        array: bool,
        data: &[u8],
    ) -> RenderResult<Arc<Texture>> {
        let backend = self.backend();
        Ok(Arc::new(Texture::new(
            Arc::clone(backend.device()),
            self.garbage().clone(),
            backend.samplers(),
            desc,
            array,
            data,
        )?))
    }
}
