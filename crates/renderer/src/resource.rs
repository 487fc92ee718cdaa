//! Traits for resources that take part in a frame.
//!
//! A resource referenced by a draw (or by binding data used in a draw) is
//! registered as a participant of the frame. Before any command is recorded
//! the scheduler calls [`RenderResource::on_render`] on every participant so
//! it can queue its uploads and descriptor writes into the
//! [`FrameRenderState`].

use ash::vk;

use crate::error::RenderResult;
use crate::render_state::FrameRenderState;

/// Something that prepares GPU state for the frame it is used in.
pub trait RenderResource: Send + Sync {
    /// Queues pending uploads and descriptor writes for the current frame.
    fn on_render(&self, state: &mut FrameRenderState) -> RenderResult<()>;
}

/// A sampled image that binding data can point at.
pub trait TextureResource: RenderResource {
    /// Generation of the underlying image; changes whenever the image or view
    /// handle changes.
    fn version(&self) -> u64;

    /// Sampler, view and layout for a combined image sampler descriptor.
    fn descriptor_info(&self) -> vk::DescriptorImageInfo;
}

/// Buffer range bound for vertex or index input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    /// Buffer handle.
    pub buffer: vk::Buffer,
    /// Byte offset of the range.
    pub offset: vk::DeviceSize,
}

/// Vertex or index data usable by a draw.
pub trait GeometryBuffer: RenderResource {
    /// Range to bind when drawing in frame slot `slot`.
    fn binding(&self, slot: usize) -> BufferBinding;

    /// Number of elements currently holding data.
    fn len(&self) -> u32;

    /// Returns true if the buffer holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index type, for index buffers.
    fn index_type(&self) -> vk::IndexType {
        vk::IndexType::UINT32
    }
}
