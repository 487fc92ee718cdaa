//! Frame pipeline and draw batching.
//!
//! This crate keeps GPU work flowing frame after frame:
//! - Frame scheduling (acquire, record, submit, present)
//! - Deferred destruction of GPU objects
//! - Pooled descriptor sets and uniform storage for binding data
//! - Draw accumulation and compilation into minimal state changes
//! - A Vulkan backend over `vkframe-rhi`

pub mod binding;
pub mod descriptor_pool;
pub mod device;
pub mod draw;
pub mod error;
pub mod frame;
pub mod garbage;
pub mod pipeline;
pub mod render_state;
pub mod resource;
pub mod scheduler;
pub mod vulkan;

#[cfg(test)]
mod testing;

pub use binding::{BindingData, BindingDataFactory, BindingDesc, BindingKind, BindingLayout};
pub use device::{CommandRecorder, FrameBackend, GpuDevice};
pub use draw::DrawCommand;
pub use error::{RenderError, RenderResult};
pub use frame::FrameCounter;
pub use garbage::GarbageQueue;
pub use pipeline::{PipelineDesc, RenderPipeline, RenderScene, RenderSceneType};
pub use resource::{GeometryBuffer, RenderResource, TextureResource};
pub use scheduler::{FrameEvent, FrameInfo, FrameScheduler, FrameStats};
pub use vulkan::{Presenter, RenderBuffer, Texture, TextureDesc, Volatility, VulkanBackend};

/// Maximum number of frames that can be in flight simultaneously.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
