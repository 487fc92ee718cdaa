//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides thin, safe wrappers over Vulkan using the `ash` crate
//! and `gpu-allocator`. Instance creation, physical device selection and the
//! swapchain are owned by the application; this crate starts from an existing
//! logical device and handles:
//! - Memory allocation and buffer/image management
//! - Samplers (cached)
//! - Command buffer recording
//! - Descriptor layouts, pools and updates
//! - Pipeline layout and graphics pipeline creation
//! - Synchronization primitives

mod error;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod sampler;
pub mod sync;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
