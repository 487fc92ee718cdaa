//! Renderer error types.

use thiserror::Error;
use vkframe_rhi::RhiError;

/// Renderer error type.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Error from the Vulkan abstraction layer
    #[error(transparent)]
    Rhi(#[from] RhiError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] vkframe_core::Error),

    /// Binding index past the end of the layout
    #[error("Binding index {index} out of range ({len} bindings)")]
    BindingIndex { index: usize, len: usize },

    /// Binding accessed as the wrong kind
    #[error("Binding {index} is a {actual} binding, not {expected}")]
    BindingKind {
        index: usize,
        expected: &'static str,
        actual: &'static str,
    },

    /// Constant value of the wrong size
    #[error("Binding {index} holds {expected} bytes, got {actual}")]
    ValueSize {
        index: usize,
        expected: u64,
        actual: u64,
    },

    /// Two bindings share a binding number
    #[error("Duplicate binding number {0}")]
    DuplicateBinding(u32),

    /// Constant binding declared with zero size
    #[error("Constant binding {0} has zero size")]
    EmptyConstants(u32),

    /// A pool, group or buffer could not be allocated
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// Operation not valid in the current frame state
    #[error("Invalid frame state: {0}")]
    FrameState(String),

    /// Resource data does not match its declared shape
    #[error("Invalid resource data: {0}")]
    InvalidData(String),
}

/// Result type alias for renderer operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;
