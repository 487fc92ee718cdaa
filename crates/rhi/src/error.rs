//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// A descriptor pool ran out of sets or descriptors
    #[error("Descriptor pool exhausted")]
    PoolExhausted,

    /// Shader module creation error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Surface or presentation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Invalid argument or handle
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

impl RhiError {
    /// Returns `true` when the error means the presentation surface is
    /// out of date and must be recreated rather than treated as a failure.
    pub fn is_out_of_date(&self) -> bool {
        matches!(
            self,
            RhiError::VulkanError(ash::vk::Result::ERROR_OUT_OF_DATE_KHR)
        )
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn test_out_of_date_detection() {
        assert!(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DATE_KHR).is_out_of_date());
        assert!(!RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST).is_out_of_date());
        assert!(!RhiError::PoolExhausted.is_out_of_date());
    }
}
