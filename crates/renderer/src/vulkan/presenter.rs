//! Swapchain seam.

use ash::vk;
use vkframe_rhi::RhiResult;

/// Presentation surface owned by the application.
///
/// The backend never creates or destroys the swapchain; it asks the presenter
/// for images, to acquire and present, and to rebuild itself after a resize.
pub trait Presenter: Send {
    /// Current image size.
    fn extent(&self) -> vk::Extent2D;

    /// Color format of the images.
    fn format(&self) -> vk::Format;

    /// Number of images.
    fn image_count(&self) -> u32;

    /// Image `index`.
    fn image(&self, index: u32) -> vk::Image;

    /// View of image `index`.
    fn image_view(&self, index: u32) -> vk::ImageView;

    /// Rebuilds the images for the current window size. The device is idle.
    fn recreate(&mut self) -> RhiResult<()>;

    /// Acquires the next image, signaling `signal` when it is ready.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire(&mut self, signal: vk::Semaphore) -> Result<(u32, bool), vk::Result>;

    /// Presents `image_index` on `queue` after `wait` is signaled.
    ///
    /// Returns whether the swapchain is suboptimal.
    fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool, vk::Result>;
}
