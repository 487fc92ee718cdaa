//! Per-frame pending GPU work.
//!
//! [`FrameRenderState`] collects everything participants want done before the
//! frame's draws: descriptor writes, buffer copies and image copies. The
//! scheduler drains it once per frame, records all uploads in one batch and
//! applies all descriptor writes in a single call.

use std::collections::HashSet;
use std::sync::Arc;

use ash::vk;
use tracing::warn;

pub use vkframe_rhi::descriptor::{DescriptorWrite, DescriptorWriteKind};

use crate::frame::slot_of;
use crate::resource::RenderResource;

/// Copy from a staging buffer into a device-local buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferUpload {
    /// Staging buffer.
    pub src: vk::Buffer,
    /// Destination buffer.
    pub dst: vk::Buffer,
    /// Copy region.
    pub region: vk::BufferCopy,
}

/// Copy from a staging buffer into every layer of an image.
#[derive(Clone, Debug)]
pub struct ImageUpload {
    /// Staging buffer.
    pub src: vk::Buffer,
    /// Destination image.
    pub image: vk::Image,
    /// Aspect of the destination.
    pub aspect: vk::ImageAspectFlags,
    /// Number of layers covered by `regions`.
    pub layer_count: u32,
    /// One region per layer.
    pub regions: Vec<vk::BufferImageCopy>,
}

/// Uploads recorded before the render pass.
#[derive(Clone, Debug, Default)]
pub struct UploadBatch {
    /// Buffer copies.
    pub buffers: Vec<BufferUpload>,
    /// Image copies.
    pub images: Vec<ImageUpload>,
}

impl UploadBatch {
    /// Returns true if there is nothing to record.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }
}

/// Pending work and participating resources for one frame.
pub struct FrameRenderState {
    frame: u64,
    slot: usize,
    descriptor_writes: Vec<DescriptorWrite>,
    uploads: UploadBatch,
    participants: Vec<Arc<dyn RenderResource>>,
    seen: HashSet<usize>,
}

impl FrameRenderState {
    /// Creates an empty state for `frame`.
    pub fn new(frame: u64) -> Self {
        Self {
            frame,
            slot: slot_of(frame),
            descriptor_writes: Vec::new(),
            uploads: UploadBatch::default(),
            participants: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Frame number being prepared.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Frame slot being prepared.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Registers a resource for this frame. Returns false if it already was.
    ///
    /// The state keeps the resource alive until [`clear`](Self::clear).
    pub fn add_participant(&mut self, resource: Arc<dyn RenderResource>) -> bool {
        let key = Arc::as_ptr(&resource) as *const () as usize;
        if !self.seen.insert(key) {
            return false;
        }
        self.participants.push(resource);
        true
    }

    /// Number of registered participants.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Queues a descriptor write.
    pub fn push_descriptor_write(&mut self, write: DescriptorWrite) {
        self.descriptor_writes.push(write);
    }

    /// Queues a buffer copy.
    pub fn push_buffer_upload(&mut self, upload: BufferUpload) {
        self.uploads.buffers.push(upload);
    }

    /// Queues an image copy.
    pub fn push_image_upload(&mut self, upload: ImageUpload) {
        self.uploads.images.push(upload);
    }

    /// Queued descriptor writes.
    pub fn descriptor_writes(&self) -> &[DescriptorWrite] {
        &self.descriptor_writes
    }

    /// Queued uploads.
    pub fn uploads(&self) -> &UploadBatch {
        &self.uploads
    }

    /// Calls `on_render` on every participant.
    ///
    /// Participants may register further participants (binding data
    /// registering its textures); those run in the same pass. A failing
    /// participant is logged and skipped. Returns the number of failures.
    pub fn prepare_participants(&mut self) -> usize {
        let mut failures = 0;
        let mut index = 0;
        while index < self.participants.len() {
            let participant = Arc::clone(&self.participants[index]);
            if let Err(e) = participant.on_render(self) {
                warn!("Frame {}: resource failed to prepare: {}", self.frame, e);
                failures += 1;
            }
            index += 1;
        }
        failures
    }

    /// Drops all pending work and participants and retargets the state at
    /// `frame`.
    pub fn reset(&mut self, frame: u64) {
        self.clear();
        self.frame = frame;
        self.slot = slot_of(frame);
    }

    /// Drops all pending work and releases the participants.
    pub fn clear(&mut self) {
        self.descriptor_writes.clear();
        self.uploads.buffers.clear();
        self.uploads.images.clear();
        self.participants.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::RenderResult;

    struct Counting {
        calls: AtomicUsize,
        child: Option<Arc<Counting>>,
    }

    impl RenderResource for Counting {
        fn on_render(&self, state: &mut FrameRenderState) -> RenderResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(child) = &self.child {
                state.add_participant(child.clone());
            }
            Ok(())
        }
    }

    fn counting(child: Option<Arc<Counting>>) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            child,
        })
    }

    #[test]
    fn test_participants_deduplicated() {
        let mut state = FrameRenderState::new(4);
        let resource = counting(None);

        assert!(state.add_participant(resource.clone()));
        assert!(!state.add_participant(resource.clone()));
        assert_eq!(state.participant_count(), 1);

        state.prepare_participants();
        assert_eq!(resource.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_participants_registered_during_prepare_run() {
        let child = counting(None);
        let parent = counting(Some(child.clone()));
        let mut state = FrameRenderState::new(0);

        state.add_participant(parent);
        assert_eq!(state.prepare_participants(), 0);
        assert_eq!(child.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.participant_count(), 2);
    }

    #[test]
    fn test_clear_releases_participants() {
        let resource = counting(None);
        let mut state = FrameRenderState::new(1);
        state.add_participant(resource.clone());
        assert_eq!(Arc::strong_count(&resource), 2);

        state.reset(2);
        assert_eq!(Arc::strong_count(&resource), 1);
        assert_eq!(state.frame(), 2);
        assert_eq!(state.slot(), slot_of(2));
        assert!(state.uploads().is_empty());
    }

    #[test]
    fn test_buffer_uploads_queued_until_reset() {
        let mut state = FrameRenderState::new(0);
        state.push_buffer_upload(BufferUpload {
            src: vk::Buffer::null(),
            dst: vk::Buffer::null(),
            region: vk::BufferCopy::default().size(256),
        });

        let uploads = state.uploads();
        assert!(!uploads.is_empty());
        assert_eq!(uploads.buffers.len(), 1);
        assert_eq!(uploads.buffers[0].region.size, 256);

        state.reset(1);
        assert!(state.uploads().is_empty());
    }
}
