//! Frame counter and frame slots.
//!
//! Every resource that must know "which frame is this" reads the same
//! [`FrameCounter`]. The scheduler is the only writer and advances it exactly
//! once per completed frame. The frame slot is `counter % MAX_FRAMES_IN_FLIGHT`
//! and indexes all per-slot arrays (command buffers, fences, uniform regions,
//! descriptor sets).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::MAX_FRAMES_IN_FLIGHT;

/// Frame slot for a frame number.
#[inline]
pub fn slot_of(frame: u64) -> usize {
    (frame % MAX_FRAMES_IN_FLIGHT as u64) as usize
}

/// Shared, monotonically increasing frame number.
#[derive(Clone, Debug, Default)]
pub struct FrameCounter {
    value: Arc<AtomicU64>,
}

impl FrameCounter {
    /// Creates a counter starting at frame 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current frame number.
    #[inline]
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Frame slot of the current frame.
    #[inline]
    pub fn slot(&self) -> usize {
        slot_of(self.current())
    }

    /// Advances to the next frame and returns its number.
    pub(crate) fn advance(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[cfg(test)]
    pub(crate) fn set(&self, frame: u64) {
        self.value.store(frame, Ordering::Release);
    }
}
