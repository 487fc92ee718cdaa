//! Frame event callbacks.

use ash::vk;

/// Points in the frame where callbacks run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameEvent {
    /// After an image was acquired and recording began.
    BeginFrame,
    /// After the render pass began, before the accumulated draws.
    BeginRenderPass,
    /// After the accumulated draws, before the render pass ends.
    EndRenderPass,
    /// After presentation.
    PostRender,
}

const EVENT_COUNT: usize = 4;

impl FrameEvent {
    fn index(self) -> usize {
        match self {
            FrameEvent::BeginFrame => 0,
            FrameEvent::BeginRenderPass => 1,
            FrameEvent::EndRenderPass => 2,
            FrameEvent::PostRender => 3,
        }
    }
}

/// Frame passed to callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frame number.
    pub frame: u64,
    /// Frame slot.
    pub slot: usize,
    /// Acquired image.
    pub image_index: u32,
    /// Surface size.
    pub extent: vk::Extent2D,
}

/// A callback; returning false unregisters it.
pub type FrameCallback = Box<dyn FnMut(&FrameInfo) -> bool + Send>;

/// Registered callbacks per event.
#[derive(Default)]
pub struct FrameCallbacks {
    lists: [Vec<FrameCallback>; EVENT_COUNT],
}

impl FrameCallbacks {
    /// Registers `callback` for `event`.
    pub fn register(&mut self, event: FrameEvent, callback: FrameCallback) {
        self.lists[event.index()].push(callback);
    }

    /// Runs the callbacks of `event` in registration order, dropping those
    /// that return false.
    pub fn run(&mut self, event: FrameEvent, info: &FrameInfo) {
        self.lists[event.index()].retain_mut(|callback| callback(info));
    }

    /// Number of callbacks registered for `event`.
    pub fn len(&self, event: FrameEvent) -> usize {
        self.lists[event.index()].len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn info(frame: u64) -> FrameInfo {
        FrameInfo {
            frame,
            slot: 0,
            image_index: 0,
            extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
        }
    }

    #[test]
    fn test_callback_unregisters_itself() {
        let mut callbacks = FrameCallbacks::default();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        callbacks.register(
            FrameEvent::PostRender,
            Box::new(move |info| {
                counter.fetch_add(1, Ordering::SeqCst);
                info.frame < 2
            }),
        );

        for frame in 0..5 {
            callbacks.run(FrameEvent::PostRender, &info(frame));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(callbacks.len(FrameEvent::PostRender), 0);
    }

    #[test]
    fn test_events_are_separate() {
        let mut callbacks = FrameCallbacks::default();
        callbacks.register(FrameEvent::BeginFrame, Box::new(|_| true));

        callbacks.run(FrameEvent::EndRenderPass, &info(0));
        assert_eq!(callbacks.len(FrameEvent::BeginFrame), 1);
        assert_eq!(callbacks.len(FrameEvent::EndRenderPass), 0);
    }
}
