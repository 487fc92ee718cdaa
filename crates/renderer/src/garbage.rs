//! Deferred destruction.
//!
//! GPU objects cannot be destroyed while a frame that references them is in
//! flight. Instead of destroying them, owners hand a closure to the
//! [`GarbageQueue`]. Each closure is stamped with the shared frame counter at
//! the time of disposal and lands in that frame's bucket. `begin_frame`
//! collects, after waiting for the slot fence, every bucket whose frame `F`
//! satisfies `F + MAX_FRAMES_IN_FLIGHT + 1 <= current`, so a bucket is
//! collected only after every frame that could have used its contents has
//! retired, no matter where in the frame cycle the disposal happened.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::MAX_FRAMES_IN_FLIGHT;
use crate::frame::FrameCounter;

/// Number of frames a bucket waits before it is collected.
pub const GARBAGE_BUCKETS: usize = MAX_FRAMES_IN_FLIGHT + 1;

type DestroyFn<D> = Box<dyn FnOnce(&D) + Send>;

struct GarbageItem<D> {
    label: &'static str,
    destroy: DestroyFn<D>,
}

struct Bucket<D> {
    frame: u64,
    items: Vec<GarbageItem<D>>,
}

/// Garbage buckets ordered by frame, oldest at the front.
pub struct GarbageRing<D> {
    buckets: VecDeque<Bucket<D>>,
}

impl<D> Default for GarbageRing<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> GarbageRing<D> {
    /// Creates an empty ring.
    pub fn new() -> Self {
        Self {
            buckets: VecDeque::with_capacity(GARBAGE_BUCKETS),
        }
    }

    /// Number of non-empty buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total number of items waiting in all buckets.
    pub fn pending(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.items.len()).sum()
    }

    /// Queues a destruction into the bucket of `frame`.
    pub fn dispose(
        &mut self,
        frame: u64,
        label: &'static str,
        destroy: impl FnOnce(&D) + Send + 'static,
    ) {
        let item = GarbageItem {
            label,
            destroy: Box::new(destroy),
        };
        match self.buckets.back_mut() {
            Some(bucket) if bucket.frame >= frame => bucket.items.push(item),
            _ => self.buckets.push_back(Bucket {
                frame,
                items: vec![item],
            }),
        }
    }

    /// Takes every bucket that no frame in flight at `current` can reference.
    fn take_retired(&mut self, current: u64) -> Vec<GarbageItem<D>> {
        let mut items = Vec::new();
        while let Some(bucket) = self.buckets.front() {
            if bucket.frame + GARBAGE_BUCKETS as u64 > current {
                break;
            }
            if let Some(bucket) = self.buckets.pop_front() {
                items.extend(bucket.items);
            }
        }
        items
    }

    fn take_all(&mut self) -> Vec<GarbageItem<D>> {
        self.buckets.drain(..).flat_map(|bucket| bucket.items).collect()
    }
}

fn run<D>(items: Vec<GarbageItem<D>>, device: &D) -> usize {
    let count = items.len();
    for item in items {
        trace!("Destroying {}", item.label);
        (item.destroy)(device);
    }
    count
}

/// Shared handle to a [`GarbageRing`].
///
/// Cloning is cheap; every clone feeds the same ring and reads the same
/// [`FrameCounter`].
pub struct GarbageQueue<D> {
    ring: Arc<Mutex<GarbageRing<D>>>,
    frames: FrameCounter,
}

impl<D> Clone for GarbageQueue<D> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
            frames: self.frames.clone(),
        }
    }
}

impl<D> GarbageQueue<D> {
    /// Creates an empty queue stamping disposals with `frames`.
    pub fn new(frames: FrameCounter) -> Self {
        Self {
            ring: Arc::new(Mutex::new(GarbageRing::new())),
            frames,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GarbageRing<D>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a destruction for the current frame. O(1), never fails.
    pub fn dispose(&self, label: &'static str, destroy: impl FnOnce(&D) + Send + 'static) {
        let frame = self.frames.current();
        self.lock().dispose(frame, label, destroy);
    }

    /// Runs every bucket retired at the current frame.
    ///
    /// Only call this once the fence of the current slot has signaled.
    /// Calling it again within the same frame finds nothing new, so an
    /// aborted and retried frame start does not age the buckets. Closures run
    /// without the lock held and may queue more garbage.
    pub fn collect(&self, device: &D) -> usize {
        let frame = self.frames.current();
        let items = self.lock().take_retired(frame);
        let count = run(items, device);
        if count > 0 {
            debug!("Frame {}: destroyed {} deferred object(s)", frame, count);
        }
        count
    }

    /// Runs every bucket. Only valid once the device is idle.
    pub fn flush(&self, device: &D) -> usize {
        let mut total = 0;
        // Closures may dispose more garbage while running
        loop {
            let items = self.lock().take_all();
            if items.is_empty() {
                break;
            }
            total += run(items, device);
        }
        debug!("Flushed {} deferred object(s)", total);
        total
    }

    /// Items waiting in all buckets.
    pub fn pending(&self) -> usize {
        self.lock().pending()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn dispose_counted(queue: &GarbageQueue<()>, hits: &Arc<AtomicUsize>) {
        let hits = Arc::clone(hits);
        queue.dispose("test", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    #[test]
    fn test_item_survives_frames_in_flight() {
        let frames = FrameCounter::new();
        let queue = GarbageQueue::new(frames.clone());
        let hits = counter();

        // Disposed during frame 0
        dispose_counted(&queue, &hits);

        // Frames 1..=N begin: the item may still be referenced
        for frame in 1..=MAX_FRAMES_IN_FLIGHT as u64 {
            frames.set(frame);
            queue.collect(&());
            assert_eq!(hits.load(Ordering::SeqCst), 0, "collected at frame {}", frame);
        }

        // Frame N+1 begins after the fence of frame 1 (and so frame 0) retired
        frames.set(MAX_FRAMES_IN_FLIGHT as u64 + 1);
        queue.collect(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_retried_frame_does_not_advance() {
        let frames = FrameCounter::new();
        let queue = GarbageQueue::new(frames.clone());
        let hits = counter();
        dispose_counted(&queue, &hits);

        // Frame 1 begin aborts and is retried several times
        frames.set(1);
        for _ in 0..5 {
            queue.collect(&());
        }
        frames.set(2);
        queue.collect(&());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        frames.set(3);
        queue.collect(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disposal_between_collections_keeps_its_frame() {
        let frames = FrameCounter::new();
        let queue = GarbageQueue::new(frames.clone());
        let hits = counter();

        // Frame 0 starts, then the counter moves to 1 at end of frame
        queue.collect(&());
        frames.set(1);

        // Disposed while idle before frame 1 starts
        dispose_counted(&queue, &hits);

        for frame in 1..=3 {
            frames.set(frame);
            queue.collect(&());
            assert_eq!(hits.load(Ordering::SeqCst), 0, "collected at frame {}", frame);
        }

        frames.set(4);
        queue.collect(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_skipped_collections_catch_up() {
        let frames = FrameCounter::new();
        let queue = GarbageQueue::new(frames.clone());
        let hits = counter();

        for frame in 0..4 {
            frames.set(frame);
            dispose_counted(&queue, &hits);
        }

        frames.set(10);
        assert_eq!(queue.collect(&()), 4);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_flush_runs_everything() {
        let frames = FrameCounter::new();
        let queue = GarbageQueue::new(frames.clone());
        let hits = counter();

        dispose_counted(&queue, &hits);
        frames.set(1);
        dispose_counted(&queue, &hits);

        assert_eq!(queue.flush(&()), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_closure_may_dispose_more() {
        let queue: GarbageQueue<()> = GarbageQueue::new(FrameCounter::new());
        let hits = counter();

        let inner_queue = queue.clone();
        let inner_hits = Arc::clone(&hits);
        queue.dispose("outer", move |_| {
            dispose_counted(&inner_queue, &inner_hits);
        });

        assert_eq!(queue.flush(&()), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_one_bucket_per_frame() {
        let mut ring: GarbageRing<()> = GarbageRing::new();
        ring.dispose(0, "a", |_| {});
        ring.dispose(0, "b", |_| {});
        ring.dispose(1, "c", |_| {});
        assert_eq!(ring.bucket_count(), 2);
        assert_eq!(ring.pending(), 3);

        assert_eq!(ring.take_retired(GARBAGE_BUCKETS as u64).len(), 2);
        assert_eq!(ring.bucket_count(), 1);
    }
}
