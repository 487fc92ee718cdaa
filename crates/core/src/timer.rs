//! Frame timing.

use std::time::{Duration, Instant};

/// Number of frames averaged by [`FrameTimer::average`].
const AVERAGE_WINDOW: usize = 32;

/// Measures CPU time spent per frame and keeps a short rolling average.
///
/// The scheduler calls [`begin`](Self::begin) when a frame starts recording
/// and [`end`](Self::end) once it has been presented.
#[derive(Debug)]
pub struct FrameTimer {
    frame_start: Option<Instant>,
    samples: [Duration; AVERAGE_WINDOW],
    next_sample: usize,
    sample_count: usize,
}

impl FrameTimer {
    /// Create a timer with no recorded frames.
    pub fn new() -> Self {
        Self {
            frame_start: None,
            samples: [Duration::ZERO; AVERAGE_WINDOW],
            next_sample: 0,
            sample_count: 0,
        }
    }

    /// Mark the start of a frame.
    pub fn begin(&mut self) {
        self.frame_start = Some(Instant::now());
    }

    /// Mark the end of the current frame and return its duration.
    ///
    /// Returns `None` if [`begin`](Self::begin) was not called first.
    pub fn end(&mut self) -> Option<Duration> {
        let elapsed = self.frame_start.take()?.elapsed();
        self.record(elapsed);
        Some(elapsed)
    }

    /// Drop the in-progress measurement, e.g. when a frame is skipped.
    pub fn cancel(&mut self) {
        self.frame_start = None;
    }

    /// Rolling average over the last recorded frames.
    pub fn average(&self) -> Duration {
        if self.sample_count == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.samples[..self.sample_count].iter().sum();
        total / self.sample_count as u32
    }

    /// Number of frames recorded so far, capped at the averaging window.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    fn record(&mut self, sample: Duration) {
        self.samples[self.next_sample] = sample;
        self.next_sample = (self.next_sample + 1) % AVERAGE_WINDOW;
        self.sample_count = (self.sample_count + 1).min(AVERAGE_WINDOW);
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}
