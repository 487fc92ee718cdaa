//! Scheduler counters.

use crate::draw::CompileStats;

/// Totals since the scheduler was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames submitted and presented.
    pub frames_completed: u64,
    /// `begin_frame` calls that returned false.
    pub frames_skipped: u64,
    /// Indexed draws recorded.
    pub draws: u64,
    /// Binds and scissor changes recorded.
    pub binds: u64,
    /// Draws dropped for missing state.
    pub skipped_draws: u64,
    /// Participants whose `on_render` failed.
    pub failed_participants: u64,
}

impl FrameStats {
    pub(crate) fn record_frame(&mut self, compile: &CompileStats, failed_participants: usize) {
        self.frames_completed += 1;
        self.draws += compile.draws as u64;
        self.binds += compile.binds as u64;
        self.skipped_draws += compile.skipped as u64;
        self.failed_participants += failed_participants as u64;
    }
}
