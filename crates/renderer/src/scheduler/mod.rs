//! The per-frame loop.
//!
//! [`FrameScheduler`] drives one frame at a time through
//! `Idle → Acquiring → Recording → Submitted → Presented → Idle`:
//!
//! ```text
//! begin_frame   wait slot fence, collect garbage, rebuild surface if flagged,
//!               acquire image, begin recording, BeginFrame callbacks
//! draw / draw_commands
//!               accumulate, register participants
//! end_frame     on_render participants, record uploads, write descriptors,
//!               render pass + compiled draws, submit, present, advance frame
//! ```
//!
//! Recoverable failures (out-of-date surface, zero extent, fence timeout)
//! make `begin_frame` return false; the caller simply tries again next tick.
//! A failed submission leaves the slot fence unsignaled and aborts the
//! process.

mod callbacks;
mod stats;

use std::sync::Arc;

use ash::vk;
use tracing::{debug, debug_span, error, info, warn};
use vkframe_core::{FrameTimer, RendererConfig};

pub use callbacks::{FrameCallback, FrameCallbacks, FrameEvent, FrameInfo};
pub use stats::FrameStats;

use crate::binding::{BindingData, BindingDesc};
use crate::device::{AcquireOutcome, FrameBackend, PresentOutcome};
use crate::draw::{DrawAccumulator, DrawCommand, InstancedDraw, ResolvedPipeline, SceneKey, execute};
use crate::error::{RenderError, RenderResult};
use crate::frame::{FrameCounter, slot_of};
use crate::garbage::GarbageQueue;
use crate::pipeline::{PipelineDesc, RenderPipeline, RenderScene, RenderSceneType};
use crate::render_state::FrameRenderState;
use crate::resource::{GeometryBuffer, RenderResource};

/// Where the scheduler is in the frame cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presented,
}

/// Drives frames on a [`FrameBackend`].
pub struct FrameScheduler<B: FrameBackend> {
    backend: Arc<B>,
    config: RendererConfig,
    frames: FrameCounter,
    garbage: GarbageQueue<B>,
    state: FrameState,
    image_index: u32,
    recorder: Option<B::Recorder>,
    render_state: FrameRenderState,
    accumulator: DrawAccumulator,
    callbacks: FrameCallbacks,
    recreate_surface: bool,
    timer: FrameTimer,
    stats: FrameStats,
    shut_down: bool,
}

impl<B: FrameBackend> FrameScheduler<B> {
    /// Creates a scheduler at frame 0.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(backend: Arc<B>, config: RendererConfig) -> RenderResult<Self> {
        config.validate()?;
        info!(
            "Frame scheduler created: {} frames in flight, {} buffer slots per group",
            crate::MAX_FRAMES_IN_FLIGHT,
            config.buffer_slots
        );

        let frames = FrameCounter::new();
        Ok(Self {
            backend,
            config,
            garbage: GarbageQueue::new(frames.clone()),
            frames,
            state: FrameState::Idle,
            image_index: 0,
            recorder: None,
            render_state: FrameRenderState::new(0),
            accumulator: DrawAccumulator::new(),
            callbacks: FrameCallbacks::default(),
            recreate_surface: false,
            timer: FrameTimer::new(),
            stats: FrameStats::default(),
            shut_down: false,
        })
    }

    /// The backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Configuration in use.
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// The frame counter shared with pools and resources.
    pub fn frames(&self) -> &FrameCounter {
        &self.frames
    }

    /// The garbage queue resources dispose into.
    pub fn garbage(&self) -> &GarbageQueue<B> {
        &self.garbage
    }

    /// Current state.
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Counters.
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Rolling average of CPU time per completed frame.
    pub fn average_frame_time(&self) -> std::time::Duration {
        self.timer.average()
    }

    /// Asks for the surface to be rebuilt before the next acquire, e.g.
    /// after a window resize.
    pub fn request_surface_recreate(&mut self) {
        self.recreate_surface = true;
    }

    /// Returns true if the surface will be rebuilt on the next `begin_frame`.
    pub fn surface_recreate_pending(&self) -> bool {
        self.recreate_surface
    }

    /// Registers `callback` for `event`. It stays registered while it
    /// returns true.
    pub fn on(&mut self, event: FrameEvent, callback: impl FnMut(&FrameInfo) -> bool + Send + 'static) {
        self.callbacks.register(event, Box::new(callback));
    }

    // =========================================================================
    // Object creation
    // =========================================================================

    /// Creates a scene type with scene-level `bindings`.
    pub fn create_scene_type(
        &self,
        bindings: Vec<BindingDesc>,
    ) -> RenderResult<Arc<RenderSceneType<B>>> {
        Ok(Arc::new(RenderSceneType::new(
            Arc::clone(&self.backend),
            bindings,
            &self.config,
            self.frames.clone(),
            self.garbage.clone(),
        )?))
    }

    /// Creates a scene of `scene_type` drawn at `order`.
    pub fn create_scene(
        &self,
        scene_type: &Arc<RenderSceneType<B>>,
        order: i32,
    ) -> RenderResult<Arc<RenderScene<B>>> {
        Ok(Arc::new(RenderScene::new(Arc::clone(scene_type), order)?))
    }

    /// Creates a pipeline for scenes of `scene_type`.
    pub fn create_pipeline(
        &self,
        scene_type: &Arc<RenderSceneType<B>>,
        desc: &PipelineDesc,
    ) -> RenderResult<Arc<RenderPipeline<B>>> {
        Ok(Arc::new(RenderPipeline::new(
            Arc::clone(&self.backend),
            Arc::clone(scene_type),
            desc,
            &self.config,
            self.frames.clone(),
            self.garbage.clone(),
        )?))
    }

    // =========================================================================
    // Frame cycle
    // =========================================================================

    /// Starts a frame. Returns false if no frame can be recorded now.
    pub fn begin_frame(&mut self) -> bool {
        if self.state != FrameState::Idle {
            warn!("begin_frame called while {:?}", self.state);
            return false;
        }

        let frame = self.frames.current();
        let slot = slot_of(frame);
        let _span = debug_span!("begin_frame", frame, slot).entered();

        self.state = FrameState::Acquiring;
        let started = match self.try_begin(frame, slot) {
            Ok(started) => started,
            Err(e) => {
                warn!("Frame {}: begin failed: {}", frame, e);
                false
            }
        };

        if !started {
            self.state = FrameState::Idle;
            self.stats.frames_skipped += 1;
            return false;
        }

        self.state = FrameState::Recording;
        self.timer.begin();
        let info = self.frame_info();
        self.callbacks.run(FrameEvent::BeginFrame, &info);
        true
    }

    fn try_begin(&mut self, frame: u64, slot: usize) -> RenderResult<bool> {
        self.backend.wait_for_slot(slot)?;
        self.garbage.collect(&self.backend);

        if self.recreate_surface && !is_zero(self.backend.surface_extent()) {
            debug!("Recreating surface");
            self.backend.recreate_surface()?;
            self.recreate_surface = false;
        }

        if is_zero(self.backend.surface_extent()) {
            debug!("Surface has zero extent, skipping frame");
            return Ok(false);
        }

        let image_index = match self.backend.acquire_image(slot)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    debug!("Acquired suboptimal image {}", image_index);
                    self.recreate_surface = true;
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                debug!("Surface out of date on acquire");
                self.recreate_surface = true;
                return Ok(false);
            }
        };

        match self.backend.begin_recording(slot) {
            Ok(recorder) => self.recorder = Some(recorder),
            Err(e) => {
                // The acquired image is never presented; a new surface frees it
                self.recreate_surface = true;
                return Err(e);
            }
        }
        self.image_index = image_index;
        self.render_state.reset(frame);
        Ok(true)
    }

    fn frame_info(&self) -> FrameInfo {
        FrameInfo {
            frame: self.render_state.frame(),
            slot: self.render_state.slot(),
            image_index: self.image_index,
            extent: self.backend.surface_extent(),
        }
    }

    fn expect_recording(&self, operation: &str) -> RenderResult<()> {
        if self.state == FrameState::Recording {
            Ok(())
        } else {
            Err(RenderError::FrameState(format!(
                "{} called while {:?}",
                operation, self.state
            )))
        }
    }

    /// Accumulates one instanced draw of all of `indices`.
    ///
    /// # Errors
    ///
    /// Returns an error outside of a frame or if `pipeline` was created for
    /// another scene type than `scene`'s.
    pub fn draw(
        &mut self,
        scene: &RenderScene<B>,
        pipeline: &RenderPipeline<B>,
        material: &Arc<BindingData<B>>,
        instance: &Arc<BindingData<B>>,
        vertices: &Arc<dyn GeometryBuffer>,
        indices: &Arc<dyn GeometryBuffer>,
    ) -> RenderResult<()> {
        self.expect_recording("draw")?;
        check_scene_type(scene, pipeline)?;

        let slot = self.render_state.slot();
        let state = &mut self.render_state;
        state.add_participant(scene.data().clone());
        state.add_participant(material.clone());
        state.add_participant(instance.clone());
        state.add_participant(vertices.clone() as Arc<dyn RenderResource>);
        state.add_participant(indices.clone() as Arc<dyn RenderResource>);

        self.accumulator.add_draw(
            scene_key(scene),
            scene.data().descriptor_set(slot),
            InstancedDraw {
                pipeline: ResolvedPipeline::of(pipeline),
                material: material.descriptor_set(slot),
                instance: instance.descriptor_set(slot),
                vertices: vertices.binding(slot),
                indices: indices.binding(slot),
                index_type: indices.index_type(),
                index_count: indices.len(),
            },
        );
        Ok(())
    }

    /// Accumulates an explicit command list for `scene`.
    ///
    /// # Errors
    ///
    /// Returns an error outside of a frame or if a pipeline in `commands` was
    /// created for another scene type than `scene`'s.
    pub fn draw_commands(
        &mut self,
        scene: &RenderScene<B>,
        commands: &[DrawCommand<B>],
    ) -> RenderResult<()> {
        self.expect_recording("draw_commands")?;
        for command in commands {
            if let DrawCommand::SwitchPipeline(pipeline) = command {
                check_scene_type(scene, pipeline)?;
            }
        }

        let slot = self.render_state.slot();
        self.render_state.add_participant(scene.data().clone());
        let resolved = commands
            .iter()
            .map(|command| command.resolve(&mut self.render_state))
            .collect();

        self.accumulator
            .add_commands(scene_key(scene), scene.data().descriptor_set(slot), resolved);
        Ok(())
    }

    /// Records, submits and presents the frame. Returns false if no frame
    /// was being recorded.
    pub fn end_frame(&mut self) -> bool {
        if self.state != FrameState::Recording {
            warn!("end_frame called while {:?}", self.state);
            return false;
        }
        let Some(mut recorder) = self.recorder.take() else {
            warn!("end_frame called without a command recorder");
            self.state = FrameState::Idle;
            return false;
        };

        let frame = self.render_state.frame();
        let slot = self.render_state.slot();
        let image_index = self.image_index;
        let _span = debug_span!("end_frame", frame, slot).entered();

        let failures = self.render_state.prepare_participants();

        self.backend
            .record_uploads(&mut recorder, self.render_state.uploads());
        let writes = self.render_state.descriptor_writes();
        if !writes.is_empty() {
            self.backend.update_descriptor_sets(writes);
        }

        let info = self.frame_info();
        self.backend
            .begin_render_pass(&mut recorder, image_index, self.config.clear_color);
        self.callbacks.run(FrameEvent::BeginRenderPass, &info);

        let full_scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: info.extent,
        };
        let (commands, compile_stats) = self.accumulator.compile(full_scissor);
        execute(&commands, &mut recorder);

        self.callbacks.run(FrameEvent::EndRenderPass, &info);
        self.backend.end_render_pass(&mut recorder, image_index);

        if let Err(e) = self.backend.submit(slot, image_index, recorder) {
            fatal(frame, &e);
        }
        self.state = FrameState::Submitted;

        match self.backend.present(slot, image_index) {
            Ok(PresentOutcome::Presented) => {}
            Ok(outcome) => {
                debug!("Present reported {:?}", outcome);
                self.recreate_surface = true;
            }
            Err(e) => {
                warn!("Frame {}: present failed: {}", frame, e);
                self.recreate_surface = true;
            }
        }
        self.state = FrameState::Presented;
        self.callbacks.run(FrameEvent::PostRender, &info);

        self.render_state.clear();
        self.accumulator.clear();
        self.frames.advance();
        self.stats.record_frame(&compile_stats, failures);
        self.finish_timing(frame);
        debug!(
            "Frame {} presented: {} draws, {} binds",
            frame, compile_stats.draws, compile_stats.binds
        );

        self.state = FrameState::Idle;
        true
    }

    fn finish_timing(&mut self, frame: u64) {
        if let Some(elapsed) = self.timer.end()
            && elapsed.as_millis() > self.config.slow_frame_threshold_ms as u128
        {
            warn!(
                "Frame {} took {:?} (average {:?})",
                frame,
                elapsed,
                self.timer.average()
            );
        }
    }

    /// Waits for the device to go idle and destroys all deferred garbage.
    ///
    /// A frame being recorded is dropped without submission.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.recorder = None;
        self.render_state.clear();
        self.accumulator.clear();
        self.timer.cancel();
        self.state = FrameState::Idle;

        self.backend.wait_idle()?;
        self.garbage.flush(&self.backend);
        self.shut_down = true;
        info!("Frame scheduler shut down after {} frames", self.frames.current());
        Ok(())
    }
}

impl<B: FrameBackend> Drop for FrameScheduler<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Frame scheduler shutdown failed: {}", e);
        }
    }
}

fn is_zero(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

fn scene_key<B: FrameBackend>(scene: &RenderScene<B>) -> SceneKey {
    SceneKey {
        order: scene.order(),
        id: scene.id(),
    }
}

fn check_scene_type<B: FrameBackend>(
    scene: &RenderScene<B>,
    pipeline: &RenderPipeline<B>,
) -> RenderResult<()> {
    if scene.scene_type().id() == pipeline.scene_type().id() {
        Ok(())
    } else {
        Err(RenderError::InvalidData(format!(
            "pipeline #{} was not created for the scene type of scene #{}",
            pipeline.id(),
            scene.id()
        )))
    }
}

/// The slot fence will never signal; every later frame would deadlock.
fn fatal(frame: u64, error: &RenderError) -> ! {
    error!("Frame {}: submission failed: {}", frame, error);
    std::process::abort()
}
