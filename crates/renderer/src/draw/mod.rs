//! Draw recording.
//!
//! Draws reach the scheduler in two forms. Instanced draws name the complete
//! state of one draw; explicit command lists switch state step by step. Both
//! are resolved to plain handles when submitted, accumulated for the frame,
//! then compiled into a [`GpuCommand`] stream that skips every bind of state
//! that is already bound.

mod accumulator;
mod executor;

use std::sync::Arc;

use ash::vk;

pub use accumulator::{CompileStats, DrawAccumulator, InstancedDraw, ResolvedPipeline, SceneKey};
pub use executor::execute;

use crate::binding::BindingData;
use crate::device::GpuDevice;
use crate::pipeline::RenderPipeline;
use crate::render_state::FrameRenderState;
use crate::resource::{BufferBinding, GeometryBuffer, RenderResource};

/// Descriptor set index of scene bindings.
pub const SCENE_SET: u32 = 0;
/// Descriptor set index of material bindings.
pub const MATERIAL_SET: u32 = 1;
/// Descriptor set index of instance bindings.
pub const INSTANCE_SET: u32 = 2;

/// One step of an explicit command list.
pub enum DrawCommand<D: GpuDevice> {
    /// Use `pipeline` for following draws.
    SwitchPipeline(Arc<RenderPipeline<D>>),
    /// Use the buffer as vertex input.
    SwitchVertexBuffer(Arc<dyn GeometryBuffer>),
    /// Use the buffer as index input.
    SwitchIndexBuffer(Arc<dyn GeometryBuffer>),
    /// Use material binding data (set 1).
    SwitchMaterialData(Arc<BindingData<D>>),
    /// Use instance binding data (set 2).
    SwitchInstanceData(Arc<BindingData<D>>),
    /// Restrict following draws to a rectangle.
    SetScissor(vk::Rect2D),
    /// Draw with the current state.
    Draw {
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    /// Forget all current state.
    Reset,
}

/// A draw command reduced to handles for one frame slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedCommand {
    Pipeline(ResolvedPipeline),
    VertexBuffer(BufferBinding),
    IndexBuffer(BufferBinding, vk::IndexType),
    MaterialSet(vk::DescriptorSet),
    InstanceSet(vk::DescriptorSet),
    Scissor(vk::Rect2D),
    Draw {
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    Reset,
}

impl<D: GpuDevice> DrawCommand<D> {
    /// Resolves the command for `state`'s frame slot and registers the
    /// resources it references as participants of the frame.
    pub fn resolve(&self, state: &mut FrameRenderState) -> ResolvedCommand {
        let slot = state.slot();
        match self {
            DrawCommand::SwitchPipeline(pipeline) => {
                ResolvedCommand::Pipeline(ResolvedPipeline::of(pipeline))
            }
            DrawCommand::SwitchVertexBuffer(buffer) => {
                state.add_participant(buffer.clone() as Arc<dyn RenderResource>);
                ResolvedCommand::VertexBuffer(buffer.binding(slot))
            }
            DrawCommand::SwitchIndexBuffer(buffer) => {
                state.add_participant(buffer.clone() as Arc<dyn RenderResource>);
                ResolvedCommand::IndexBuffer(buffer.binding(slot), buffer.index_type())
            }
            DrawCommand::SwitchMaterialData(data) => {
                state.add_participant(data.clone());
                ResolvedCommand::MaterialSet(data.descriptor_set(slot))
            }
            DrawCommand::SwitchInstanceData(data) => {
                state.add_participant(data.clone());
                ResolvedCommand::InstanceSet(data.descriptor_set(slot))
            }
            DrawCommand::SetScissor(rect) => ResolvedCommand::Scissor(*rect),
            DrawCommand::Draw {
                index_count,
                first_index,
                vertex_offset,
            } => ResolvedCommand::Draw {
                index_count: *index_count,
                first_index: *first_index,
                vertex_offset: *vertex_offset,
            },
            DrawCommand::Reset => ResolvedCommand::Reset,
        }
    }
}

/// A command for the command recorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuCommand {
    BindPipeline(vk::Pipeline),
    BindDescriptorSet {
        layout: vk::PipelineLayout,
        index: u32,
        set: vk::DescriptorSet,
    },
    BindVertexBuffer(BufferBinding),
    BindIndexBuffer(BufferBinding, vk::IndexType),
    SetScissor(vk::Rect2D),
    DrawIndexed {
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
}

impl GpuCommand {
    /// Returns true for state changes, false for draws.
    pub fn is_bind(&self) -> bool {
        !matches!(self, GpuCommand::DrawIndexed { .. })
    }
}
