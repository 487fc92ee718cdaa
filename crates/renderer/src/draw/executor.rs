//! Replays compiled draw commands.

use crate::device::CommandRecorder;
use crate::draw::GpuCommand;

/// Records `commands` in order.
pub fn execute<R: CommandRecorder + ?Sized>(commands: &[GpuCommand], recorder: &mut R) {
    for command in commands {
        match *command {
            GpuCommand::BindPipeline(pipeline) => recorder.bind_pipeline(pipeline),
            GpuCommand::BindDescriptorSet { layout, index, set } => {
                recorder.bind_descriptor_set(layout, index, set)
            }
            GpuCommand::BindVertexBuffer(binding) => recorder.bind_vertex_buffer(binding),
            GpuCommand::BindIndexBuffer(binding, index_type) => {
                recorder.bind_index_buffer(binding, index_type)
            }
            GpuCommand::SetScissor(rect) => recorder.set_scissor(rect),
            GpuCommand::DrawIndexed {
                index_count,
                first_index,
                vertex_offset,
            } => recorder.draw_indexed(index_count, first_index, vertex_offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::{self, Handle};

    use super::*;
    use crate::testing::MockRecorder;

    #[test]
    fn test_commands_replayed_in_order() {
        let commands = vec![
            GpuCommand::BindPipeline(vk::Pipeline::from_raw(1)),
            GpuCommand::BindDescriptorSet {
                layout: vk::PipelineLayout::from_raw(2),
                index: 1,
                set: vk::DescriptorSet::from_raw(3),
            },
            GpuCommand::DrawIndexed {
                index_count: 36,
                first_index: 0,
                vertex_offset: 0,
            },
        ];

        let mut recorder = MockRecorder::default();
        execute(&commands, &mut recorder);
        assert_eq!(recorder.commands, commands);
    }
}
