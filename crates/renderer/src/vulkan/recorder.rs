//! Command recorder over a Vulkan command buffer.

use ash::vk;
use vkframe_rhi::command::CommandBuffer;

use crate::device::CommandRecorder;
use crate::resource::BufferBinding;

/// Records into the command buffer of one frame slot.
pub struct VulkanRecorder {
    buffer: CommandBuffer,
}

impl VulkanRecorder {
    pub(crate) fn new(buffer: CommandBuffer) -> Self {
        Self { buffer }
    }

    /// The command buffer being recorded.
    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.buffer
    }
}

impl CommandRecorder for VulkanRecorder {
    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.buffer.bind_graphics_pipeline(pipeline);
    }

    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, index: u32, set: vk::DescriptorSet) {
        self.buffer.bind_descriptor_set(layout, index, set);
    }

    fn bind_vertex_buffer(&mut self, binding: BufferBinding) {
        self.buffer.bind_vertex_buffer(binding.buffer, binding.offset);
    }

    fn bind_index_buffer(&mut self, binding: BufferBinding, index_type: vk::IndexType) {
        self.buffer
            .bind_index_buffer(binding.buffer, binding.offset, index_type);
    }

    fn set_scissor(&mut self, rect: vk::Rect2D) {
        self.buffer.set_scissor(&rect);
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32) {
        self.buffer
            .draw_indexed(index_count, 1, first_index, vertex_offset, 0);
    }
}
