//! Binding layouts.

use std::collections::HashSet;

use ash::vk;
use vkframe_rhi::descriptor::DescriptorBindingBuilder;

use crate::error::{RenderError, RenderResult};

/// What a binding holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// A combined image sampler.
    Texture,
    /// A block of uniform values of `size` bytes.
    Constants { size: u32 },
}

impl BindingKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            BindingKind::Texture => "texture",
            BindingKind::Constants { .. } => "constants",
        }
    }
}

/// One binding of a layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingDesc {
    /// Binding number in the shader.
    pub binding: u32,
    /// Contents.
    pub kind: BindingKind,
    /// Stages that read the binding.
    pub stages: vk::ShaderStageFlags,
}

impl BindingDesc {
    /// A texture binding.
    pub fn texture(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            kind: BindingKind::Texture,
            stages,
        }
    }

    /// A uniform value binding of `size` bytes.
    pub fn constants(binding: u32, size: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            kind: BindingKind::Constants { size },
            stages,
        }
    }
}

/// Rounds `value` up to a multiple of `alignment`.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Validated list of bindings with the placement of their uniform values.
///
/// All constant bindings of one binding data share a block of `stride`
/// bytes; each binding's values start at an offset aligned to the device's
/// uniform offset alignment.
#[derive(Clone, Debug)]
pub struct BindingLayout {
    descs: Vec<BindingDesc>,
    offsets: Vec<Option<u64>>,
    stride: u64,
}

impl BindingLayout {
    /// Validates `descs` and computes value offsets for `alignment`.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate binding numbers or zero-sized
    /// constant bindings.
    pub fn new(descs: Vec<BindingDesc>, alignment: u64) -> RenderResult<Self> {
        let mut seen = HashSet::new();
        let mut offsets = Vec::with_capacity(descs.len());
        let mut stride = 0;

        for desc in &descs {
            if !seen.insert(desc.binding) {
                return Err(RenderError::DuplicateBinding(desc.binding));
            }
            match desc.kind {
                BindingKind::Texture => offsets.push(None),
                BindingKind::Constants { size: 0 } => {
                    return Err(RenderError::EmptyConstants(desc.binding));
                }
                BindingKind::Constants { size } => {
                    offsets.push(Some(stride));
                    stride += align_up(size as u64, alignment);
                }
            }
        }

        Ok(Self {
            descs,
            offsets,
            stride,
        })
    }

    /// A layout without bindings.
    pub fn empty() -> Self {
        Self {
            descs: Vec::new(),
            offsets: Vec::new(),
            stride: 0,
        }
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// Returns true if the layout has no bindings.
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Bindings in declaration order.
    pub fn descs(&self) -> &[BindingDesc] {
        &self.descs
    }

    /// Binding at `index`.
    pub fn desc(&self, index: usize) -> RenderResult<&BindingDesc> {
        self.descs.get(index).ok_or(RenderError::BindingIndex {
            index,
            len: self.descs.len(),
        })
    }

    /// Offset of the values of binding `index` within the block.
    pub fn value_offset(&self, index: usize) -> Option<u64> {
        self.offsets.get(index).copied().flatten()
    }

    /// Bytes of uniform storage one binding data needs per frame slot.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Returns true if any binding holds uniform values.
    pub fn has_values(&self) -> bool {
        self.stride > 0
    }

    /// Vulkan bindings for the descriptor set layout.
    pub fn vk_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.descs
            .iter()
            .map(|desc| match desc.kind {
                BindingKind::Texture => {
                    DescriptorBindingBuilder::combined_image_sampler(desc.binding, desc.stages)
                }
                BindingKind::Constants { .. } => {
                    DescriptorBindingBuilder::uniform_buffer(desc.binding, desc.stages)
                }
            })
            .collect()
    }
}
