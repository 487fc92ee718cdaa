//! Graphics pipeline and pipeline layout creation.
//!
//! Pipelines are built for dynamic rendering (Vulkan 1.3) with dynamic
//! viewport and scissor. Shaders arrive as SPIR-V words; the modules only
//! live for the duration of pipeline creation.
//!
//! # Overview
//!
//! - [`MaterialConfig`] holds the fixed-function state a material may vary
//! - [`GraphicsPipelineDesc`] is everything needed to build one pipeline
//! - [`create_pipeline_layout`] / [`create_graphics_pipeline`] return raw
//!   handles; the caller decides when they are destroyed
//!
//! # Example
//!
//! ```no_run
//! use ash::vk;
//! use vkframe_rhi::device::Device;
//! use vkframe_rhi::pipeline::{self, GraphicsPipelineDesc, MaterialConfig};
//!
//! # fn example(device: &Device, set_layouts: &[vk::DescriptorSetLayout], vs: &[u32], fs: &[u32]) -> Result<(), vkframe_rhi::RhiError> {
//! let layout = pipeline::create_pipeline_layout(device, set_layouts)?;
//! let desc = GraphicsPipelineDesc {
//!     vertex_spirv: vs,
//!     fragment_spirv: fs,
//!     vertex_bindings: &[],
//!     vertex_attributes: &[],
//!     color_format: vk::Format::B8G8R8A8_SRGB,
//!     depth_format: None,
//!     material: MaterialConfig::default(),
//! };
//! let pipeline = pipeline::create_graphics_pipeline(device, &desc, layout)?;
//! # Ok(())
//! # }
//! ```

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// SPIR-V magic number, first word of every module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

const ENTRY_POINT: &CStr = c"main";

/// Face culling mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    /// No culling
    None,
    /// Cull front faces
    Front,
    /// Cull back faces
    #[default]
    Back,
}

impl CullMode {
    /// Converts to Vulkan cull mode flags.
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
        }
    }
}

/// Color blending applied to the single color attachment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Source replaces destination
    #[default]
    Opaque,
    /// Standard alpha blending: `src * a + dst * (1 - a)`
    Alpha,
    /// Source added onto destination
    Additive,
}

impl BlendMode {
    /// Builds the color blend attachment state for this mode.
    pub fn to_vk(self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);

        match self {
            BlendMode::Opaque => state.blend_enable(false),
            BlendMode::Alpha => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD),
            BlendMode::Additive => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD),
        }
    }
}

/// Fixed-function state a material chooses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MaterialConfig {
    /// Face culling.
    pub cull_mode: CullMode,
    /// Color blending.
    pub blend: BlendMode,
    /// Enable depth testing (ignored without a depth attachment).
    pub depth_test: bool,
    /// Enable depth writes (ignored without a depth attachment).
    pub depth_write: bool,
}

impl Default for MaterialConfig {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::Back,
            blend: BlendMode::Opaque,
            depth_test: true,
            depth_write: true,
        }
    }
}

impl MaterialConfig {
    /// Alpha-blended, no depth writes, no culling.
    pub fn transparent() -> Self {
        Self {
            cull_mode: CullMode::None,
            blend: BlendMode::Alpha,
            depth_test: true,
            depth_write: false,
        }
    }
}

/// Everything needed to build one graphics pipeline.
#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineDesc<'a> {
    /// Vertex stage SPIR-V, entry point `main`.
    pub vertex_spirv: &'a [u32],
    /// Fragment stage SPIR-V, entry point `main`.
    pub fragment_spirv: &'a [u32],
    /// Vertex input bindings.
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    /// Vertex input attributes.
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    /// Format of the color attachment rendered into.
    pub color_format: vk::Format,
    /// Format of the depth attachment, if any.
    pub depth_format: Option<vk::Format>,
    /// Material fixed-function state.
    pub material: MaterialConfig,
}

/// Checks that `words` look like a SPIR-V module.
///
/// # Errors
///
/// Returns [`RhiError::ShaderError`] for an empty module or a wrong magic number.
pub fn validate_spirv(words: &[u32]) -> RhiResult<()> {
    match words.first() {
        None => Err(RhiError::ShaderError("SPIR-V module is empty".to_string())),
        Some(&SPIRV_MAGIC) => Ok(()),
        Some(magic) => Err(RhiError::ShaderError(format!(
            "Invalid SPIR-V magic number: {:#010x}",
            magic
        ))),
    }
}

fn create_shader_module(device: &Device, words: &[u32]) -> RhiResult<vk::ShaderModule> {
    validate_spirv(words)?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(words);
    let module = unsafe { device.handle().create_shader_module(&create_info, None)? };
    Ok(module)
}

/// Creates a pipeline layout from descriptor set layouts, in set order.
///
/// # Errors
///
/// Returns an error if pipeline layout creation fails.
pub fn create_pipeline_layout(
    device: &Device,
    set_layouts: &[vk::DescriptorSetLayout],
) -> RhiResult<vk::PipelineLayout> {
    let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);

    let layout = unsafe { device.handle().create_pipeline_layout(&create_info, None)? };

    debug!(
        "Created pipeline layout with {} descriptor set layout(s)",
        set_layouts.len()
    );

    Ok(layout)
}

/// Builds a graphics pipeline.
///
/// # Errors
///
/// Returns an error if a shader module is invalid or pipeline creation fails.
pub fn create_graphics_pipeline(
    device: &Device,
    desc: &GraphicsPipelineDesc<'_>,
    layout: vk::PipelineLayout,
) -> RhiResult<vk::Pipeline> {
    let vertex_module = create_shader_module(device, desc.vertex_spirv)?;
    let fragment_module = match create_shader_module(device, desc.fragment_spirv) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.handle().destroy_shader_module(vertex_module, None) };
            return Err(e);
        }
    };

    let result = build_pipeline(device, desc, layout, vertex_module, fragment_module);

    // Modules are only needed during creation
    unsafe {
        device.handle().destroy_shader_module(vertex_module, None);
        device.handle().destroy_shader_module(fragment_module, None);
    }

    result
}

fn build_pipeline(
    device: &Device,
    desc: &GraphicsPipelineDesc<'_>,
    layout: vk::PipelineLayout,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
) -> RhiResult<vk::Pipeline> {
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(ENTRY_POINT),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(ENTRY_POINT),
    ];

    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(desc.vertex_bindings)
        .vertex_attribute_descriptions(desc.vertex_attributes);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

    // Viewport and scissor are dynamic
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(desc.material.cull_mode.to_vk())
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let has_depth = desc.depth_format.is_some();
    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(has_depth && desc.material.depth_test)
        .depth_write_enable(has_depth && desc.material.depth_write)
        .depth_compare_op(vk::CompareOp::LESS);

    let color_blend_attachments = [desc.material.blend.to_vk()];
    let color_blend_state =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats = [desc.color_format];
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
    if let Some(depth_format) = desc.depth_format {
        rendering_info = rendering_info.depth_attachment_format(depth_format);
    }

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipeline = unsafe {
        device
            .handle()
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, result)| result)?[0]
    };

    info!(
        "Graphics pipeline created ({:?}, {:?})",
        desc.material.cull_mode, desc.material.blend
    );

    Ok(pipeline)
}

/// Destroys a pipeline and its layout.
pub fn destroy_pipeline(device: &Device, pipeline: vk::Pipeline, layout: vk::PipelineLayout) {
    unsafe {
        device.handle().destroy_pipeline(pipeline, None);
        device.handle().destroy_pipeline_layout(layout, None);
    }
    debug!("Graphics pipeline destroyed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cull_mode_to_vk() {
        assert_eq!(CullMode::None.to_vk(), vk::CullModeFlags::NONE);
        assert_eq!(CullMode::Front.to_vk(), vk::CullModeFlags::FRONT);
        assert_eq!(CullMode::Back.to_vk(), vk::CullModeFlags::BACK);
    }

    #[test]
    fn test_blend_mode_to_vk() {
        let opaque = BlendMode::Opaque.to_vk();
        assert_eq!(opaque.blend_enable, vk::FALSE);
        assert_eq!(opaque.color_write_mask, vk::ColorComponentFlags::RGBA);

        let alpha = BlendMode::Alpha.to_vk();
        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(
            alpha.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );

        let additive = BlendMode::Additive.to_vk();
        assert_eq!(additive.dst_color_blend_factor, vk::BlendFactor::ONE);
    }

    #[test]
    fn test_material_config_defaults() {
        let config = MaterialConfig::default();
        assert_eq!(config.cull_mode, CullMode::Back);
        assert_eq!(config.blend, BlendMode::Opaque);
        assert!(config.depth_test && config.depth_write);

        let transparent = MaterialConfig::transparent();
        assert_eq!(transparent.blend, BlendMode::Alpha);
        assert!(!transparent.depth_write);
    }

    #[test]
    fn test_validate_spirv() {
        assert!(validate_spirv(&[SPIRV_MAGIC, 0x0001_0000]).is_ok());
        assert!(matches!(validate_spirv(&[]), Err(RhiError::ShaderError(_))));
        assert!(matches!(
            validate_spirv(&[0xdead_beef]),
            Err(RhiError::ShaderError(_))
        ));
    }
}
