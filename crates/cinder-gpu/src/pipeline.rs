//! Pipeline creation and management.
//!
//! [`PipelineConfig`] is plain data; it is only translated into Vulkan
//! create-info structs inside [`Pipeline::new`]. Presets are transforms of
//! the default configuration.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use bytemuck::Pod;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Vertex buffer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

impl VertexBinding {
    fn to_vk(self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: self.binding,
            stride: self.stride,
            input_rate: self.input_rate,
        }
    }
}

/// Vertex attribute within a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

impl VertexAttribute {
    fn to_vk(self) -> vk::VertexInputAttributeDescription {
        vk::VertexInputAttributeDescription {
            location: self.location,
            binding: self.binding,
            format: self.format,
            offset: self.offset,
        }
    }
}

/// Blend state of one color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: vk::BlendFactor,
    pub dst_color_blend_factor: vk::BlendFactor,
    pub color_blend_op: vk::BlendOp,
    pub src_alpha_blend_factor: vk::BlendFactor,
    pub dst_alpha_blend_factor: vk::BlendFactor,
    pub alpha_blend_op: vk::BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl ColorBlendAttachment {
    /// Writes all channels without blending.
    pub const OPAQUE: Self = Self {
        blend_enable: false,
        src_color_blend_factor: vk::BlendFactor::ONE,
        dst_color_blend_factor: vk::BlendFactor::ZERO,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    };

    /// Standard "over" alpha blending.
    pub const ALPHA: Self = Self {
        blend_enable: true,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    };

    fn to_vk(self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: self.blend_enable.into(),
            src_color_blend_factor: self.src_color_blend_factor,
            dst_color_blend_factor: self.dst_color_blend_factor,
            color_blend_op: self.color_blend_op,
            src_alpha_blend_factor: self.src_alpha_blend_factor,
            dst_alpha_blend_factor: self.dst_alpha_blend_factor,
            alpha_blend_op: self.alpha_blend_op,
            color_write_mask: self.color_write_mask,
        }
    }
}

/// Constant depth bias, used against shadow acne.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

/// Fixed-function state of a graphics pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,

    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub depth_bias: Option<DepthBias>,

    /// Always one sample; multisampling is not supported.
    pub rasterization_samples: vk::SampleCountFlags,

    pub color_blend_attachments: Vec<ColorBlendAttachment>,

    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,

    pub dynamic_states: Vec<vk::DynamicState>,

    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,

    pub pipeline_layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            depth_bias: None,
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            color_blend_attachments: vec![ColorBlendAttachment::OPAQUE],
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS,
            dynamic_states: vec![
                vk::DynamicState::VIEWPORT,
                vk::DynamicState::SCISSOR,
                vk::DynamicState::CULL_MODE,
                vk::DynamicState::FRONT_FACE,
            ],
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            render_pass: vk::RenderPass::null(),
            subpass: 0,
        }
    }
}

impl PipelineConfig {
    /// Default configuration with `preset` applied.
    pub fn preset(preset: PipelinePreset) -> Self {
        let mut config = Self::default();
        preset.apply(&mut config);
        config
    }

    /// Target a render pass and layout.
    pub fn with_targets(mut self, render_pass: vk::RenderPass, layout: vk::PipelineLayout) -> Self {
        self.render_pass = render_pass;
        self.pipeline_layout = layout;
        self
    }

    /// Describe the vertex input.
    pub fn with_vertex_input(
        mut self,
        bindings: Vec<VertexBinding>,
        attributes: Vec<VertexAttribute>,
    ) -> Self {
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
        self
    }
}

/// Named fixed-function setups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelinePreset {
    /// Back-face culled, depth tested and written, no blending.
    Opaque,
    /// Double sided, depth tested but not written, alpha blended.
    Transparent,
    /// Front-face culled, depth biased, no color writes.
    Shadow,
    /// Fullscreen pass without depth.
    PostProcess,
    /// Drawn at the far plane behind everything else.
    Skybox,
    /// Line rasterization of triangle meshes.
    Wireframe,
    /// Line list debug boxes.
    BoundingBox,
    /// Screen-space UI on top of the scene.
    Overlay,
}

impl PipelinePreset {
    /// Every preset.
    pub const ALL: [Self; 8] = [
        Self::Opaque,
        Self::Transparent,
        Self::Shadow,
        Self::PostProcess,
        Self::Skybox,
        Self::Wireframe,
        Self::BoundingBox,
        Self::Overlay,
    ];

    /// Apply this preset on top of `config`.
    pub fn apply(self, config: &mut PipelineConfig) {
        match self {
            Self::Opaque => {
                config.cull_mode = vk::CullModeFlags::BACK;
                config.depth_test = true;
                config.depth_write = true;
                config.color_blend_attachments = vec![ColorBlendAttachment::OPAQUE];
            }
            Self::Transparent => {
                config.cull_mode = vk::CullModeFlags::NONE;
                config.depth_test = true;
                config.depth_write = false;
                config.color_blend_attachments = vec![ColorBlendAttachment::ALPHA];
            }
            Self::Shadow => {
                config.cull_mode = vk::CullModeFlags::FRONT;
                config.depth_test = true;
                config.depth_write = true;
                config.depth_bias = Some(DepthBias {
                    constant_factor: 1.25,
                    clamp: 0.0,
                    slope_factor: 1.75,
                });
                config.color_blend_attachments = vec![ColorBlendAttachment {
                    color_write_mask: vk::ColorComponentFlags::empty(),
                    ..ColorBlendAttachment::OPAQUE
                }];
            }
            Self::PostProcess => {
                config.cull_mode = vk::CullModeFlags::NONE;
                config.depth_test = false;
                config.depth_write = false;
                config.vertex_bindings.clear();
                config.vertex_attributes.clear();
            }
            Self::Skybox => {
                config.cull_mode = vk::CullModeFlags::NONE;
                config.depth_test = true;
                config.depth_write = false;
                config.depth_compare_op = vk::CompareOp::LESS_OR_EQUAL;
            }
            Self::Wireframe => {
                config.polygon_mode = vk::PolygonMode::LINE;
                config.cull_mode = vk::CullModeFlags::NONE;
            }
            Self::BoundingBox => {
                config.topology = vk::PrimitiveTopology::LINE_LIST;
                config.cull_mode = vk::CullModeFlags::NONE;
                config.depth_write = false;
                config.color_blend_attachments = vec![ColorBlendAttachment::ALPHA];
            }
            Self::Overlay => {
                config.cull_mode = vk::CullModeFlags::NONE;
                config.depth_test = false;
                config.depth_write = false;
                config.color_blend_attachments = vec![ColorBlendAttachment::ALPHA];
            }
        }
    }
}

/// Specialization constant values and their byte layout.
///
/// Values are packed back to back with no padding, so the host side must
/// match the shader's scalar layout exactly.
#[derive(Debug, Clone, Default)]
pub struct SpecializationConstants {
    data: Vec<u8>,
    entries: Vec<vk::SpecializationMapEntry>,
}

impl SpecializationConstants {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` for `constant_id`.
    pub fn push<T: Pod>(mut self, constant_id: u32, value: T) -> Self {
        let bytes = bytemuck::bytes_of(&value);
        self.entries.push(vk::SpecializationMapEntry {
            constant_id,
            offset: self.data.len() as u32,
            size: bytes.len(),
        });
        self.data.extend_from_slice(bytes);
        self
    }

    /// Packed constant bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Map entries into [`Self::data`].
    pub fn entries(&self) -> &[vk::SpecializationMapEntry] {
        &self.entries
    }

    /// Whether no constants were pushed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Vulkan view over the constants.
    pub fn info(&self) -> vk::SpecializationInfo<'_> {
        vk::SpecializationInfo::default()
            .map_entries(&self.entries)
            .data(&self.data)
    }
}

/// One programmable stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStage {
    /// Stage the module runs in.
    pub stage: vk::ShaderStageFlags,
    /// Path of the SPIR-V binary.
    pub path: PathBuf,
}

impl ShaderStage {
    /// Describe a stage loaded from `path`.
    pub fn new(stage: vk::ShaderStageFlags, path: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            path: path.into(),
        }
    }

    /// Vertex stage.
    pub fn vertex(path: impl Into<PathBuf>) -> Self {
        Self::new(vk::ShaderStageFlags::VERTEX, path)
    }

    /// Fragment stage.
    pub fn fragment(path: impl Into<PathBuf>) -> Self {
        Self::new(vk::ShaderStageFlags::FRAGMENT, path)
    }
}

/// Read a SPIR-V binary. A missing or empty file is an error.
pub fn load_shader(path: &Path) -> Result<Vec<u32>> {
    let shader_error = |reason: String| GpuError::ShaderLoad {
        path: path.to_path_buf(),
        reason,
    };

    let mut file = File::open(path).map_err(|e| shader_error(e.to_string()))?;
    let code = ash::util::read_spv(&mut file).map_err(|e| shader_error(e.to_string()))?;
    if code.is_empty() {
        return Err(shader_error("file is empty".to_string()));
    }

    tracing::debug!("Loaded shader {} ({} words)", path.display(), code.len());
    Ok(code)
}

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid and `code` must be valid SPIR-V.
unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let shader_info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&shader_info, None)
        .map_err(|e| GpuError::ShaderCompilation(e.to_string()))
}

/// Descriptor set layouts plus push-constant ranges.
///
/// Owned by whoever builds pipelines against it; pipelines only reference it.
pub struct PipelineLayout {
    device: Arc<Device>,
    layout: vk::PipelineLayout,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl PipelineLayout {
    /// Create a pipeline layout.
    pub fn new(
        device: &Arc<Device>,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = unsafe {
            device
                .handle()
                .create_pipeline_layout(&layout_info, None)
                .map_err(|e| GpuError::PipelineCreation(e.to_string()))?
        };

        Ok(Self {
            device: Arc::clone(device),
            layout,
            push_constant_ranges: push_constant_ranges.to_vec(),
        })
    }

    /// Raw layout handle.
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Push-constant ranges in declaration order.
    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }

    /// Record a push-constant update for range `range_index`.
    pub fn push_constants(&self, cmd: vk::CommandBuffer, range_index: usize, bytes: &[u8]) {
        let Some(range) = self.push_constant_ranges.get(range_index) else {
            debug_assert!(false, "push-constant range {range_index} out of bounds");
            return;
        };
        debug_assert!(
            bytes.len() <= range.size as usize,
            "push-constant data larger than range {range_index}"
        );
        unsafe {
            self.device.handle().cmd_push_constants(
                cmd,
                self.layout,
                range.stage_flags,
                range.offset,
                bytes,
            );
        }
    }

    /// Record a push-constant update from a plain-old-data value.
    pub fn push_value<T: Pod>(&self, cmd: vk::CommandBuffer, range_index: usize, value: &T) {
        self.push_constants(cmd, range_index, bytemuck::bytes_of(value));
    }

    /// Bind descriptor sets starting at `first_set`.
    pub fn bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                self.layout,
                first_set,
                sets,
                dynamic_offsets,
            );
        }
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Graphics pipeline with the shader modules it was built from.
pub struct Pipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    shader_modules: Vec<vk::ShaderModule>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Build a graphics pipeline from shader files and `config`.
    ///
    /// `config` must name a pipeline layout and render pass.
    pub fn new(
        device: &Arc<Device>,
        stages: &[ShaderStage],
        config: &PipelineConfig,
        specialization: Option<&SpecializationConstants>,
    ) -> Result<Self> {
        debug_assert!(
            config.pipeline_layout != vk::PipelineLayout::null(),
            "pipeline config has no layout"
        );
        debug_assert!(
            config.render_pass != vk::RenderPass::null(),
            "pipeline config has no render pass"
        );
        if config.pipeline_layout == vk::PipelineLayout::null()
            || config.render_pass == vk::RenderPass::null()
        {
            return Err(GpuError::PipelineCreation(
                "missing pipeline layout or render pass".to_string(),
            ));
        }

        let code = stages
            .iter()
            .map(|stage| load_shader(&stage.path))
            .collect::<Result<Vec<_>>>()?;

        let raw = device.handle();
        let mut shader_modules = Vec::with_capacity(code.len());
        for words in &code {
            match unsafe { create_shader_module(raw, words) } {
                Ok(module) => shader_modules.push(module),
                Err(e) => {
                    destroy_modules(raw, &shader_modules);
                    return Err(e);
                }
            }
        }

        let specialization_info = specialization
            .filter(|constants| !constants.is_empty())
            .map(SpecializationConstants::info);

        let shader_stages: Vec<vk::PipelineShaderStageCreateInfo> = stages
            .iter()
            .zip(&shader_modules)
            .map(|(stage, &module)| {
                let info = vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(module)
                    .name(c"main");
                match specialization_info.as_ref() {
                    Some(spec) => info.specialization_info(spec),
                    None => info,
                }
            })
            .collect();

        let vertex_bindings: Vec<_> = config.vertex_bindings.iter().map(|b| b.to_vk()).collect();
        let vertex_attributes: Vec<_> =
            config.vertex_attributes.iter().map(|a| a.to_vk()).collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(config.primitive_restart);

        // Viewport (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let bias = config.depth_bias;
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .line_width(config.line_width)
            .depth_bias_enable(bias.is_some())
            .depth_bias_constant_factor(bias.map_or(0.0, |b| b.constant_factor))
            .depth_bias_clamp(bias.map_or(0.0, |b| b.clamp))
            .depth_bias_slope_factor(bias.map_or(0.0, |b| b.slope_factor));

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(config.rasterization_samples)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare_op)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments: Vec<_> = config
            .color_blend_attachments
            .iter()
            .map(|a| a.to_vk())
            .collect();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&config.dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(config.pipeline_layout)
            .render_pass(config.render_pass)
            .subpass(config.subpass);

        let pipelines = unsafe {
            raw.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_pipelines, e)) => {
                destroy_modules(raw, &shader_modules);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        tracing::debug!("Graphics pipeline created with {} stage(s)", stages.len());

        Ok(Self {
            device: Arc::clone(device),
            pipeline,
            shader_modules,
            config: config.clone(),
        })
    }

    /// Record a bind of this pipeline.
    pub fn bind(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device.handle().cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline,
            );
        }
    }

    /// Raw pipeline handle.
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Configuration the pipeline was built from.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let raw = self.device.handle();
        destroy_modules(raw, &self.shader_modules);
        unsafe { raw.destroy_pipeline(self.pipeline, None) };
    }
}

fn destroy_modules(device: &ash::Device, modules: &[vk::ShaderModule]) {
    for &module in modules {
        unsafe { device.destroy_shader_module(module, None) };
    }
}

/// Change the cull mode of subsequent draws.
pub fn set_cull_mode(device: &Device, cmd: vk::CommandBuffer, cull_mode: vk::CullModeFlags) {
    unsafe { device.handle().cmd_set_cull_mode(cmd, cull_mode) };
}

/// Change the winding of subsequent draws.
pub fn set_front_face(device: &Device, cmd: vk::CommandBuffer, front_face: vk::FrontFace) {
    unsafe { device.handle().cmd_set_front_face(cmd, front_face) };
}

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    shader_module: vk::ShaderModule,
}

impl ComputePipeline {
    /// Create a compute pipeline from a shader file.
    pub fn new(
        device: &Arc<Device>,
        shader_path: &Path,
        layout: &PipelineLayout,
        specialization: Option<&SpecializationConstants>,
    ) -> Result<Self> {
        let code = load_shader(shader_path)?;
        let raw = device.handle();
        let shader_module = unsafe { create_shader_module(raw, &code)? };

        let specialization_info = specialization
            .filter(|constants| !constants.is_empty())
            .map(SpecializationConstants::info);

        let mut stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(c"main");
        if let Some(spec) = specialization_info.as_ref() {
            stage_info = stage_info.specialization_info(spec);
        }

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout.handle());

        let pipeline = match unsafe {
            raw.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        } {
            Ok(pipelines) => pipelines[0],
            Err((_pipelines, e)) => {
                destroy_modules(raw, &[shader_module]);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        Ok(Self {
            device: Arc::clone(device),
            pipeline,
            shader_module,
        })
    }

    /// Record a bind of this pipeline.
    pub fn bind(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device.handle().cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline,
            );
        }
    }

    /// Record a dispatch.
    pub fn dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.handle().cmd_dispatch(cmd, x, y, z) };
    }

    /// Raw pipeline handle.
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        let raw = self.device.handle();
        destroy_modules(raw, &[self.shader_module]);
        unsafe { raw.destroy_pipeline(self.pipeline, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn opaque_preset_is_deterministic() {
        let mut a = PipelineConfig::default();
        let mut b = PipelineConfig::default();
        PipelinePreset::Opaque.apply(&mut a);
        PipelinePreset::Opaque.apply(&mut b);
        assert_eq!(a, b);
        assert_eq!(a, PipelineConfig::preset(PipelinePreset::Opaque));
    }

    #[test]
    fn presets_are_distinct() {
        for (i, a) in PipelinePreset::ALL.iter().enumerate() {
            for b in &PipelinePreset::ALL[i + 1..] {
                assert_ne!(
                    PipelineConfig::preset(*a),
                    PipelineConfig::preset(*b),
                    "{a:?} and {b:?} produce the same state"
                );
            }
        }
    }

    #[test]
    fn transparent_blends_without_depth_writes() {
        let config = PipelineConfig::preset(PipelinePreset::Transparent);
        assert_eq!(config.cull_mode, vk::CullModeFlags::NONE);
        assert!(config.depth_test);
        assert!(!config.depth_write);
        assert!(config.color_blend_attachments[0].blend_enable);
    }

    #[test]
    fn shadow_disables_color_writes() {
        let config = PipelineConfig::preset(PipelinePreset::Shadow);
        assert_eq!(config.cull_mode, vk::CullModeFlags::FRONT);
        assert!(config
            .color_blend_attachments
            .iter()
            .all(|a| a.color_write_mask.is_empty()));
        let bias = config.depth_bias.unwrap();
        assert_relative_eq!(bias.constant_factor, 1.25);
    }

    #[test]
    fn defaults_are_single_sample_with_dynamic_winding() {
        let config = PipelineConfig::default();
        assert_eq!(config.rasterization_samples, vk::SampleCountFlags::TYPE_1);
        assert_relative_eq!(config.line_width, 1.0);
        for state in [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::CULL_MODE,
            vk::DynamicState::FRONT_FACE,
        ] {
            assert!(config.dynamic_states.contains(&state));
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct Pair {
        a: u32,
        b: f32,
    }

    #[test]
    fn specialization_entries_are_byte_exact() {
        let constants = SpecializationConstants::new()
            .push(0, 7u32)
            .push(1, 2.5f32)
            .push(2, Pair { a: 1, b: 0.5 });

        let entries = constants.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!((entries[0].offset, entries[0].size), (0, 4));
        assert_eq!((entries[1].offset, entries[1].size), (4, 4));
        assert_eq!((entries[2].offset, entries[2].size), (8, 8));
        assert_eq!(constants.data().len(), 16);
        assert_eq!(&constants.data()[0..4], &7u32.to_ne_bytes());
        assert_eq!(&constants.data()[4..8], &2.5f32.to_ne_bytes());

        let info = constants.info();
        assert_eq!(info.map_entry_count, 3);
        assert_eq!(info.data_size, 16);
    }

    #[test]
    fn missing_shader_is_an_error() {
        let path = std::env::temp_dir().join("cinder-missing-shader.spv");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(
            load_shader(&path),
            Err(GpuError::ShaderLoad { .. })
        ));
    }

    #[test]
    fn empty_shader_is_an_error() {
        let path = std::env::temp_dir().join("cinder-empty-shader.spv");
        File::create(&path).unwrap();
        assert!(matches!(
            load_shader(&path),
            Err(GpuError::ShaderLoad { .. })
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn shader_words_are_read() {
        let path = std::env::temp_dir().join("cinder-words-shader.spv");
        let words = [0x0723_0203u32, 0x0001_0000, 0, 1];
        {
            let mut file = File::create(&path).unwrap();
            for word in words {
                file.write_all(&word.to_le_bytes()).unwrap();
            }
        }
        assert_eq!(load_shader(&path).unwrap(), words.to_vec());
        let _ = std::fs::remove_file(&path);
    }
}
