//! Viewer application.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use cinder_app::{AppContext, CinderApp, FrameContext};
use cinder_gpu::descriptors::DescriptorWriter;
use cinder_gpu::pipeline::{set_cull_mode, set_front_face, VertexAttribute, VertexBinding};
use cinder_gpu::{
    Buffer, BufferDesc, DescriptorMode, DescriptorPool, DescriptorPoolBuilder,
    DescriptorSetLayout, DescriptorSetLayoutBuilder, Device, MemoryLocation, Pipeline,
    PipelineConfig, PipelineLayout, PipelinePreset, ShaderStage,
};
use glam::Vec4;
use tracing::{info, warn};

const VERTEX_SHADER: &str = "triangle.vert.spv";
const BINDLESS_VERTEX_SHADER: &str = "triangle_bindless.vert.spv";
const FRAGMENT_SHADER: &str = "triangle.frag.spv";

/// Slots in the bindless frame-data array; one is used per set.
const BINDLESS_FRAME_CAPACITY: u32 = 4;

/// Seconds between vertex palette swaps.
const PALETTE_PERIOD: f32 = 2.0;

const PALETTES: [[[f32; 3]; 3]; 2] = [
    [[1.0, 0.2, 0.2], [0.2, 1.0, 0.2], [0.2, 0.2, 1.0]],
    [[1.0, 0.8, 0.1], [0.1, 0.8, 1.0], [0.9, 0.1, 0.9]],
];

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FrameUbo {
    tint: Vec4,
    time: f32,
    _pad: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Push {
    offset: [f32; 2],
    scale: f32,
    _pad: f32,
}

fn triangle(palette: usize) -> [Vertex; 3] {
    let colors = PALETTES[palette % PALETTES.len()];
    [
        Vertex {
            position: [0.0, -0.5],
            color: colors[0],
        },
        Vertex {
            position: [0.5, 0.5],
            color: colors[1],
        },
        Vertex {
            position: [-0.5, 0.5],
            color: colors[2],
        },
    ]
}

fn palette_at(time: f32) -> usize {
    (time / PALETTE_PERIOD) as usize % PALETTES.len()
}

/// Palette to switch to at `time`, if it differs from `current`.
fn next_palette(current: usize, time: f32) -> Option<usize> {
    let palette = palette_at(time);
    (palette != current).then_some(palette)
}

/// How per-frame data reaches the vertex shader in one descriptor mode.
struct FrameBinding {
    layout: DescriptorSetLayoutBuilder,
    pool: DescriptorPoolBuilder,
    usage: vk::BufferUsageFlags,
    vertex_shader: &'static str,
}

impl FrameBinding {
    fn for_mode(mode: DescriptorMode, frames: u32) -> Self {
        match mode {
            DescriptorMode::Bindless => Self {
                layout: DescriptorSetLayoutBuilder::new()
                    .add_bindless_binding(
                        0,
                        vk::DescriptorType::STORAGE_BUFFER,
                        vk::ShaderStageFlags::VERTEX,
                        BINDLESS_FRAME_CAPACITY,
                        1,
                    )
                    .update_after_bind(true),
                pool: DescriptorPoolBuilder::new()
                    .max_sets(frames)
                    .add_pool_size(vk::DescriptorType::STORAGE_BUFFER, frames)
                    .update_after_bind(true),
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                vertex_shader: BINDLESS_VERTEX_SHADER,
            },
            DescriptorMode::Classic => Self {
                layout: DescriptorSetLayoutBuilder::new()
                    .uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
                pool: DescriptorPoolBuilder::new()
                    .max_sets(frames)
                    .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, frames),
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                vertex_shader: VERTEX_SHADER,
            },
        }
    }

    fn offset_alignment(&self, limits: &vk::PhysicalDeviceLimits) -> u64 {
        if self.usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            limits.min_storage_buffer_offset_alignment
        } else {
            limits.min_uniform_buffer_offset_alignment
        }
    }
}

/// GPU objects needed to draw the triangle.
struct TriangleScene {
    pipeline: Pipeline,
    pipeline_layout: PipelineLayout,
    frame_sets: Vec<vk::DescriptorSet>,
    uniforms: Buffer,
    vertices: Buffer,
    palette: usize,
    _pool: DescriptorPool,
    _set_layout: DescriptorSetLayout,
}

impl TriangleScene {
    fn new(ctx: &AppContext, mode: DescriptorMode) -> anyhow::Result<Self> {
        let device = &ctx.device;
        let frames = ctx.frames_in_flight() as u32;

        let binding = FrameBinding::for_mode(mode, frames);
        info!("Descriptor mode: {mode:?}, frame data as {:?}", binding.usage);

        let set_layout = binding.layout.build(device)?;
        let mut pool = binding.pool.build(device)?;

        let uniforms = Buffer::new(
            device,
            &BufferDesc::of::<FrameUbo>(
                "frame uniforms",
                frames,
                binding.usage,
                MemoryLocation::CpuToGpu,
            )
            .with_alignment(binding.offset_alignment(device.limits()))
            .persistent(true),
        )?;

        let frame_sets = (0..frames)
            .map(|i| {
                DescriptorWriter::new(&set_layout, &mut pool)
                    .write_buffer(0, uniforms.descriptor_info_for_index(i))
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let pipeline_layout = PipelineLayout::new(
            device,
            &[set_layout.handle()],
            &[vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: std::mem::size_of::<Push>() as u32,
            }],
        )?;

        let config = PipelineConfig::preset(PipelinePreset::Opaque)
            .with_targets(ctx.renderer.swap_chain_render_pass(), pipeline_layout.handle())
            .with_vertex_input(
                vec![VertexBinding {
                    binding: 0,
                    stride: std::mem::size_of::<Vertex>() as u32,
                    input_rate: vk::VertexInputRate::VERTEX,
                }],
                vec![
                    VertexAttribute {
                        location: 0,
                        binding: 0,
                        format: vk::Format::R32G32_SFLOAT,
                        offset: 0,
                    },
                    VertexAttribute {
                        location: 1,
                        binding: 0,
                        format: vk::Format::R32G32B32_SFLOAT,
                        offset: 8,
                    },
                ],
            );

        let pipeline = Pipeline::new(
            device,
            &[
                ShaderStage::vertex(ctx.config.shader_path(binding.vertex_shader)),
                ShaderStage::fragment(ctx.config.shader_path(FRAGMENT_SHADER)),
            ],
            &config,
            None,
        )?;

        Ok(Self {
            pipeline,
            pipeline_layout,
            frame_sets,
            uniforms,
            vertices: host_vertices(device, 0)?,
            palette: 0,
            _pool: pool,
            _set_layout: set_layout,
        })
    }
}

/// Host-visible vertex buffer for `palette`, written without a transfer or
/// queue wait so it can be replaced mid-run.
fn host_vertices(device: &Arc<Device>, palette: usize) -> cinder_gpu::Result<Buffer> {
    let vertices = triangle(palette);
    let mut buffer = Buffer::new(
        device,
        &BufferDesc::of::<Vertex>(
            "triangle vertices",
            vertices.len() as u32,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocation::CpuToGpu,
        )
        .persistent(true),
    )?;
    buffer.write_slice(&vertices, 0);
    buffer.flush(vk::WHOLE_SIZE, 0)?;
    Ok(buffer)
}

/// Viewer application state.
pub struct Viewer {
    scene: Option<TriangleScene>,
    time: f32,
}

impl CinderApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        ctx.renderer.set_clear_color(Vec4::new(0.02, 0.02, 0.04, 1.0));

        let mode = DescriptorMode::select(ctx.device.capabilities());
        let vertex_shader = FrameBinding::for_mode(mode, 1).vertex_shader;
        let shaders_present = [vertex_shader, FRAGMENT_SHADER]
            .iter()
            .all(|name| ctx.config.shader_path(name).is_file());

        let scene = if shaders_present {
            Some(TriangleScene::new(ctx, mode)?)
        } else {
            warn!(
                "Shaders not found in {}, drawing clear color only",
                ctx.config.shader_folder.display()
            );
            None
        };

        Ok(Self { scene, time: 0.0 })
    }

    fn update(&mut self, ctx: &mut AppContext, dt: f32) {
        self.time += dt;

        let Some(scene) = &mut self.scene else {
            return;
        };

        let Some(palette) = next_palette(scene.palette, self.time) else {
            return;
        };
        match host_vertices(&ctx.device, palette) {
            Ok(vertices) => {
                let previous = std::mem::replace(&mut scene.vertices, vertices);
                ctx.retire_buffer(previous);
                scene.palette = palette;
            }
            Err(e) => warn!("Failed to write vertices: {e}"),
        }
    }

    fn prepare(&mut self, _ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        let Some(scene) = &mut self.scene else {
            return Ok(());
        };

        let pulse = 0.75 + 0.25 * (self.time * 2.0).sin();
        let ubo = FrameUbo {
            tint: Vec4::new(pulse, pulse, pulse, 1.0),
            time: self.time,
            _pad: [0.0; 3],
        };

        let index = frame.frame_index as u32;
        scene.uniforms.write_value_to_index(&ubo, index);
        scene.uniforms.flush_index(index)?;
        Ok(())
    }

    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        let Some(scene) = &self.scene else {
            return Ok(());
        };

        let cmd = frame.command_buffer;
        let device = &ctx.device;

        scene.pipeline.bind(cmd);
        set_cull_mode(device, cmd, vk::CullModeFlags::NONE);
        set_front_face(device, cmd, vk::FrontFace::CLOCKWISE);

        scene.pipeline_layout.bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            0,
            &[scene.frame_sets[frame.frame_index]],
            &[],
        );

        let scale = 0.8;
        scene.pipeline_layout.push_value(
            cmd,
            0,
            &Push {
                offset: [0.0, 0.0],
                scale: scale / ctx.aspect_ratio().max(1.0),
                _pad: 0.0,
            },
        );

        unsafe {
            let raw = device.handle();
            raw.cmd_bind_vertex_buffers(cmd, 0, &[scene.vertices.handle()], &[0]);
            raw.cmd_draw(cmd, 3, 1, 0, 0);
        }
        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        info!("Viewport now {width}x{height}");
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        info!(
            "Shutting down after {:.1}s ({} buffers still deferred)",
            self.time,
            ctx.pending_deletions()
        );
        self.scene = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_cycles_with_time() {
        assert_eq!(palette_at(0.0), 0);
        assert_eq!(palette_at(PALETTE_PERIOD + 0.1), 1);
        assert_eq!(palette_at(2.0 * PALETTE_PERIOD + 0.1), 0);
    }

    #[test]
    fn palette_switches_only_at_period_boundary() {
        assert_eq!(next_palette(0, 0.5), None);
        assert_eq!(next_palette(0, PALETTE_PERIOD + 0.1), Some(1));
        assert_eq!(next_palette(1, PALETTE_PERIOD + 0.1), None);
        assert_eq!(next_palette(1, 2.0 * PALETTE_PERIOD), Some(0));
    }

    #[test]
    fn bindless_mode_uses_update_after_bind_storage_array() {
        let binding = FrameBinding::for_mode(DescriptorMode::Bindless, 2);
        let layout = binding.layout.describe().unwrap();

        assert!(layout.is_update_after_bind());
        assert!(binding.pool.is_update_after_bind());
        let frame_data = layout.binding(0).unwrap();
        assert_eq!(frame_data.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(frame_data.descriptor_count, BINDLESS_FRAME_CAPACITY);
        assert_eq!(layout.variable_count(), Some(1));
        assert_eq!(binding.usage, vk::BufferUsageFlags::STORAGE_BUFFER);
        assert_eq!(binding.vertex_shader, BINDLESS_VERTEX_SHADER);
    }

    #[test]
    fn classic_mode_uses_plain_uniform_binding() {
        let binding = FrameBinding::for_mode(DescriptorMode::Classic, 2);
        let layout = binding.layout.describe().unwrap();

        assert!(!layout.is_update_after_bind());
        assert!(!binding.pool.is_update_after_bind());
        assert!(layout.binding_flags().is_empty());
        let frame_data = layout.binding(0).unwrap();
        assert_eq!(frame_data.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(binding.usage, vk::BufferUsageFlags::UNIFORM_BUFFER);
        assert_eq!(binding.vertex_shader, VERTEX_SHADER);
    }

    #[test]
    fn frame_data_alignment_follows_descriptor_type() {
        let limits = vk::PhysicalDeviceLimits {
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            ..Default::default()
        };
        assert_eq!(
            FrameBinding::for_mode(DescriptorMode::Classic, 2).offset_alignment(&limits),
            256
        );
        assert_eq!(
            FrameBinding::for_mode(DescriptorMode::Bindless, 2).offset_alignment(&limits),
            64
        );
    }

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
        assert_eq!(std::mem::size_of::<FrameUbo>(), 32);
        assert_eq!(std::mem::size_of::<Push>(), 16);
    }
}
