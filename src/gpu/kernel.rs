//! Kernels as wgpu render pipelines drawing the shared full-screen quad

use std::borrow::Cow;

use bytemuck::{Pod, Zeroable};
use wgpu::{
    BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, BufferUsages, CommandEncoderDescriptor, FragmentState, LoadOp,
    MultisampleState, Operations, PipelineLayoutDescriptor, PrimitiveState,
    RenderPassColorAttachment, RenderPassDescriptor, RenderPipeline, RenderPipelineDescriptor,
    Sampler, ShaderStages, StoreOp, TextureFormat, VertexState,
    util::{BufferInitDescriptor, DeviceExt},
};

use crate::{
    error::SimError,
    gpu::{STATE_FORMAT, WgpuContext},
    sim::kernel::{Bindings, Kernel, KernelTarget, Scalars},
};

/// Vertex stage shared by every kernel
pub const QUAD_VERTEX_SOURCE: &str = include_str!("../shaders/quad.wgsl");
pub const UPDATE_FRAGMENT_SOURCE: &str = include_str!("../shaders/update.wgsl");
pub const RENDER_FRAGMENT_SOURCE: &str = include_str!("../shaders/render.wgsl");

/// The two WGSL programs making up a kernel.
///
/// The vertex program must take the quad corner as `@location(0) vec2<f32>`
/// from a `vs_main` entry point; the fragment program exposes `fs_main` and
/// may declare the bindings
/// - `@group(0) @binding(0)` the input state, `texture_2d<f32>`
/// - `@group(0) @binding(1)` a non-filtering `sampler`
/// - `@group(0) @binding(2)` a `var<uniform>` block laid out as [`KernelUniforms`]
#[derive(Clone, Debug)]
pub struct KernelSources {
    pub vertex: Cow<'static, str>,
    pub fragment: Cow<'static, str>,
}

impl KernelSources {
    pub fn new(
        vertex: impl Into<Cow<'static, str>>,
        fragment: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }
    }

    pub fn update() -> Self {
        Self::new(QUAD_VERTEX_SOURCE, UPDATE_FRAGMENT_SOURCE)
    }

    pub fn render() -> Self {
        Self::new(QUAD_VERTEX_SOURCE, RENDER_FRAGMENT_SOURCE)
    }
}

/// Scalar uniform block seen by both kernels
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct KernelUniforms {
    pub time_step: f32,
    pub frame: u32,
    pub width: u32,
    pub height: u32,
}

impl KernelUniforms {
    /// Packs `scalars` for a `width` x `height` input. Frame indices past
    /// `u32::MAX` saturate.
    pub fn new(scalars: Scalars, width: u32, height: u32) -> Self {
        Self {
            time_step: scalars.time_step,
            frame: u32::try_from(scalars.frame).unwrap_or(u32::MAX),
            width,
            height,
        }
    }
}

pub struct GpuKernel {
    name: String,
    pipeline: RenderPipeline,
    bind_group_layout: BindGroupLayout,
    sampler: Sampler,
    uniforms: wgpu::Buffer,
}

impl GpuKernel {
    /// Build the update kernel, which writes into state images
    pub fn update(ctx: &WgpuContext) -> Result<Self, SimError> {
        Self::build(ctx, "update", &KernelSources::update(), STATE_FORMAT)
    }

    /// Build the render kernel, which writes to the visible surface
    pub fn render(ctx: &WgpuContext) -> Result<Self, SimError> {
        let format = ctx.surface_format().unwrap_or(STATE_FORMAT);
        Self::build(ctx, "render", &KernelSources::render(), format)
    }

    /// Compile `sources` into a pipeline whose output has `target_format`
    pub fn build(
        ctx: &WgpuContext,
        name: &str,
        sources: &KernelSources,
        target_format: TextureFormat,
    ) -> Result<Self, SimError> {
        let device = ctx.device();
        let (kernel, error) = ctx.scoped(|| {
            let vertex = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("quad vertex shader"),
                source: wgpu::ShaderSource::Wgsl(sources.vertex.clone()),
            });
            let fragment = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(name),
                source: wgpu::ShaderSource::Wgsl(sources.fragment.clone()),
            });

            let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: Some("kernel bind group layout"),
                entries: &[
                    BindGroupLayoutEntry {
                        binding: 0,
                        visibility: ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    BindGroupLayoutEntry {
                        binding: 1,
                        visibility: ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                        count: None,
                    },
                    BindGroupLayoutEntry {
                        binding: 2,
                        visibility: ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

            // Rgba32Float is not filterable; edges clamp instead of repeating
            let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("state sampler"),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Nearest,
                min_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            });

            let uniforms = device.create_buffer_init(&BufferInitDescriptor {
                label: Some("kernel uniforms"),
                contents: bytemuck::bytes_of(&KernelUniforms::zeroed()),
                usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            });

            let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
                label: Some("kernel pipeline layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

            let pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
                label: Some(name),
                layout: Some(&pipeline_layout),
                vertex: VertexState {
                    module: &vertex,
                    entry_point: Some("vs_main"),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<[f32; 2]>() as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &wgpu::vertex_attr_array![0 => Float32x2],
                    }],
                    compilation_options: Default::default(),
                },
                fragment: Some(FragmentState {
                    module: &fragment,
                    entry_point: Some("fs_main"),
                    // No blending: every invocation fully replaces the target
                    targets: &[Some(wgpu::ColorTargetState {
                        format: target_format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleStrip,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: MultisampleState {
                    count: 1,
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                multiview: None,
                cache: None,
            });

            GpuKernel {
                name: name.to_string(),
                pipeline,
                bind_group_layout,
                sampler,
                uniforms,
            }
        });
        if let Some(e) = error {
            return Err(SimError::Compile {
                kernel: name.to_string(),
                reason: e.to_string(),
            });
        }
        log::debug!("built {name} kernel targeting {target_format:?}");
        Ok(kernel)
    }
}

impl Kernel<WgpuContext> for GpuKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(
        &mut self,
        ctx: &WgpuContext,
        target: KernelTarget<'_, WgpuContext>,
        bindings: &Bindings<'_, WgpuContext>,
    ) -> Result<(), SimError> {
        let device = ctx.device();
        let view = match &target {
            KernelTarget::Image(image) => &image.view,
            KernelTarget::Surface(surface) => &surface.view,
        };
        let state = bindings.state;

        let ((), error) = ctx.scoped(|| {
            let uniforms = KernelUniforms::new(bindings.scalars, state.width, state.height);
            ctx.queue()
                .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&uniforms));

            let bind_group = device.create_bind_group(&BindGroupDescriptor {
                label: Some("kernel bind group"),
                layout: &self.bind_group_layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&state.view),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                    BindGroupEntry {
                        binding: 2,
                        resource: self.uniforms.as_entire_binding(),
                    },
                ],
            });

            let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
                label: Some("kernel encoder"),
            });
            {
                let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
                    label: Some(self.name.as_str()),
                    color_attachments: &[Some(RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: Operations {
                            load: LoadOp::Clear(wgpu::Color::TRANSPARENT),
                            store: StoreOp::Store,
                        },
                        depth_slice: None,
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_vertex_buffer(0, ctx.quad().slice(..));
                pass.draw(0..4, 0..1);
            }
            ctx.queue().submit(std::iter::once(encoder.finish()));
        });
        match error {
            Some(e) => Err(SimError::device("kernel invocation", e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniforms_carry_the_frame_index() {
        let scalars = Scalars {
            time_step: 0.5,
            frame: 1200,
        };
        assert_eq!(
            KernelUniforms::new(scalars, 600, 400),
            KernelUniforms {
                time_step: 0.5,
                frame: 1200,
                width: 600,
                height: 400,
            }
        );
    }

    #[test]
    fn frame_index_saturates_instead_of_wrapping() {
        let scalars = Scalars {
            time_step: 0.0,
            frame: u64::from(u32::MAX) + 5,
        };
        assert_eq!(KernelUniforms::new(scalars, 1, 1).frame, u32::MAX);
    }
}
