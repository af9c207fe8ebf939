//! wgpu implementation of the render backend, presenting to a winit window.

use super::{GpuContext, RenderBackend, RenderError, QUAD_POSITIONS, QUAD_TEX_COORDS, QUAD_VERTEX_COUNT};
use crate::frame::ProcessedFrame;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, warn};
use wgpu::util::DeviceExt;
use winit::window::Window;

/// Vertex + fragment pair drawing the frame texture on the quad.
const QUAD_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec2<f32>, @location(1) tex_coords: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(position, 0.0, 1.0);
    out.tex_coords = tex_coords;
    return out;
}

@group(0) @binding(0) var t_frame: texture_2d<f32>;
@group(0) @binding(1) var s_frame: sampler;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(t_frame, s_frame, in.tex_coords);
}
"#;

const VEC2_STRIDE: wgpu::BufferAddress = std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress;

/// Objects that live from surface creation to teardown.
struct GpuResources {
    render_pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    position_buffer: wgpu::Buffer,
    tex_coord_buffer: wgpu::Buffer,
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    texture_size: (u32, u32),
}

pub struct WgpuBackend {
    ctx: GpuContext,
    window: Arc<Window>,
    shader_source: Cow<'static, str>,
    resources: Option<GpuResources>,
    // RGBA upload scratch, reused across frames of the same size
    staging: Vec<u8>,
}

impl WgpuBackend {
    /// Creates the device and surface for `window`. GPU resources are built
    /// later by `create_resources`.
    pub fn new(window: Arc<Window>) -> Result<Self, RenderError> {
        let ctx = GpuContext::new(window.clone())?;
        Ok(Self {
            ctx,
            window,
            shader_source: Cow::Borrowed(QUAD_SHADER),
            resources: None,
            staging: Vec::new(),
        })
    }

    /// Frame texture format matching the surface's colour encoding.
    fn texture_format(&self) -> wgpu::TextureFormat {
        if self.ctx.config.format.is_srgb() {
            wgpu::TextureFormat::Rgba8UnormSrgb
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        }
    }

    /// Parses and validates the WGSL so a broken shader fails here with a
    /// readable message instead of inside the driver.
    fn validate_shader(source: &str) -> Result<(), RenderError> {
        let module = naga::front::wgsl::parse_str(source)
            .map_err(|e| RenderError::ShaderCompile(e.emit_to_string(source)))?;
        Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .map_err(|e| RenderError::ShaderCompile(format!("{:?}", e)))?;
        Ok(())
    }

    fn create_texture(&self, width: u32, height: u32) -> wgpu::Texture {
        self.ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Frame Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.texture_format(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn create_bind_group(&self, layout: &wgpu::BindGroupLayout, texture: &wgpu::Texture, sampler: &wgpu::Sampler) -> wgpu::BindGroup {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Frame Bind Group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }

    fn write_rgba(&self, texture: &wgpu::Texture, data: &[u8], width: u32, height: u32) {
        self.ctx.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn resources(&self) -> Result<&GpuResources, RenderError> {
        self.resources
            .as_ref()
            .ok_or_else(|| RenderError::Device("GPU resources not created".to_string()))
    }
}

impl RenderBackend for WgpuBackend {
    fn create_resources(&mut self) -> Result<(), RenderError> {
        Self::validate_shader(&self.shader_source)?;
        let device = &self.ctx.device;

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Quad Shader"),
            source: wgpu::ShaderSource::Wgsl(self.shader_source.clone()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Frame Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Quad Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let render_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Quad Render Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader_module,
                entry_point: Some("vs_main"),
                buffers: &[
                    wgpu::VertexBufferLayout {
                        array_stride: VEC2_STRIDE,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &[wgpu::VertexAttribute {
                            offset: 0,
                            shader_location: 0,
                            format: wgpu::VertexFormat::Float32x2,
                        }],
                    },
                    wgpu::VertexBufferLayout {
                        array_stride: VEC2_STRIDE,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &[wgpu::VertexAttribute {
                            offset: 0,
                            shader_location: 1,
                            format: wgpu::VertexFormat::Float32x2,
                        }],
                    },
                ],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader_module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: self.ctx.config.format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        let position_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Position Buffer"),
            contents: bytemuck::cast_slice(&QUAD_POSITIONS[..]),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let tex_coord_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad TexCoord Buffer"),
            contents: bytemuck::cast_slice(&QUAD_TEX_COORDS[..]),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Frame Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        // Black 1x1 placeholder until the first frame arrives.
        let texture = self.create_texture(1, 1);
        self.write_rgba(&texture, &[0, 0, 0, 255], 1, 1);
        let bind_group = self.create_bind_group(&bind_group_layout, &texture, &sampler);

        self.resources = Some(GpuResources {
            render_pipeline,
            bind_group_layout,
            sampler,
            position_buffer,
            tex_coord_buffer,
            texture,
            bind_group,
            texture_size: (1, 1),
        });
        debug!("GPU resources created (surface format {:?})", self.ctx.config.format);
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.ctx.resize(width, height);
    }

    fn texture_size(&self) -> Option<(u32, u32)> {
        self.resources.as_ref().map(|r| r.texture_size)
    }

    fn allocate_texture(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        let texture = self.create_texture(width, height);
        let resources = self.resources()?;
        let bind_group = self.create_bind_group(&resources.bind_group_layout, &texture, &resources.sampler);

        let resources = self
            .resources
            .as_mut()
            .ok_or_else(|| RenderError::Device("GPU resources not created".to_string()))?;
        resources.texture = texture;
        resources.bind_group = bind_group;
        resources.texture_size = (width, height);
        Ok(())
    }

    fn upload(&mut self, frame: &ProcessedFrame) -> Result<(), RenderError> {
        let mut staging = std::mem::take(&mut self.staging);
        staging.clear();
        staging.reserve(frame.width as usize * frame.height as usize * 4);
        for px in frame.data.chunks_exact(3) {
            staging.extend_from_slice(&[px[0], px[1], px[2], 255]);
        }

        let result = self
            .resources()
            .map(|resources| self.write_rgba(&resources.texture, &staging, frame.width, frame.height));
        self.staging = staging;
        result
    }

    fn draw(&mut self) -> Result<bool, RenderError> {
        let resources = self.resources()?;

        let output = match self.ctx.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                debug!("Surface lost or outdated, reconfiguring");
                self.ctx.reconfigure();
                return Ok(false);
            }
            Err(wgpu::SurfaceError::Timeout) => {
                warn!("Surface texture timed out, skipping frame");
                return Ok(false);
            }
            Err(e) => return Err(RenderError::Surface(e.to_string())),
        };
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self.ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Quad Render Encoder"),
        });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Quad Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_viewport(
                0.0,
                0.0,
                self.ctx.config.width as f32,
                self.ctx.config.height as f32,
                0.0,
                1.0,
            );
            render_pass.set_pipeline(&resources.render_pipeline);
            render_pass.set_bind_group(0, &resources.bind_group, &[]);
            render_pass.set_vertex_buffer(0, resources.position_buffer.slice(..));
            render_pass.set_vertex_buffer(1, resources.tex_coord_buffer.slice(..));
            render_pass.draw(0..QUAD_VERTEX_COUNT, 0..1);
            // Bindings end with the pass; nothing carries over to the next tick.
        }

        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        self.window.pre_present_notify();
        output.present();
        Ok(true)
    }

    fn release(&mut self) {
        if self.resources.take().is_some() {
            debug!("GPU resources released");
        }
        self.staging = Vec::new();
    }
}
