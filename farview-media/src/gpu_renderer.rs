//! Shader-based YUV renderer.
//!
//! Keeps three single-channel textures (full-resolution Y, half-resolution
//! U and V), a quad vertex buffer mapping NDC onto texture space with a Y
//! flip, and a BT.601 fragment shader. Textures are reallocated when frame
//! dimensions change and sub-uploaded in place otherwise.

use std::sync::Arc;

use crate::error::PipelineError;
use crate::frame::Yuv420Frame;
use crate::pipe::{MediaPipe, Payload, SetupConfig};
use crate::stats::PipelineStats;

/// Device handles the embedder renders with.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    /// Format of the surfaces produced by the target factory.
    pub format: wgpu::TextureFormat,
}

/// One drawable output surface.
pub trait RenderTarget: Send {
    fn acquire(&mut self) -> Result<wgpu::TextureView, PipelineError>;
    fn present(&mut self);
}

/// Creates render targets; the sink takes one for the chain's lifetime.
pub trait RenderTargetFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn RenderTarget>, PipelineError>;
}

/// BT.601 conversion; chroma centered on 0.5, output clamped by the
/// pipeline's unorm target.
const YUV_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@location(0) pos: vec2<f32>, @location(1) uv: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = vec4<f32>(pos, 0.0, 1.0);
    out.uv = uv;
    return out;
}

@group(0) @binding(0) var y_plane: texture_2d<f32>;
@group(0) @binding(1) var u_plane: texture_2d<f32>;
@group(0) @binding(2) var v_plane: texture_2d<f32>;
@group(0) @binding(3) var plane_sampler: sampler;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let y = textureSample(y_plane, plane_sampler, in.uv).r;
    let u = textureSample(u_plane, plane_sampler, in.uv).r - 0.5;
    let v = textureSample(v_plane, plane_sampler, in.uv).r - 0.5;
    let r = y + 1.402 * v;
    let g = y - 0.344 * u - 0.714 * v;
    let b = y + 1.772 * u;
    return vec4<f32>(r, g, b, 1.0);
}
"#;

/// Quad in NDC with texture coordinates flipped on Y.
const VERTICES: [f32; 16] = [
    -1.0, -1.0, 0.0, 1.0, //
    1.0, -1.0, 1.0, 1.0, //
    -1.0, 1.0, 0.0, 0.0, //
    1.0, 1.0, 1.0, 0.0, //
];

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];

struct PlaneTextures {
    y: wgpu::Texture,
    u: wgpu::Texture,
    v: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
}

/// Uploads planes and draws the quad.
pub struct YuvRenderer {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: wgpu::RenderPipeline,
    bind_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    vertex_buffer: wgpu::Buffer,
    planes: Option<PlaneTextures>,
}

impl YuvRenderer {
    pub fn new(context: &GpuContext) -> Self {
        let device = Arc::clone(&context.device);
        let queue = Arc::clone(&context.queue);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("yuv-shader"),
            source: wgpu::ShaderSource::Wgsl(YUV_SHADER.into()),
        });

        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("yuv-bind-layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("yuv-pipeline-layout"),
            bind_group_layouts: &[&bind_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("yuv-pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                compilation_options: Default::default(),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: 16,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &VERTEX_ATTRIBUTES,
                }],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: context.format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("yuv-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let vertex_buffer = wgpu::util::DeviceExt::create_buffer_init(
            device.as_ref(),
            &wgpu::util::BufferInitDescriptor {
                label: Some("yuv-quad"),
                contents: bytemuck::cast_slice(&VERTICES),
                usage: wgpu::BufferUsages::VERTEX,
            },
        );

        Self {
            device,
            queue,
            pipeline,
            bind_layout,
            sampler,
            vertex_buffer,
            planes: None,
        }
    }

    fn plane_texture(&self, label: &str, width: u32, height: u32) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    /// Reallocate plane textures on dimension change.
    fn ensure_planes(&mut self, width: u32, height: u32) {
        if self
            .planes
            .as_ref()
            .is_some_and(|p| p.width == width && p.height == height)
        {
            return;
        }
        tracing::debug!(width, height, "allocating yuv plane textures");

        let chroma_width = width.div_ceil(2);
        let chroma_height = height.div_ceil(2);
        let y = self.plane_texture("yuv-y", width, height);
        let u = self.plane_texture("yuv-u", chroma_width, chroma_height);
        let v = self.plane_texture("yuv-v", chroma_width, chroma_height);

        let views = [
            y.create_view(&wgpu::TextureViewDescriptor::default()),
            u.create_view(&wgpu::TextureViewDescriptor::default()),
            v.create_view(&wgpu::TextureViewDescriptor::default()),
        ];
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("yuv-bind-group"),
            layout: &self.bind_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&views[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&views[1]),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&views[2]),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        self.planes = Some(PlaneTextures {
            y,
            u,
            v,
            bind_group,
            width,
            height,
        });
    }

    fn upload_plane(&self, texture: &wgpu::Texture, data: &[u8], stride: usize, rows: u32) {
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(stride as u32),
                rows_per_image: Some(rows),
            },
            texture.size(),
        );
    }

    /// Upload the planes and draw one quad into `view`.
    pub fn render(&mut self, frame: &Yuv420Frame, view: &wgpu::TextureView) {
        self.ensure_planes(frame.width, frame.height);
        let planes = self.planes.as_ref().expect("just ensured");

        let chroma_rows = frame.height.div_ceil(2);
        self.upload_plane(&planes.y, &frame.y, frame.y_stride, frame.height);
        self.upload_plane(&planes.u, &frame.u, frame.uv_stride, chroma_rows);
        self.upload_plane(&planes.v, &frame.v, frame.uv_stride, chroma_rows);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("yuv-draw"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("yuv-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &planes.bind_group, &[]);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            pass.draw(0..4, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    /// Drop GPU resources.
    pub fn release(&mut self) {
        self.planes = None;
    }
}

/// Leaf pipe drawing YUV frames through the renderer.
pub struct GpuYuvSink {
    renderer: YuvRenderer,
    target: Box<dyn RenderTarget>,
    low_latency: bool,
    held: Option<Yuv420Frame>,
    cleaned: bool,
    stats: Arc<PipelineStats>,
}

impl GpuYuvSink {
    pub fn new(
        context: &GpuContext,
        target: Box<dyn RenderTarget>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            renderer: YuvRenderer::new(context),
            target,
            low_latency: true,
            held: None,
            cleaned: false,
            stats,
        }
    }

    fn draw(&mut self, frame: &Yuv420Frame) {
        match self.target.acquire() {
            Ok(view) => {
                self.renderer.render(frame, &view);
                self.target.present();
                PipelineStats::bump(&self.stats.frames_presented);
            }
            Err(error) => {
                tracing::warn!(%error, "render target unavailable, skipping frame");
            }
        }
    }
}

impl MediaPipe for GpuYuvSink {
    fn setup(&mut self, config: &SetupConfig) -> Result<(), PipelineError> {
        self.low_latency = config.low_latency;
        Ok(())
    }

    fn submit(&mut self, payload: Payload) -> Result<(), PipelineError> {
        let Payload::Yuv420(frame) = payload else {
            return Err(PipelineError::Bitstream(format!(
                "gpu sink expects yuv frames, got {:?}",
                payload.kind()
            )));
        };
        if self.cleaned {
            return Ok(());
        }
        if self.low_latency {
            self.draw(&frame);
        } else {
            self.held = Some(frame);
        }
        Ok(())
    }

    fn tick(&mut self) {
        if let Some(frame) = self.held.take() {
            self.draw(&frame);
        }
    }

    fn poll_request_idr(&mut self) -> bool {
        false
    }

    fn cleanup(&mut self) {
        self.held = None;
        self.renderer.release();
        self.cleaned = true;
    }
}
