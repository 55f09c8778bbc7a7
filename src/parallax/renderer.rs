use bytemuck::{Pod, Zeroable};
use tracing::{debug, warn};
use wgpu::util::DeviceExt;

use super::camera::PlaneCamera;
use super::mesh::{PlaneVertex, subdivided_plane};
use super::{cover_extent, cropped_extent};
use crate::config::{DepthConvention, ParallaxConfig, ParallaxStrategy};
use crate::events::{PreparedDepthCpu, PreparedImageCpu};
use crate::pointer::PointerSample;

const MODE_UV_OFFSET: u32 = 0;
const MODE_VERTEX_DISPLACEMENT: u32 = 1;

/// Uniform block shared by both stages of `depth_plane.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PlaneUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub plane_half: [f32; 2],
    pub uv_extent: [f32; 2],
    pub pointer: [f32; 2],
    pub strength: f32,
    pub mode: u32,
    pub near_is_bright: u32,
    pub has_depth: u32,
    pub _pad: [u32; 2],
}

impl PlaneUniforms {
    /// Uniforms for one frame. The offset strategy draws a clip-space quad;
    /// the displacement strategy draws a world-space plane seen by `camera`.
    pub fn compute(
        cfg: &ParallaxConfig,
        camera: &PlaneCamera,
        image: (u32, u32),
        viewport: (u32, u32),
        pointer: PointerSample,
        has_depth: bool,
    ) -> Self {
        let pointer = pointer.clamped();
        let aspect = viewport.0.max(1) as f32 / viewport.1.max(1) as f32;
        let (mode, view_proj, plane_half, uv_extent) = match cfg.strategy {
            ParallaxStrategy::UvOffset { .. } => (
                MODE_UV_OFFSET,
                glam::Mat4::IDENTITY,
                [1.0, 1.0],
                cropped_extent(image, viewport, cfg.crop_factor),
            ),
            ParallaxStrategy::VertexDisplacement { .. } => {
                let half = camera.plane_half_extent(aspect, cfg.crop_factor);
                (
                    MODE_VERTEX_DISPLACEMENT,
                    camera.view_projection(pointer, aspect),
                    half.to_array(),
                    cover_extent(image, viewport),
                )
            }
        };
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            plane_half,
            uv_extent,
            pointer: [pointer.x, pointer.y],
            strength: cfg.strategy.strength(),
            mode,
            near_is_bright: u32::from(cfg.depth_convention == DepthConvention::NearIsBright),
            has_depth: u32::from(has_depth),
            _pad: [0; 2],
        }
    }
}

struct LayerTextures {
    _color: wgpu::Texture,
    _depth: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    image_size: (u32, u32),
    has_depth: bool,
}

/// A single textured plane that fakes depth from a grayscale depth map.
///
/// Without a depth map (or with a mismatched one) the layer renders flat: a
/// 1×1 zero texture is bound and `has_depth` is cleared.
pub struct DepthPlane {
    cfg: ParallaxConfig,
    camera: PlaneCamera,
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    uniform_buf: wgpu::Buffer,
    vertex_buf: wgpu::Buffer,
    index_buf: wgpu::Buffer,
    index_count: u32,
    layer: Option<LayerTextures>,
}

impl DepthPlane {
    pub fn new(device: &wgpu::Device, format: wgpu::TextureFormat, cfg: &ParallaxConfig) -> Self {
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("depth-plane-bind-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("depth-plane-shader"),
            source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(include_str!(
                "shaders/depth_plane.wgsl"
            ))),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("depth-plane-pipeline-layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("depth-plane-pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[PlaneVertex::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("depth-plane-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let uniform_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("depth-plane-uniforms"),
            contents: bytemuck::bytes_of(&PlaneUniforms::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let mesh = subdivided_plane(cfg.strategy.subdivisions());
        let vertex_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("depth-plane-vertices"),
            contents: bytemuck::cast_slice(&mesh.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("depth-plane-indices"),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        debug!(
            strategy = ?cfg.strategy,
            vertices = mesh.vertices.len(),
            "depth plane pipeline ready"
        );

        Self {
            cfg: cfg.clone(),
            camera: PlaneCamera::from_config(cfg),
            pipeline,
            layout,
            sampler,
            uniform_buf,
            vertex_buf,
            index_buf,
            index_count: mesh.indices.len() as u32,
            layer: None,
        }
    }

    pub fn has_image(&self) -> bool {
        self.layer.is_some()
    }

    pub fn is_flat(&self) -> bool {
        self.layer.as_ref().is_none_or(|layer| !layer.has_depth)
    }

    /// Replace the displayed background. A depth map whose sample count does
    /// not match its dimensions is ignored and the layer renders flat.
    pub fn set_images(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        color: &PreparedImageCpu,
        depth: Option<&PreparedDepthCpu>,
    ) {
        let color_tex = upload(
            device,
            queue,
            "depth-plane-color",
            wgpu::TextureFormat::Rgba8UnormSrgb,
            (color.width, color.height),
            4,
            &color.pixels,
        );

        let depth = depth.filter(|d| {
            let ok = d.width > 0
                && d.height > 0
                && d.samples.len() == d.width as usize * d.height as usize;
            if !ok {
                warn!(source = %color.source, "depth map has inconsistent size; rendering flat");
            }
            ok
        });
        let has_depth = depth.is_some();
        let depth_tex = match depth {
            Some(d) => upload(
                device,
                queue,
                "depth-plane-depth",
                wgpu::TextureFormat::R8Unorm,
                (d.width, d.height),
                1,
                &d.samples,
            ),
            None => upload(
                device,
                queue,
                "depth-plane-flat",
                wgpu::TextureFormat::R8Unorm,
                (1, 1),
                1,
                &[0],
            ),
        };

        let color_view = color_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = depth_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("depth-plane-bind-group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&color_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&depth_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        debug!(
            source = %color.source,
            width = color.width,
            height = color.height,
            has_depth,
            "background layer uploaded"
        );
        self.layer = Some(LayerTextures {
            _color: color_tex,
            _depth: depth_tex,
            bind_group,
            image_size: (color.width, color.height),
            has_depth,
        });
    }

    pub fn clear(&mut self) {
        self.layer = None;
    }

    /// Write this frame's uniforms; call once per frame before [`Self::draw`].
    pub fn update(&self, queue: &wgpu::Queue, pointer: PointerSample, viewport: (u32, u32)) {
        let Some(layer) = &self.layer else {
            return;
        };
        let uniforms = PlaneUniforms::compute(
            &self.cfg,
            &self.camera,
            layer.image_size,
            viewport,
            pointer,
            layer.has_depth,
        );
        queue.write_buffer(&self.uniform_buf, 0, bytemuck::bytes_of(&uniforms));
    }

    pub fn draw(&self, rpass: &mut wgpu::RenderPass<'_>) {
        let Some(layer) = &self.layer else {
            return;
        };
        rpass.set_pipeline(&self.pipeline);
        rpass.set_bind_group(0, &layer.bind_group, &[]);
        rpass.set_vertex_buffer(0, self.vertex_buf.slice(..));
        rpass.set_index_buffer(self.index_buf.slice(..), wgpu::IndexFormat::Uint32);
        rpass.draw_indexed(0..self.index_count, 0, 0..1);
    }
}

fn upload(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    label: &str,
    format: wgpu::TextureFormat,
    (w, h): (u32, u32),
    bytes_per_texel: u32,
    data: &[u8],
) -> wgpu::Texture {
    let size = wgpu::Extent3d {
        width: w.max(1),
        height: h.max(1),
        depth_or_array_layers: 1,
    };
    let tex = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    queue.write_texture(
        tex.as_image_copy(),
        data,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(bytes_per_texel * size.width),
            rows_per_image: Some(size.height),
        },
        size,
    );
    tex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_matches_wgsl_layout() {
        assert_eq!(std::mem::size_of::<PlaneUniforms>(), 112);
        assert_eq!(std::mem::size_of::<PlaneUniforms>() % 16, 0);
    }

    #[test]
    fn offset_strategy_draws_a_cropped_quad() {
        let cfg = ParallaxConfig::default();
        let camera = PlaneCamera::from_config(&cfg);
        let u = PlaneUniforms::compute(
            &cfg,
            &camera,
            (1000, 1000),
            (1000, 1000),
            PointerSample::new(0.5, -0.5),
            true,
        );
        assert_eq!(u.mode, MODE_UV_OFFSET);
        assert_eq!(u.view_proj, glam::Mat4::IDENTITY.to_cols_array_2d());
        assert!((u.uv_extent[0] - 1.0 / 1.2).abs() < 1e-6);
        assert_eq!(u.pointer, [0.5, -0.5]);
        assert_eq!(u.strength, 0.03);
        assert_eq!((u.near_is_bright, u.has_depth), (1, 1));
    }

    #[test]
    fn displacement_strategy_uses_the_camera() {
        let cfg = ParallaxConfig {
            strategy: ParallaxStrategy::VertexDisplacement {
                strength: 0.3,
                subdivisions: 64,
            },
            depth_convention: DepthConvention::NearIsDark,
            ..ParallaxConfig::default()
        };
        let camera = PlaneCamera::from_config(&cfg);
        let u = PlaneUniforms::compute(
            &cfg,
            &camera,
            (1600, 900),
            (900, 1600),
            PointerSample::new(3.0, 0.0),
            false,
        );
        assert_eq!(u.mode, MODE_VERTEX_DISPLACEMENT);
        assert_eq!(u.pointer, [1.0, 0.0]);
        assert_ne!(u.view_proj, glam::Mat4::IDENTITY.to_cols_array_2d());
        assert!(u.plane_half[1] > u.plane_half[0]);
        assert_eq!(u.uv_extent[1], 1.0);
        assert_eq!((u.near_is_bright, u.has_depth), (0, 0));
    }
}
