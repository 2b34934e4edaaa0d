//! Conversion on a real GPU through wgpu.
//!
//! [`WgpuConverter`] runs the three conversion passes of the GLES programs
//! as WGSL: the luma stage takes one sample per output texel, the chroma
//! stages average four samples one source texel apart, and each pass renders
//! into an `R8Unorm` target copied back into host plane buffers. The capture
//! image is uploaded from an [`RgbaImage`] with row 0 at `v = 0`, and rows
//! come back in the same order.

use std::borrow::Cow;

use castcap_common::error::{CastcapError, CastcapResult};
use castcap_platform_core::{Dimensions, TexMatrix};

use crate::converter::{PlanarFrame, Plane};
use crate::software::RgbaImage;

/// All three conversion stages. `COEFF` constants match the GLES sources.
pub const CONVERT_SHADER: &str = r#"
struct Params {
    tex_matrix: mat4x4<f32>,
    source_size: vec2<f32>,
    padding: vec2<f32>,
};

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var capture_texture: texture_2d<f32>;
@group(0) @binding(2) var capture_sampler: sampler;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) tex_coord: vec2<f32>,
};

// Triangle strip: bottom-left, bottom-right, top-left, top-right.
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let x = f32(index & 1u) * 2.0 - 1.0;
    let y = f32(index >> 1u) * 2.0 - 1.0;
    var out: VertexOutput;
    out.position = vec4<f32>(x, y, 0.0, 1.0);
    // Framebuffer row 0 is the top edge here; it maps to v = 0.
    let quad = vec4<f32>((x + 1.0) * 0.5, (1.0 - y) * 0.5, 0.0, 1.0);
    out.tex_coord = (params.tex_matrix * quad).xy;
    return out;
}

const Y_COEFF = vec4<f32>(0.2126, 0.7152, 0.0722, 0.0);
const U_COEFF = vec4<f32>(-0.1146, -0.3854, 0.5, 0.5);
const V_COEFF = vec4<f32>(0.5, -0.4542, -0.0458, 0.5);

fn sample_rgb(uv: vec2<f32>) -> vec3<f32> {
    return textureSample(capture_texture, capture_sampler, uv).rgb;
}

fn box_average(uv: vec2<f32>) -> vec3<f32> {
    let texel_step = 1.0 / params.source_size;
    return (sample_rgb(uv)
        + sample_rgb(uv + vec2<f32>(texel_step.x, 0.0))
        + sample_rgb(uv + vec2<f32>(0.0, texel_step.y))
        + sample_rgb(uv + texel_step)) * 0.25;
}

@fragment
fn fs_luma(in: VertexOutput) -> @location(0) vec4<f32> {
    let rgb = sample_rgb(in.tex_coord);
    return vec4<f32>(dot(rgb, Y_COEFF.rgb) + Y_COEFF.a, 0.0, 0.0, 1.0);
}

@fragment
fn fs_cb(in: VertexOutput) -> @location(0) vec4<f32> {
    let rgb = box_average(in.tex_coord);
    return vec4<f32>(dot(rgb, U_COEFF.rgb) + U_COEFF.a, 0.0, 0.0, 1.0);
}

@fragment
fn fs_cr(in: VertexOutput) -> @location(0) vec4<f32> {
    let rgb = box_average(in.tex_coord);
    return vec4<f32>(dot(rgb, V_COEFF.rgb) + V_COEFF.a, 0.0, 0.0, 1.0);
}
"#;

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct PassUniforms {
    tex_matrix: [f32; 16],
    source_size: [f32; 2],
    padding: [f32; 2],
}

fn fragment_entry_point(plane: Plane) -> &'static str {
    match plane {
        Plane::Y => "fs_luma",
        Plane::U => "fs_cb",
        Plane::V => "fs_cr",
    }
}

fn extent(size: Dimensions) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

/// Render target, readback buffer and host copy of one plane.
struct PlaneTarget {
    plane: Plane,
    size: Dimensions,
    pipeline: wgpu::RenderPipeline,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    readback: wgpu::Buffer,
    /// Readback row pitch, rounded up to the copy alignment.
    padded_row: u32,
    host: Vec<u8>,
}

/// Uploaded capture image and the bind group sampling it.
struct SourceTexture {
    size: Dimensions,
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
}

/// Y, U and V conversion on a wgpu device.
pub struct WgpuConverter {
    runtime: tokio::runtime::Runtime,
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    uniforms: wgpu::Buffer,
    luma: Dimensions,
    targets: Vec<PlaneTarget>,
    source: Option<SourceTexture>,
}

impl WgpuConverter {
    /// Open the default adapter and build the three passes for planes of
    /// `luma` size.
    ///
    /// Fails with [`CastcapError::ContextUnavailable`] when no adapter is
    /// present.
    pub fn new(luma: Dimensions) -> CastcapResult<Self> {
        if !luma.is_chroma_aligned() {
            return Err(CastcapError::config(format!(
                "luma size {luma} is not a multiple of 8"
            )));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = runtime
            .block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                force_fallback_adapter: false,
                compatible_surface: None,
            }))
            .map_err(|e| {
                tracing::debug!(error = %e, "No wgpu adapter");
                CastcapError::ContextUnavailable
            })?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = runtime
            .block_on(adapter.request_device(&wgpu::DeviceDescriptor {
                label: Some("castcap-convert"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_webgl2_defaults()
                    .using_resolution(adapter.limits()),
                memory_hints: Default::default(),
                trace: wgpu::Trace::Off,
            }))
            .map_err(|e| CastcapError::gpu(format!("Failed to create device: {e}")))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("castcap-convert"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(CONVERT_SHADER)),
        });
        if let Some(error) = runtime.block_on(device.pop_error_scope()) {
            return Err(CastcapError::ShaderCompileFailed {
                stage: "wgsl".to_string(),
                log: error.to_string(),
            });
        }

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("castcap-convert"),
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
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("castcap-convert"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        // Bilinear, clamp-to-edge: the external sampler's configuration.
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("castcap-convert-params"),
            size: std::mem::size_of::<PassUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let targets = Plane::ALL
            .into_iter()
            .map(|plane| PlaneTarget::new(&device, &module, &pipeline_layout, plane, luma))
            .collect();

        tracing::info!(adapter = %adapter_name, luma = %luma, "wgpu converter ready");
        Ok(Self {
            runtime,
            device,
            queue,
            adapter_name,
            bind_group_layout,
            sampler,
            uniforms,
            luma,
            targets,
            source: None,
        })
    }

    /// Name of the adapter the converter runs on.
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn luma_size(&self) -> Dimensions {
        self.luma
    }

    /// Convert `image` sampled through `matrix` into Y, U and V planes.
    pub fn convert(
        &mut self,
        image: &RgbaImage,
        matrix: &TexMatrix,
    ) -> CastcapResult<PlanarFrame<'_>> {
        let source = image.dimensions();
        if !source.is_valid() {
            return Err(CastcapError::capture_surface("capture image is empty"));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.upload(image);
        let params = PassUniforms {
            tex_matrix: matrix.0,
            source_size: [source.width as f32, source.height as f32],
            padding: [0.0; 2],
        };
        self.queue
            .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&params));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("castcap-convert"),
            });
        for target in &self.targets {
            target.encode(&mut encoder, &bind_group);
        }
        self.queue.submit(Some(encoder.finish()));

        if let Some(error) = self.runtime.block_on(self.device.pop_error_scope()) {
            return Err(CastcapError::gpu(format!("Frame conversion failed: {error}")));
        }

        self.read_back()?;
        Ok(self.frame())
    }

    /// Upload `image`, recreating the texture when its size changed.
    fn upload(&mut self, image: &RgbaImage) -> wgpu::BindGroup {
        let size = image.dimensions();
        let source = match self.source.take() {
            Some(source) if source.size == size => source,
            _ => {
                tracing::debug!(source = %size, "Allocating wgpu capture texture");
                self.create_source(size)
            }
        };

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            image.as_bytes(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.width * 4),
                rows_per_image: Some(size.height),
            },
            extent(size),
        );

        let bind_group = source.bind_group.clone();
        self.source = Some(source);
        bind_group
    }

    fn create_source(&self, size: Dimensions) -> SourceTexture {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("castcap-capture"),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("castcap-capture"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        SourceTexture {
            size,
            texture,
            bind_group,
        }
    }

    /// Map every readback buffer and copy the unpadded rows out.
    fn read_back(&mut self) -> CastcapResult<()> {
        let (tx, rx) = crossbeam_channel::bounded(self.targets.len());
        for (index, target) in self.targets.iter().enumerate() {
            let tx = tx.clone();
            target
                .readback
                .slice(..)
                .map_async(wgpu::MapMode::Read, move |result| {
                    let _ = tx.send((index, result));
                });
        }
        drop(tx);

        if let Err(e) = self.device.poll(wgpu::PollType::Wait) {
            return Err(CastcapError::gpu(format!("Device poll failed: {e}")));
        }

        let mut mapped = vec![false; self.targets.len()];
        let mut failure = None;
        for (index, result) in rx.try_iter() {
            match result {
                Ok(()) => mapped[index] = true,
                Err(e) => failure = Some(e.to_string()),
            }
        }

        if mapped.iter().all(|&m| m) {
            for target in &mut self.targets {
                target.copy_out();
            }
            return Ok(());
        }

        for (target, mapped) in self.targets.iter().zip(mapped) {
            if mapped {
                target.readback.unmap();
            }
        }
        Err(CastcapError::gpu(format!(
            "Plane readback failed: {}",
            failure.unwrap_or_else(|| "buffer was never mapped".to_string())
        )))
    }

    fn plane(&self, plane: Plane) -> &[u8] {
        self.targets
            .iter()
            .find(|target| target.plane == plane)
            .map_or(&[][..], |target| target.host.as_slice())
    }

    fn frame(&self) -> PlanarFrame<'_> {
        PlanarFrame {
            width: self.luma.width,
            height: self.luma.height,
            y: self.plane(Plane::Y),
            u: self.plane(Plane::U),
            v: self.plane(Plane::V),
        }
    }
}

impl PlaneTarget {
    fn new(
        device: &wgpu::Device,
        module: &wgpu::ShaderModule,
        layout: &wgpu::PipelineLayout,
        plane: Plane,
        luma: Dimensions,
    ) -> Self {
        let size = plane.extent(luma);
        let label = format!("castcap-{plane:?}");

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&label),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module,
                entry_point: Some(fragment_entry_point(plane)),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::R8Unorm,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: Default::default(),
            multiview: None,
            cache: None,
        });

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&label),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let padded_row = size
            .width
            .div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&label),
            size: u64::from(padded_row) * u64::from(size.height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            plane,
            size,
            pipeline,
            texture,
            view,
            readback,
            padded_row,
            host: vec![0; size.pixel_count()],
        }
    }

    fn encode(&self, encoder: &mut wgpu::CommandEncoder, bind_group: &wgpu::BindGroup) {
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("castcap-convert-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.view,
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
            pass.set_bind_group(0, bind_group, &[]);
            pass.draw(0..4, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_row),
                    rows_per_image: Some(self.size.height),
                },
            },
            extent(self.size),
        );
    }

    /// Copy the mapped readback into the host buffer and unmap it.
    fn copy_out(&mut self) {
        let width = self.size.width as usize;
        {
            let mapped = self.readback.slice(..).get_mapped_range();
            for (dst, src) in self
                .host
                .chunks_exact_mut(width)
                .zip(mapped.chunks(self.padded_row as usize))
            {
                dst.copy_from_slice(&src[..width]);
            }
        }
        self.readback.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{GpuSession, InitRequest};
    use crate::software::SoftwareGles;
    use crate::target::PlaneBuffers;
    use castcap_platform_core::DisplayMetrics;

    /// A converter, or `None` on machines without a usable adapter.
    fn gpu(luma: Dimensions) -> Option<WgpuConverter> {
        match WgpuConverter::new(luma) {
            Ok(converter) => Some(converter),
            Err(CastcapError::ContextUnavailable | CastcapError::Gpu { .. }) => {
                eprintln!("no wgpu adapter, skipping");
                None
            }
            Err(e) => panic!("wgpu converter setup failed: {e}"),
        }
    }

    fn on_cpu(image: &RgbaImage, luma: Dimensions, matrix: &TexMatrix) -> [Vec<u8>; 3] {
        let gl = SoftwareGles::new();
        let mut api = gl.clone();
        let source = image.dimensions();
        let request = InitRequest {
            target: luma,
            suggested: Some(source),
            metrics: DisplayMetrics {
                width: source.width,
                height: source.height,
                density_dpi: 160,
            },
        };
        let mut session =
            GpuSession::initialize(&mut api, &request, PlaneBuffers::default()).unwrap();
        assert_eq!(session.dimensions().scaled, luma);
        gl.store().publish(session.external_texture(), image.clone());
        session.make_current(&mut api).unwrap();
        let frame = session.render(&mut api, matrix).unwrap();
        let planes = [frame.y.to_vec(), frame.u.to_vec(), frame.v.to_vec()];
        session.release_current(&mut api);
        session.teardown(&mut api);
        planes
    }

    fn max_difference(a: &[u8], b: &[u8]) -> u8 {
        assert_eq!(a.len(), b.len());
        a.iter().zip(b).map(|(x, y)| x.abs_diff(*y)).max().unwrap_or(0)
    }

    #[test]
    fn wgsl_keeps_the_gles_coefficients() {
        for plane in Plane::ALL {
            let gles = crate::shaders::fragment_source(plane);
            let start = gles.find("COEFF = vec4(").unwrap() + "COEFF = vec4(".len();
            let values = &gles[start..start + gles[start..].find(')').unwrap()];
            assert!(
                CONVERT_SHADER.contains(values),
                "{plane:?} coefficients {values} missing from WGSL"
            );
        }
    }

    #[test]
    fn solid_red_converts_with_bt709_full_range() {
        let size = Dimensions::new(16, 16);
        let Some(mut gpu) = gpu(size) else { return };
        let frame = gpu
            .convert(&RgbaImage::solid(16, 16, [255, 0, 0, 255]), &TexMatrix::IDENTITY)
            .unwrap();
        assert!(frame.y.iter().all(|&y| y.abs_diff(54) <= 1));
        assert!(frame.u.iter().all(|&u| u.abs_diff(98) <= 1));
        assert!(frame.v.iter().all(|&v| v >= 254));
    }

    #[test]
    fn rows_come_back_top_down() {
        let size = Dimensions::new(16, 16);
        let Some(mut gpu) = gpu(size) else { return };
        let image = RgbaImage::from_fn(16, 16, |_, y| {
            if y < 8 {
                [255, 255, 255, 255]
            } else {
                [0, 0, 0, 255]
            }
        });
        let frame = gpu.convert(&image, &TexMatrix::IDENTITY).unwrap();
        assert_eq!(frame.y[0], 255);
        assert_eq!(frame.y[16 * 15], 0);
    }

    #[test]
    fn matches_software_backend_when_scaling_and_flipping() {
        let luma = Dimensions::new(32, 24);
        let Some(mut gpu) = gpu(luma) else { return };
        let image = RgbaImage::from_fn(64, 48, |x, y| {
            [(x * 4) as u8, (y * 5) as u8, ((x + y) * 2) as u8, 255]
        });

        for matrix in [TexMatrix::IDENTITY, TexMatrix::VERTICAL_FLIP] {
            let expected = on_cpu(&image, luma, &matrix);
            let frame = gpu.convert(&image, &matrix).unwrap();
            for (plane, want) in Plane::ALL.into_iter().zip(&expected) {
                let got = frame.plane(plane);
                assert!(
                    max_difference(got, want) <= 2,
                    "{plane:?} differs from the CPU backend"
                );
            }
        }
    }

    #[test]
    fn source_size_change_reallocates_the_capture_texture() {
        let luma = Dimensions::new(16, 16);
        let Some(mut gpu) = gpu(luma) else { return };
        gpu.convert(&RgbaImage::solid(16, 16, [0, 0, 0, 255]), &TexMatrix::IDENTITY)
            .unwrap();
        let frame = gpu
            .convert(&RgbaImage::solid(32, 32, [255, 255, 255, 255]), &TexMatrix::IDENTITY)
            .unwrap();
        assert_eq!(frame.luma_size(), luma);
        assert!(frame.y.iter().all(|&y| y == 255));
        assert_eq!(gpu.source.as_ref().map(|s| s.size), Some(Dimensions::new(32, 32)));
    }

    #[test]
    fn odd_luma_size_is_rejected_before_touching_the_gpu() {
        assert!(matches!(
            WgpuConverter::new(Dimensions::new(15, 16)),
            Err(CastcapError::Config { .. })
        ));
    }
}
