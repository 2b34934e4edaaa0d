//! Three-pass RGB to planar Y/U/V conversion.

use castcap_common::error::{CastcapError, CastcapResult};
use castcap_platform_core::{Dimensions, ExternalTextureId, TexMatrix};
use serde::{Deserialize, Serialize};

use crate::context::QuadBuffer;
use crate::gles::{GlesApi, CAPTURE_TEXTURE_UNIT, GL_NO_ERROR};
use crate::shaders::ShaderProgram;
use crate::target::{PlaneBuffers, RenderTarget};

/// One plane of a 4:2:0 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plane {
    Y,
    U,
    V,
}

impl Plane {
    /// Render order.
    pub const ALL: [Plane; 3] = [Plane::Y, Plane::U, Plane::V];

    pub fn is_chroma(self) -> bool {
        !matches!(self, Plane::Y)
    }

    /// Extent of this plane for a frame with `luma` dimensions.
    pub fn extent(self, luma: Dimensions) -> Dimensions {
        if self.is_chroma() {
            luma.half()
        } else {
            luma
        }
    }
}

/// A converted frame borrowed from the converter's host buffers.
///
/// Valid until the next render; consumers copy out what they keep.
#[derive(Debug, Clone, Copy)]
pub struct PlanarFrame<'a> {
    /// Luma width.
    pub width: u32,
    /// Luma height.
    pub height: u32,
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
}

impl<'a> PlanarFrame<'a> {
    pub fn luma_size(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    pub fn chroma_size(&self) -> Dimensions {
        self.luma_size().half()
    }

    pub fn plane(&self, plane: Plane) -> &'a [u8] {
        match plane {
            Plane::Y => self.y,
            Plane::U => self.u,
            Plane::V => self.v,
        }
    }

    /// Byte size of the frame laid out as contiguous I420.
    pub fn i420_len(&self) -> usize {
        self.y.len() + self.u.len() + self.v.len()
    }

    /// Copy the planes into one contiguous I420 buffer (Y, then U, then V).
    pub fn to_i420(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.i420_len());
        out.extend_from_slice(self.y);
        out.extend_from_slice(self.u);
        out.extend_from_slice(self.v);
        out
    }
}

#[derive(Debug)]
struct Pass {
    plane: Plane,
    program: ShaderProgram,
    target: RenderTarget,
}

impl Pass {
    fn delete(self, gl: &mut dyn GlesApi) -> Vec<u8> {
        self.program.delete(gl);
        self.target.delete(gl)
    }
}

/// The Y, U and V programs with their render targets.
#[derive(Debug)]
pub struct ColorConverter {
    luma: Dimensions,
    passes: Vec<Pass>,
}

impl ColorConverter {
    /// Build the three programs and targets. The context must be current.
    ///
    /// `buffers` become the targets' readback buffers. On failure every
    /// object built so far is deleted.
    pub fn new(
        gl: &mut dyn GlesApi,
        luma: Dimensions,
        chroma: Dimensions,
        buffers: PlaneBuffers,
    ) -> CastcapResult<Self> {
        let PlaneBuffers { y, u, v } = buffers;
        let mut passes = Vec::with_capacity(Plane::ALL.len());

        for (plane, host) in Plane::ALL.into_iter().zip([y, u, v]) {
            let size = if plane.is_chroma() { chroma } else { luma };
            match Self::build_pass(gl, plane, size, host) {
                Ok(pass) => passes.push(pass),
                Err(e) => {
                    for pass in passes.drain(..).rev() {
                        pass.delete(gl);
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!(luma = %luma, chroma = %chroma, "Color converter ready");
        Ok(Self { luma, passes })
    }

    fn build_pass(
        gl: &mut dyn GlesApi,
        plane: Plane,
        size: Dimensions,
        host: Vec<u8>,
    ) -> CastcapResult<Pass> {
        let program = ShaderProgram::build(gl, plane)?;
        match RenderTarget::new(gl, size, host) {
            Ok(target) => Ok(Pass {
                plane,
                program,
                target,
            }),
            Err(e) => {
                program.delete(gl);
                Err(e)
            }
        }
    }

    /// Run the three passes over `texture`, a capture image of `source`
    /// size, and read each plane back.
    ///
    /// The context must be current. A GL error raised by any pass fails the
    /// whole frame; the host buffers then hold no complete frame.
    pub fn render(
        &mut self,
        gl: &mut dyn GlesApi,
        texture: ExternalTextureId,
        quad: &QuadBuffer,
        matrix: &TexMatrix,
        source: Dimensions,
    ) -> CastcapResult<()> {
        for pass in &mut self.passes {
            pass.target.bind(gl);

            let program = &pass.program;
            gl.use_program(program.program);
            gl.uniform_matrix4(program.u_tex_matrix, matrix);
            if let Some(location) = program.u_source_size {
                gl.uniform_vec2(location, source.width as f32, source.height as f32);
            }
            gl.uniform_sampler(program.u_texture, CAPTURE_TEXTURE_UNIT);
            gl.bind_external_texture(CAPTURE_TEXTURE_UNIT, texture);

            quad.bind(gl, program);
            gl.draw_triangle_strip(0, QuadBuffer::VERTEX_COUNT);

            pass.target.read_back(gl);
            tracing::trace!(plane = ?pass.plane, size = %pass.target.size(), "Plane rendered");
        }

        match gl.gl_error() {
            GL_NO_ERROR => Ok(()),
            code => Err(CastcapError::RenderFailed { code }),
        }
    }

    /// Planes from the last render.
    pub fn frame(&self) -> PlanarFrame<'_> {
        let pixels = |plane: Plane| {
            self.passes
                .iter()
                .find(|pass| pass.plane == plane)
                .map(|pass| pass.target.pixels())
                .unwrap_or_default()
        };
        PlanarFrame {
            width: self.luma.width,
            height: self.luma.height,
            y: pixels(Plane::Y),
            u: pixels(Plane::U),
            v: pixels(Plane::V),
        }
    }

    /// Delete programs and targets, keeping the host buffers.
    pub fn delete(self, gl: &mut dyn GlesApi) -> PlaneBuffers {
        let mut buffers = PlaneBuffers::default();
        for pass in self.passes.into_iter().rev() {
            let plane = pass.plane;
            let host = pass.delete(gl);
            *buffers.slot(plane) = host;
        }
        buffers
    }

    /// Keep the host buffers without touching the GPU.
    pub fn abandon(self) -> PlaneBuffers {
        let mut buffers = PlaneBuffers::default();
        for pass in self.passes {
            *buffers.slot(pass.plane) = pass.target.abandon();
        }
        buffers
    }
}

impl PlaneBuffers {
    fn slot(&mut self, plane: Plane) -> &mut Vec<u8> {
        match plane {
            Plane::Y => &mut self.y,
            Plane::U => &mut self.u,
            Plane::V => &mut self.v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gles::{
        ConfigRequest, ContextHandle, DisplayHandle, ShaderStage, SurfaceHandle,
        GL_INVALID_OPERATION,
    };
    use crate::software::{FailurePoint, RgbaImage, SoftwareGles};

    struct Harness {
        gl: SoftwareGles,
        api: SoftwareGles,
        display: DisplayHandle,
        context: ContextHandle,
        surface: SurfaceHandle,
        texture: ExternalTextureId,
        quad: QuadBuffer,
        source: Dimensions,
    }

    impl Harness {
        /// Context made current on a pbuffer, `image` bound as the capture
        /// texture.
        fn new(image: RgbaImage) -> Self {
            let mut h = Self::without_current_context(image);
            assert!(h.api.make_current(h.display, h.surface, h.context));
            h
        }

        fn without_current_context(image: RgbaImage) -> Self {
            let gl = SoftwareGles::new();
            let mut api = gl.clone();
            let source = image.dimensions();

            let display = api.default_display().unwrap();
            assert!(api.initialize_display(display));
            let config = api
                .choose_config(display, &ConfigRequest::RGBA8888_ES3)
                .unwrap();
            let context = api.create_context(display, config).unwrap();
            let surface = api.create_pbuffer_surface(display, config, source).unwrap();

            let texture = api.create_external_texture();
            gl.store().publish(texture, image);
            let quad = QuadBuffer::new(&mut api);
            Self {
                gl,
                api,
                display,
                context,
                surface,
                texture,
                quad,
                source,
            }
        }

        fn converter(&mut self, luma: Dimensions) -> ColorConverter {
            ColorConverter::new(&mut self.api, luma, luma.half(), PlaneBuffers::default()).unwrap()
        }

        fn render(&mut self, converter: &mut ColorConverter) -> CastcapResult<()> {
            converter.render(
                &mut self.api,
                self.texture,
                &self.quad,
                &TexMatrix::IDENTITY,
                self.source,
            )
        }

        /// Delete the quad, texture and EGL objects.
        fn finish(mut self) -> SoftwareGles {
            self.quad.delete(&mut self.api);
            self.api.delete_external_texture(self.texture);
            self.api.release_current(self.display);
            self.api.destroy_surface(self.display, self.surface);
            self.api.destroy_context(self.display, self.context);
            self.api.terminate(self.display);
            self.gl
        }
    }

    fn assert_near(actual: u8, expected: u8) {
        assert!(
            actual.abs_diff(expected) <= 1,
            "expected {expected} (+/-1), got {actual}"
        );
    }

    #[test]
    fn solid_red_converts_with_bt709_full_range() {
        let mut h = Harness::new(RgbaImage::solid(16, 16, [255, 0, 0, 255]));
        let mut converter = h.converter(Dimensions::new(16, 16));
        h.render(&mut converter).unwrap();
        let frame = converter.frame();

        assert_eq!(frame.y.len(), 256);
        assert_eq!(frame.u.len(), 64);
        assert_eq!(frame.v.len(), 64);
        frame.y.iter().for_each(|&y| assert_near(y, 54));
        frame.u.iter().for_each(|&u| assert_near(u, 98));
        frame.v.iter().for_each(|&v| assert_near(v, 255));
    }

    #[test]
    fn chroma_averages_samples_one_source_texel_apart() {
        // One-pixel red/blue columns. Away from the right edge every chroma
        // sample set mixes both colors equally and averages to purple.
        let image = RgbaImage::from_fn(8, 8, |x, _| {
            if x % 2 == 0 {
                [255, 0, 0, 255]
            } else {
                [0, 0, 255, 255]
            }
        });
        let mut h = Harness::new(image);
        let mut converter = h.converter(Dimensions::new(8, 8));
        h.render(&mut converter).unwrap();
        let frame = converter.frame();

        // Luma keeps the stripes.
        assert_near(frame.y[0], 54);
        assert_near(frame.y[1], 18);
        // (0.5, 0, 0.5): U = 0.6927, V = 0.7271
        for row in 0..4 {
            for col in 0..3 {
                assert_near(frame.u[row * 4 + col], 177);
                assert_near(frame.v[row * 4 + col], 185);
            }
        }
        // The +1 texel sample clamps to the blue last column.
        assert!(frame.u[3] > 200, "edge chroma {} not pulled to blue", frame.u[3]);
    }

    #[test]
    fn chroma_step_follows_source_not_luma_size() {
        // Red/blue columns in pairs, downscaled 16x16 -> 8x8. Each chroma
        // center falls on a red|blue boundary. One source texel further is
        // solid blue, while one luma texel further would be the next
        // boundary and average to purple.
        let image = RgbaImage::from_fn(16, 16, |x, _| {
            if (x / 2) % 2 == 0 {
                [255, 0, 0, 255]
            } else {
                [0, 0, 255, 255]
            }
        });
        let mut h = Harness::new(image);
        let mut converter = h.converter(Dimensions::new(8, 8));
        h.render(&mut converter).unwrap();
        let frame = converter.frame();

        // (0.25, 0, 0.75): U = 0.8464, V = 0.5907
        frame.u.iter().for_each(|&u| assert_near(u, 216));
        frame.v.iter().for_each(|&v| assert_near(v, 151));
    }

    #[test]
    fn rows_come_back_top_down() {
        let image = RgbaImage::from_fn(8, 8, |_, y| {
            if y < 4 {
                [255, 255, 255, 255]
            } else {
                [0, 0, 0, 255]
            }
        });
        let mut h = Harness::new(image);
        let mut converter = h.converter(Dimensions::new(8, 8));
        h.render(&mut converter).unwrap();
        let frame = converter.frame();

        assert_eq!(frame.y[0], 255);
        assert_eq!(frame.y[63], 0);
    }

    #[test]
    fn i420_layout_concatenates_planes() {
        let mut h = Harness::new(RgbaImage::solid(8, 8, [0, 0, 0, 255]));
        let mut converter = h.converter(Dimensions::new(8, 8));
        h.render(&mut converter).unwrap();
        let frame = converter.frame();

        let i420 = frame.to_i420();
        assert_eq!(i420.len(), 64 + 16 + 16);
        assert_eq!(i420[0], 0);
        assert_near(i420[64], 128);
        assert_near(i420[80], 128);
    }

    #[test]
    fn render_without_current_context_fails_the_frame() {
        let mut h = Harness::without_current_context(RgbaImage::solid(8, 8, [255; 4]));
        let mut converter = h.converter(Dimensions::new(8, 8));
        let err = h.render(&mut converter).unwrap_err();
        assert!(matches!(
            err,
            CastcapError::RenderFailed {
                code: GL_INVALID_OPERATION
            }
        ));
        assert!(!err.is_gpu_setup());
    }

    #[test]
    fn buffers_survive_delete() {
        let mut h = Harness::new(RgbaImage::solid(16, 8, [10, 20, 30, 255]));
        let mut converter = h.converter(Dimensions::new(16, 8));
        h.render(&mut converter).unwrap();

        let buffers = converter.delete(&mut h.api);
        assert_eq!(buffers.y.len(), 128);
        assert_eq!(buffers.u.len(), 32);
        assert_eq!(buffers.v.len(), 32);

        let gl = h.finish();
        assert!(gl.live_objects().is_empty());
    }

    #[test]
    fn failed_pass_rolls_back_earlier_passes() {
        let mut h = Harness::new(RgbaImage::solid(8, 8, [0, 0, 0, 255]));
        // Y and U compile, V fails.
        h.gl.fail_after(FailurePoint::ShaderCompile(ShaderStage::Fragment), 2);
        let luma = Dimensions::new(8, 8);
        let err = ColorConverter::new(&mut h.api, luma, luma.half(), PlaneBuffers::default())
            .unwrap_err();
        assert!(matches!(err, CastcapError::ShaderCompileFailed { .. }));

        let gl = h.finish();
        assert!(gl.live_objects().is_empty());
    }
}
