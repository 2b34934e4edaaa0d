//! Rendering Context Manager.
//!
//! A [`GpuSession`] owns everything GPU-side for one capture session: the
//! EGL display, config, context and pbuffer surface, the external capture
//! texture, the quad vertex buffer and the color converter. It is built
//! whole by [`GpuSession::initialize`] and destroyed whole by
//! [`GpuSession::teardown`]; there is no half-initialized session.

use castcap_common::error::{CastcapError, CastcapResult};
use castcap_platform_core::{scale, Dimensions, DisplayMetrics, ExternalTextureId, TexMatrix};
use serde::{Deserialize, Serialize};

use crate::converter::{ColorConverter, PlanarFrame};
use crate::gles::{
    BufferId, ConfigRequest, ContextHandle, DisplayHandle, GlesApi, SurfaceHandle,
};
use crate::shaders::ShaderProgram;
use crate::target::PlaneBuffers;

/// Source, scaled luma and chroma extents of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDimensions {
    /// Size the platform renders the capture image at.
    pub source: Dimensions,
    /// Luma plane size after negotiation.
    pub scaled: Dimensions,
    /// U and V plane size.
    pub chroma: Dimensions,
}

impl CaptureDimensions {
    pub fn negotiate(source: Dimensions, max: Dimensions) -> Self {
        let scaled = scale(source, max);
        Self {
            source,
            scaled,
            chroma: scaled.half(),
        }
    }
}

/// Inputs to [`GpuSession::initialize`].
#[derive(Debug, Clone, Copy)]
pub struct InitRequest {
    /// Maximum capture size, orientation-agnostic.
    pub target: Dimensions,
    /// Source size to use instead of the display's physical size.
    pub suggested: Option<Dimensions>,
    pub metrics: DisplayMetrics,
}

impl InitRequest {
    pub fn dimensions(&self) -> CaptureDimensions {
        let source = self.suggested.unwrap_or_else(|| self.metrics.dimensions());
        CaptureDimensions::negotiate(source, self.target)
    }
}

/// Full-screen quad as a triangle strip: bottom-left, bottom-right,
/// top-left, top-right. Each vertex is `x, y, u, v`.
pub const QUAD_VERTICES: [f32; 16] = [
    -1.0, -1.0, 0.0, 0.0, //
    1.0, -1.0, 1.0, 0.0, //
    -1.0, 1.0, 0.0, 1.0, //
    1.0, 1.0, 1.0, 1.0,
];

/// The static quad vertex buffer.
#[derive(Debug)]
pub struct QuadBuffer {
    buffer: BufferId,
}

impl QuadBuffer {
    pub const VERTEX_COUNT: u32 = 4;
    const FLOATS_PER_VERTEX: u32 = 4;
    const STRIDE_BYTES: u32 = Self::FLOATS_PER_VERTEX * 4;
    const TEX_COORD_OFFSET_BYTES: u32 = 2 * 4;

    pub fn new(gl: &mut dyn GlesApi) -> Self {
        Self {
            buffer: gl.create_vertex_buffer(&QUAD_VERTICES),
        }
    }

    /// Bind the buffer and point `program`'s attributes into it.
    pub fn bind(&self, gl: &mut dyn GlesApi, program: &ShaderProgram) {
        gl.bind_vertex_buffer(self.buffer);
        gl.vertex_attrib(program.a_position, 2, Self::STRIDE_BYTES, 0);
        gl.vertex_attrib(
            program.a_tex_coord,
            2,
            Self::STRIDE_BYTES,
            Self::TEX_COORD_OFFSET_BYTES,
        );
    }

    pub fn delete(self, gl: &mut dyn GlesApi) {
        gl.delete_buffer(self.buffer);
    }
}

/// EGL objects of a session.
#[derive(Debug, Clone, Copy)]
struct RenderContext {
    display: DisplayHandle,
    context: ContextHandle,
    surface: SurfaceHandle,
}

/// What a teardown left behind.
#[derive(Debug)]
pub struct TeardownOutcome {
    /// Host plane buffers, for reuse by the next session.
    pub buffers: PlaneBuffers,
    /// Set when the context could not be made current for cleanup. GPU
    /// objects were then released on a best-effort basis only.
    pub make_current_error: Option<CastcapError>,
}

/// GPU resources of one live capture session.
#[derive(Debug)]
pub struct GpuSession {
    context: RenderContext,
    dims: CaptureDimensions,
    external: ExternalTextureId,
    quad: QuadBuffer,
    converter: ColorConverter,
    context_suspect: bool,
}

/// Resources created so far by an initialization in progress.
#[derive(Debug, Default)]
struct PartialSession {
    display: Option<DisplayHandle>,
    context: Option<ContextHandle>,
    surface: Option<SurfaceHandle>,
    current: bool,
    external: Option<ExternalTextureId>,
}

impl PartialSession {
    /// Undo everything in reverse creation order.
    fn rollback(self, gl: &mut dyn GlesApi) {
        if let Some(external) = self.external {
            gl.delete_external_texture(external);
        }
        let Some(display) = self.display else {
            return;
        };
        if self.current {
            gl.release_current(display);
        }
        if let Some(surface) = self.surface {
            gl.destroy_surface(display, surface);
        }
        if let Some(context) = self.context {
            gl.destroy_context(display, context);
        }
        gl.terminate(display);
        tracing::debug!("Partial GPU session rolled back");
    }
}

impl GpuSession {
    /// Create the context, surface, texture, programs, targets and quad,
    /// then release the context from the calling thread.
    ///
    /// `buffers` are adopted as the plane readback buffers. On failure,
    /// everything created so far is destroyed before returning.
    pub fn initialize(
        gl: &mut dyn GlesApi,
        request: &InitRequest,
        buffers: PlaneBuffers,
    ) -> CastcapResult<Self> {
        let mut partial = PartialSession::default();
        match Self::build(gl, request, buffers, &mut partial) {
            Ok(session) => {
                let dims = session.dims;
                tracing::info!(
                    source = %dims.source,
                    scaled = %dims.scaled,
                    chroma = %dims.chroma,
                    "GPU session initialized"
                );
                Ok(session)
            }
            Err(e) => {
                tracing::error!(error = %e, "GPU session initialization failed");
                partial.rollback(gl);
                Err(e)
            }
        }
    }

    fn build(
        gl: &mut dyn GlesApi,
        request: &InitRequest,
        buffers: PlaneBuffers,
        partial: &mut PartialSession,
    ) -> CastcapResult<Self> {
        let display = gl
            .default_display()
            .ok_or(CastcapError::ContextUnavailable)?;
        if !gl.initialize_display(display) {
            return Err(CastcapError::ContextUnavailable);
        }
        partial.display = Some(display);

        let config = gl
            .choose_config(display, &ConfigRequest::RGBA8888_ES3)
            .ok_or(CastcapError::ConfigurationUnsupported)?;

        let context = match gl.create_context(display, config) {
            Some(context) => context,
            None => {
                return Err(CastcapError::ContextCreationFailed {
                    code: gl.egl_error(),
                })
            }
        };
        partial.context = Some(context);

        let dims = request.dimensions();

        let surface = match gl.create_pbuffer_surface(display, config, dims.scaled) {
            Some(surface) => surface,
            None => {
                return Err(CastcapError::SurfaceCreationFailed {
                    code: gl.egl_error(),
                })
            }
        };
        partial.surface = Some(surface);

        if !gl.make_current(display, surface, context) {
            return Err(CastcapError::MakeCurrentFailed {
                code: gl.egl_error(),
            });
        }
        partial.current = true;

        let external = gl.create_external_texture();
        partial.external = Some(external);

        let converter = ColorConverter::new(gl, dims.scaled, dims.chroma, buffers)?;
        let quad = QuadBuffer::new(gl);

        if !gl.release_current(display) {
            tracing::warn!(code = gl.egl_error(), "Failed to release context after setup");
        }

        Ok(Self {
            context: RenderContext {
                display,
                context,
                surface,
            },
            dims,
            external,
            quad,
            converter,
            context_suspect: false,
        })
    }

    pub fn dimensions(&self) -> CaptureDimensions {
        self.dims
    }

    /// Texture the platform capture surface should feed.
    pub fn external_texture(&self) -> ExternalTextureId {
        self.external
    }

    /// Whether the last make-current on this session failed.
    pub fn is_context_suspect(&self) -> bool {
        self.context_suspect
    }

    /// Bind the session's context to the calling thread.
    pub fn make_current(&mut self, gl: &mut dyn GlesApi) -> CastcapResult<()> {
        let ctx = self.context;
        if gl.make_current(ctx.display, ctx.surface, ctx.context) {
            self.context_suspect = false;
            Ok(())
        } else {
            self.context_suspect = true;
            Err(CastcapError::MakeCurrentFailed {
                code: gl.egl_error(),
            })
        }
    }

    pub fn release_current(&mut self, gl: &mut dyn GlesApi) {
        if !gl.release_current(self.context.display) {
            tracing::warn!(code = gl.egl_error(), "Failed to release rendering context");
        }
    }

    /// Convert the current capture image. The context must be current.
    pub fn render(
        &mut self,
        gl: &mut dyn GlesApi,
        matrix: &TexMatrix,
    ) -> CastcapResult<PlanarFrame<'_>> {
        self.converter
            .render(gl, self.external, &self.quad, matrix, self.dims.source)?;
        Ok(self.converter.frame())
    }

    /// Destroy the session: release the context, make it current once more
    /// to delete GPU objects, release it again, then destroy the surface and
    /// context and terminate the display.
    ///
    /// If the final make-current fails, GL objects are presumed gone with
    /// the context and only the EGL objects are destroyed.
    pub fn teardown(self, gl: &mut dyn GlesApi) -> TeardownOutcome {
        let GpuSession {
            context: ctx,
            dims,
            external,
            quad,
            converter,
            ..
        } = self;

        gl.release_current(ctx.display);

        let (buffers, make_current_error) =
            if gl.make_current(ctx.display, ctx.surface, ctx.context) {
                gl.delete_external_texture(external);
                quad.delete(gl);
                let buffers = converter.delete(gl);
                gl.release_current(ctx.display);
                (buffers, None)
            } else {
                let err = CastcapError::MakeCurrentFailed {
                    code: gl.egl_error(),
                };
                tracing::warn!(error = %err, "Context lost during teardown, releasing best-effort");
                (converter.abandon(), Some(err))
            };

        if !gl.destroy_surface(ctx.display, ctx.surface) {
            tracing::warn!(code = gl.egl_error(), "Failed to destroy surface");
        }
        if !gl.destroy_context(ctx.display, ctx.context) {
            tracing::warn!(code = gl.egl_error(), "Failed to destroy context");
        }
        if !gl.terminate(ctx.display) {
            tracing::warn!(code = gl.egl_error(), "Failed to terminate display");
        }

        tracing::info!(scaled = %dims.scaled, "GPU session torn down");
        TeardownOutcome {
            buffers,
            make_current_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gles::ShaderStage;
    use crate::software::{FailurePoint, RgbaImage, SoftwareGles};

    fn request(source: Dimensions) -> InitRequest {
        InitRequest {
            target: source,
            suggested: Some(source),
            metrics: DisplayMetrics {
                width: 1080,
                height: 2400,
                density_dpi: 420,
            },
        }
    }

    #[test]
    fn dimensions_fall_back_to_display_metrics() {
        let mut req = request(Dimensions::new(640, 480));
        req.target = Dimensions::new(1920, 1080);
        req.suggested = None;
        let dims = req.dimensions();
        assert_eq!(dims.source, Dimensions::new(1080, 2400));
        assert_eq!(dims.scaled, scale(dims.source, req.target));
        assert_eq!(dims.chroma, dims.scaled.half());
    }

    #[test]
    fn initialize_then_teardown_leaves_nothing_live() {
        let gl = SoftwareGles::new();
        let mut api = gl.clone();
        let session =
            GpuSession::initialize(&mut api, &request(Dimensions::new(64, 48)), PlaneBuffers::default())
                .unwrap();
        assert_eq!(session.dimensions().scaled, Dimensions::new(64, 48));
        assert!(!gl.is_current(), "context released after setup");

        let outcome = session.teardown(&mut api);
        assert!(outcome.make_current_error.is_none());
        assert!(gl.live_objects().is_empty());
    }

    #[test]
    fn render_produces_planes_of_negotiated_size() {
        let gl = SoftwareGles::new();
        let mut api = gl.clone();
        let mut session =
            GpuSession::initialize(&mut api, &request(Dimensions::new(80, 40)), PlaneBuffers::default())
                .unwrap();
        gl.store().publish(
            session.external_texture(),
            RgbaImage::solid(80, 40, [255, 255, 255, 255]),
        );

        session.make_current(&mut api).unwrap();
        let frame = session.render(&mut api, &TexMatrix::IDENTITY).unwrap();
        assert_eq!((frame.width, frame.height), (80, 40));
        assert_eq!(frame.u.len(), 40 * 20);
        assert!(frame.y.iter().all(|&y| y == 255));
        session.release_current(&mut api);

        session.teardown(&mut api);
    }

    #[test]
    fn buffers_carry_over_between_sessions() {
        let gl = SoftwareGles::new();
        let mut api = gl.clone();
        let mut session =
            GpuSession::initialize(&mut api, &request(Dimensions::new(64, 64)), PlaneBuffers::default())
                .unwrap();
        session.make_current(&mut api).unwrap();
        session.render(&mut api, &TexMatrix::IDENTITY).unwrap();
        let buffers = session.teardown(&mut api).buffers;
        let capacity = buffers.capacity();

        let session =
            GpuSession::initialize(&mut api, &request(Dimensions::new(32, 32)), buffers).unwrap();
        let buffers = session.teardown(&mut api).buffers;
        assert!(buffers.capacity() >= capacity);
    }

    fn expected_error(point: FailurePoint, err: &CastcapError) -> bool {
        match point {
            FailurePoint::NoDisplay | FailurePoint::DisplayInit => {
                matches!(err, CastcapError::ContextUnavailable)
            }
            FailurePoint::NoMatchingConfig => matches!(err, CastcapError::ConfigurationUnsupported),
            FailurePoint::ContextCreation => {
                matches!(err, CastcapError::ContextCreationFailed { .. })
            }
            FailurePoint::SurfaceCreation => {
                matches!(err, CastcapError::SurfaceCreationFailed { .. })
            }
            FailurePoint::MakeCurrent => matches!(err, CastcapError::MakeCurrentFailed { .. }),
            FailurePoint::ShaderCompile(stage) => matches!(
                err,
                CastcapError::ShaderCompileFailed { stage: s, .. } if *s == stage.to_string()
            ),
            FailurePoint::ProgramLink => matches!(err, CastcapError::ProgramLinkFailed { .. }),
            FailurePoint::FramebufferIncomplete => {
                matches!(err, CastcapError::FramebufferIncomplete { .. })
            }
        }
    }

    #[test]
    fn each_setup_failure_maps_to_its_error_and_rolls_back() {
        let points = [
            FailurePoint::NoDisplay,
            FailurePoint::DisplayInit,
            FailurePoint::NoMatchingConfig,
            FailurePoint::ContextCreation,
            FailurePoint::SurfaceCreation,
            FailurePoint::MakeCurrent,
            FailurePoint::ShaderCompile(ShaderStage::Vertex),
            FailurePoint::ShaderCompile(ShaderStage::Fragment),
            FailurePoint::ProgramLink,
            FailurePoint::FramebufferIncomplete,
        ];

        for point in points {
            let gl = SoftwareGles::new();
            gl.fail_next(point);
            let mut api = gl.clone();
            let err = GpuSession::initialize(
                &mut api,
                &request(Dimensions::new(64, 48)),
                PlaneBuffers::default(),
            )
            .unwrap_err();
            assert!(expected_error(point, &err), "{point:?} produced {err:?}");
            assert!(
                gl.live_objects().is_empty(),
                "{point:?} leaked {:?}",
                gl.live_objects()
            );
        }
    }

    #[test]
    fn lost_context_is_reported_by_make_current_and_teardown() {
        let gl = SoftwareGles::new();
        let mut api = gl.clone();
        let mut session =
            GpuSession::initialize(&mut api, &request(Dimensions::new(64, 48)), PlaneBuffers::default())
                .unwrap();

        gl.lose_context();
        assert!(session.make_current(&mut api).is_err());
        assert!(session.is_context_suspect());

        let outcome = session.teardown(&mut api);
        assert!(matches!(
            outcome.make_current_error,
            Some(CastcapError::MakeCurrentFailed { .. })
        ));
        let live = gl.live_objects();
        assert_eq!((live.contexts, live.surfaces), (0, 0));
    }
}
