//! The EGL + OpenGL ES 3 subset the converter needs.
//!
//! Handles are plain integer names, as in the C API. Every method must be
//! called from the thread that owns the rendering context.

use std::fmt;

use castcap_platform_core::{Dimensions, ExternalTextureId, TexMatrix};

pub const EGL_SUCCESS: i32 = 0x3000;
pub const EGL_NOT_INITIALIZED: i32 = 0x3001;
pub const EGL_BAD_ALLOC: i32 = 0x3003;
pub const EGL_BAD_CONFIG: i32 = 0x3005;
pub const EGL_BAD_CONTEXT: i32 = 0x3006;
pub const EGL_BAD_MATCH: i32 = 0x3009;
pub const EGL_BAD_SURFACE: i32 = 0x300D;
pub const EGL_CONTEXT_LOST: i32 = 0x300E;

pub const GL_FRAMEBUFFER_COMPLETE: u32 = 0x8CD5;
pub const GL_FRAMEBUFFER_INCOMPLETE_ATTACHMENT: u32 = 0x8CD6;

pub const GL_NO_ERROR: u32 = 0;
pub const GL_INVALID_OPERATION: u32 = 0x0502;

/// Texture unit the capture texture is bound to.
pub const CAPTURE_TEXTURE_UNIT: u32 = 0;

macro_rules! gl_handle {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub u32);
        )*
    };
}

gl_handle!(
    /// `EGLDisplay`
    DisplayHandle,
    /// `EGLConfig`
    ConfigHandle,
    /// `EGLContext`
    ContextHandle,
    /// `EGLSurface`
    SurfaceHandle,
    /// 2D texture name
    TextureId,
    /// Framebuffer object name
    FramebufferId,
    /// Shader object name
    ShaderId,
    /// Program object name
    ProgramId,
    /// Buffer object name
    BufferId,
);

/// Shader pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// Attributes requested from `eglChooseConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRequest {
    pub red_bits: u8,
    pub green_bits: u8,
    pub blue_bits: u8,
    pub alpha_bits: u8,
    /// `EGL_RENDERABLE_TYPE` includes `EGL_OPENGL_ES3_BIT`.
    pub es3_renderable: bool,
    /// `EGL_SURFACE_TYPE` includes `EGL_PBUFFER_BIT`.
    pub pbuffer: bool,
}

impl ConfigRequest {
    /// 8-bit RGBA, ES3, off-screen.
    pub const RGBA8888_ES3: ConfigRequest = ConfigRequest {
        red_bits: 8,
        green_bits: 8,
        blue_bits: 8,
        alpha_bits: 8,
        es3_renderable: true,
        pbuffer: true,
    };
}

/// EGL and GLES entry points used by the capture pipeline.
pub trait GlesApi: Send {
    // -- EGL --------------------------------------------------------------

    /// `eglGetDisplay(EGL_DEFAULT_DISPLAY)`; `None` for `EGL_NO_DISPLAY`.
    fn default_display(&mut self) -> Option<DisplayHandle>;

    /// `eglInitialize`.
    fn initialize_display(&mut self, display: DisplayHandle) -> bool;

    /// `eglChooseConfig`, first match only.
    fn choose_config(
        &mut self,
        display: DisplayHandle,
        request: &ConfigRequest,
    ) -> Option<ConfigHandle>;

    /// `eglCreateContext` for client version 3 with no share context.
    fn create_context(
        &mut self,
        display: DisplayHandle,
        config: ConfigHandle,
    ) -> Option<ContextHandle>;

    /// `eglCreatePbufferSurface`.
    fn create_pbuffer_surface(
        &mut self,
        display: DisplayHandle,
        config: ConfigHandle,
        size: Dimensions,
    ) -> Option<SurfaceHandle>;

    /// `eglMakeCurrent` with the same surface for draw and read.
    fn make_current(
        &mut self,
        display: DisplayHandle,
        surface: SurfaceHandle,
        context: ContextHandle,
    ) -> bool;

    /// `eglMakeCurrent(display, NO_SURFACE, NO_SURFACE, NO_CONTEXT)`.
    fn release_current(&mut self, display: DisplayHandle) -> bool;

    fn destroy_surface(&mut self, display: DisplayHandle, surface: SurfaceHandle) -> bool;

    fn destroy_context(&mut self, display: DisplayHandle, context: ContextHandle) -> bool;

    /// `eglTerminate`.
    fn terminate(&mut self, display: DisplayHandle) -> bool;

    /// `eglGetError`; reading it resets it to `EGL_SUCCESS`.
    fn egl_error(&mut self) -> i32;

    // -- GLES -------------------------------------------------------------

    /// External OES texture with linear filtering and clamp-to-edge wrap.
    fn create_external_texture(&mut self) -> ExternalTextureId;

    /// Single-channel 8-bit render texture.
    fn create_plane_texture(&mut self, size: Dimensions) -> TextureId;

    /// Framebuffer with `texture` as color attachment 0.
    fn create_framebuffer(&mut self, texture: TextureId) -> FramebufferId;

    /// `glCheckFramebufferStatus` for `framebuffer`.
    fn framebuffer_status(&mut self, framebuffer: FramebufferId) -> u32;

    /// Compile a shader; `Err` carries the info log.
    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderId, String>;

    /// Attach both stages and link; `Err` carries the info log.
    fn link_program(&mut self, vertex: ShaderId, fragment: ShaderId) -> Result<ProgramId, String>;

    fn attrib_location(&mut self, program: ProgramId, name: &str) -> Option<u32>;

    fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<i32>;

    /// Static `GL_ARRAY_BUFFER` filled with `data`.
    fn create_vertex_buffer(&mut self, data: &[f32]) -> BufferId;

    fn bind_framebuffer(&mut self, framebuffer: FramebufferId);

    fn viewport(&mut self, size: Dimensions);

    fn use_program(&mut self, program: ProgramId);

    fn uniform_matrix4(&mut self, location: i32, matrix: &TexMatrix);

    fn uniform_vec2(&mut self, location: i32, x: f32, y: f32);

    fn uniform_sampler(&mut self, location: i32, unit: u32);

    fn bind_external_texture(&mut self, unit: u32, texture: ExternalTextureId);

    fn bind_vertex_buffer(&mut self, buffer: BufferId);

    /// Enable `location` and point it at float components in the bound
    /// vertex buffer.
    fn vertex_attrib(&mut self, location: u32, components: u32, stride_bytes: u32, offset_bytes: u32);

    fn draw_triangle_strip(&mut self, first: u32, count: u32);

    /// `glGetError`; reading it resets it to `GL_NO_ERROR`.
    fn gl_error(&mut self) -> u32;

    /// Read the bound framebuffer's single channel, row by row from the
    /// framebuffer origin, into `out[..size.pixel_count()]`.
    fn read_pixels(&mut self, size: Dimensions, out: &mut [u8]);

    fn delete_shader(&mut self, shader: ShaderId);

    fn delete_program(&mut self, program: ProgramId);

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);

    fn delete_texture(&mut self, texture: TextureId);

    fn delete_external_texture(&mut self, texture: ExternalTextureId);

    fn delete_buffer(&mut self, buffer: BufferId);
}
