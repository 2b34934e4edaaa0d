//! CPU reference implementation of [`GlesApi`].
//!
//! `SoftwareGles` executes the conversion programs on the CPU so the whole
//! capture pipeline runs without a GPU. Programs are interpreted from their
//! source: the fragment stage's `COEFF` vector gives the dot product, and a
//! `uSourceSize` uniform marks the chroma variant that averages four samples
//! one source texel apart. External textures are read from an
//! [`ExternalImageStore`] and sampled bilinearly with clamp-to-edge, as the
//! real sampler is configured.
//!
//! Drawing or reading back without a current context records
//! `GL_INVALID_OPERATION`, reported by [`GlesApi::gl_error`].
//!
//! Handles are cheap clones sharing one state, so a test can keep a handle
//! for inspection ([`SoftwareGles::live_objects`], [`SoftwareGles::call_count`])
//! and failure injection while the pipeline owns another.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use castcap_platform_core::{Dimensions, ExternalTextureId, TexMatrix};
use parking_lot::{Mutex, MutexGuard};

use crate::gles::{
    BufferId, ConfigHandle, ConfigRequest, ContextHandle, DisplayHandle, FramebufferId, GlesApi,
    ProgramId, ShaderId, ShaderStage, SurfaceHandle, TextureId, EGL_BAD_ALLOC, EGL_BAD_CONTEXT,
    EGL_BAD_MATCH, EGL_BAD_SURFACE, EGL_CONTEXT_LOST, EGL_SUCCESS, GL_FRAMEBUFFER_COMPLETE,
    GL_FRAMEBUFFER_INCOMPLETE_ATTACHMENT, GL_INVALID_OPERATION, GL_NO_ERROR,
};

const DEFAULT_DISPLAY: DisplayHandle = DisplayHandle(1);
const RGBA8888_ES3_CONFIG: ConfigHandle = ConfigHandle(1);

/// 8-bit RGBA image, row 0 at texture coordinate `v = 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RgbaImage {
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self::from_fn(width, height, |_, _| rgba)
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&f(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// Tightly packed RGBA rows, top row first.
    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    /// Bilinear, clamp-to-edge sample of the RGB channels in `[0, 1]`.
    fn sample(&self, u: f32, v: f32) -> [f32; 3] {
        if self.width == 0 || self.height == 0 {
            return [0.0; 3];
        }
        let x = u * self.width as f32 - 0.5;
        let y = v * self.height as f32 - 0.5;
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;

        let clamp_x = |x: f32| x.clamp(0.0, (self.width - 1) as f32) as u32;
        let clamp_y = |y: f32| y.clamp(0.0, (self.height - 1) as f32) as u32;
        let (xa, xb) = (clamp_x(x0), clamp_x(x0 + 1.0));
        let (ya, yb) = (clamp_y(y0), clamp_y(y0 + 1.0));

        let texel = |x: u32, y: u32| {
            let p = self.pixel(x, y);
            [p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0]
        };
        let (p00, p10, p01, p11) = (texel(xa, ya), texel(xb, ya), texel(xa, yb), texel(xb, yb));

        let mut out = [0.0; 3];
        for c in 0..3 {
            let top = p00[c] + (p10[c] - p00[c]) * fx;
            let bottom = p01[c] + (p11[c] - p01[c]) * fx;
            out[c] = top + (bottom - top) * fy;
        }
        out
    }
}

/// Images currently held by external textures.
///
/// The producer side (a platform capture surface) publishes into it; the
/// sampler reads from it at draw time.
#[derive(Debug, Clone, Default)]
pub struct ExternalImageStore {
    images: Arc<Mutex<HashMap<ExternalTextureId, Arc<RgbaImage>>>>,
}

impl ExternalImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the image behind `texture`.
    pub fn publish(&self, texture: ExternalTextureId, image: RgbaImage) {
        self.images.lock().insert(texture, Arc::new(image));
    }

    pub fn get(&self, texture: ExternalTextureId) -> Option<Arc<RgbaImage>> {
        self.images.lock().get(&texture).cloned()
    }

    pub fn remove(&self, texture: ExternalTextureId) {
        self.images.lock().remove(&texture);
    }
}

/// A call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// `default_display` returns no display.
    NoDisplay,
    /// `initialize_display` fails.
    DisplayInit,
    /// `choose_config` finds nothing.
    NoMatchingConfig,
    ContextCreation,
    SurfaceCreation,
    MakeCurrent,
    ShaderCompile(ShaderStage),
    ProgramLink,
    /// Next framebuffer reports `GL_FRAMEBUFFER_INCOMPLETE_ATTACHMENT`.
    FramebufferIncomplete,
}

/// Count of objects created and not yet deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub displays: usize,
    pub contexts: usize,
    pub surfaces: usize,
    pub shaders: usize,
    pub programs: usize,
    pub textures: usize,
    pub external_textures: usize,
    pub framebuffers: usize,
    pub buffers: usize,
}

impl LiveObjects {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy)]
struct Coefficients {
    rgb: [f32; 3],
    offset: f32,
}

#[derive(Debug)]
struct Shader {
    stage: ShaderStage,
    /// Vertex attribute names; empty for fragment shaders.
    inputs: Vec<String>,
    uniforms: Vec<String>,
    coefficients: Option<Coefficients>,
    box_filter: bool,
}

#[derive(Debug)]
struct Program {
    attribs: Vec<String>,
    uniforms: Vec<String>,
    coefficients: Coefficients,
    box_filter: bool,
    matrix: TexMatrix,
    source_size: (f32, f32),
}

impl Program {
    fn uniform_index(&self, name: &str) -> Option<i32> {
        self.uniforms
            .iter()
            .position(|u| u == name)
            .map(|i| i as i32)
    }
}

#[derive(Debug)]
struct PlaneTexture {
    size: Dimensions,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct AttribPointer {
    components: u32,
    stride_bytes: u32,
    offset_bytes: u32,
}

#[derive(Debug, Default)]
struct State {
    next_name: u32,
    calls: u64,
    egl_error: i32,
    gl_error: u32,
    failures: VecDeque<(FailurePoint, u32)>,
    context_lost: bool,

    display_initialized: bool,
    contexts: HashSet<u32>,
    surfaces: HashMap<u32, Dimensions>,
    current: Option<(SurfaceHandle, ContextHandle)>,

    shaders: HashMap<u32, Shader>,
    programs: HashMap<u32, Program>,
    textures: HashMap<u32, PlaneTexture>,
    external_textures: HashSet<u32>,
    framebuffers: HashMap<u32, u32>,
    buffers: HashMap<u32, Vec<f32>>,

    bound_framebuffer: Option<u32>,
    viewport: Option<Dimensions>,
    program_in_use: Option<u32>,
    external_units: HashMap<u32, ExternalTextureId>,
    vertex_buffer: Option<u32>,
    attribs: HashMap<u32, AttribPointer>,
}

impl State {
    fn name(&mut self) -> u32 {
        self.next_name += 1;
        self.next_name
    }

    /// Consume a queued failure for `point` if one is due.
    fn should_fail(&mut self, point: FailurePoint) -> bool {
        let Some(index) = self.failures.iter().position(|(p, _)| *p == point) else {
            return false;
        };
        match self.failures.get_mut(index) {
            Some((_, skip)) if *skip > 0 => {
                *skip -= 1;
                false
            }
            _ => {
                self.failures.remove(index);
                true
            }
        }
    }

    fn fail_egl(&mut self, code: i32) {
        self.egl_error = code;
    }

    /// Like `glGetError`, only the first error is kept until read.
    fn fail_gl(&mut self, code: u32) {
        if self.gl_error == GL_NO_ERROR {
            self.gl_error = code;
        }
    }

    /// Drop every GL object, as destroying a lost context does.
    fn discard_gl_objects(&mut self) {
        self.shaders.clear();
        self.programs.clear();
        self.textures.clear();
        self.external_textures.clear();
        self.framebuffers.clear();
        self.buffers.clear();
    }
}

/// CPU-backed EGL/GLES for tests and the simulator.
#[derive(Debug, Clone, Default)]
pub struct SoftwareGles {
    state: Arc<Mutex<State>>,
    store: ExternalImageStore,
}

impl SoftwareGles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend sampling external textures from `store`.
    pub fn with_store(store: ExternalImageStore) -> Self {
        Self {
            state: Arc::default(),
            store,
        }
    }

    pub fn store(&self) -> ExternalImageStore {
        self.store.clone()
    }

    /// Make the next call at `point` fail.
    pub fn fail_next(&self, point: FailurePoint) {
        self.fail_after(point, 0);
    }

    /// Let `skip` calls at `point` succeed, then fail the one after.
    pub fn fail_after(&self, point: FailurePoint, skip: u32) {
        self.state.lock().failures.push_back((point, skip));
    }

    /// Simulate a lost context: every `make_current` fails until
    /// [`restore_context`](Self::restore_context).
    pub fn lose_context(&self) {
        self.state.lock().context_lost = true;
    }

    pub fn restore_context(&self) {
        self.state.lock().context_lost = false;
    }

    pub fn is_current(&self) -> bool {
        self.state.lock().current.is_some()
    }

    pub fn live_objects(&self) -> LiveObjects {
        let s = self.state.lock();
        LiveObjects {
            displays: usize::from(s.display_initialized),
            contexts: s.contexts.len(),
            surfaces: s.surfaces.len(),
            shaders: s.shaders.len(),
            programs: s.programs.len(),
            textures: s.textures.len(),
            external_textures: s.external_textures.len(),
            framebuffers: s.framebuffers.len(),
            buffers: s.buffers.len(),
        }
    }

    /// Number of API calls made through any handle.
    pub fn call_count(&self) -> u64 {
        self.state.lock().calls
    }

    fn call(&self) -> MutexGuard<'_, State> {
        let mut s = self.state.lock();
        s.calls += 1;
        s
    }
}

/// Parse the `COEFF` vector of a conversion fragment shader.
fn parse_coefficients(source: &str) -> Option<Coefficients> {
    let start = source.find("COEFF = vec4(")? + "COEFF = vec4(".len();
    let end = start + source[start..].find(')')?;
    let values: Vec<f32> = source[start..end]
        .split(',')
        .map(|v| v.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .ok()?;
    match values.as_slice() {
        [r, g, b, offset] => Some(Coefficients {
            rgb: [*r, *g, *b],
            offset: *offset,
        }),
        _ => None,
    }
}

/// Names declared by lines starting with `keyword`.
fn declared_names(source: &str, keyword: &str) -> Vec<String> {
    source
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(keyword))
        .filter_map(|line| line.trim_end_matches(';').split_whitespace().last())
        .map(str::to_string)
        .collect()
}

/// Read attribute `pointer` of vertex `index` as two floats.
fn vertex_pair(data: &[f32], pointer: AttribPointer, index: u32) -> Option<(f32, f32)> {
    if pointer.components < 2 {
        return None;
    }
    let base = (pointer.offset_bytes / 4 + index * pointer.stride_bytes / 4) as usize;
    Some((*data.get(base)?, *data.get(base + 1)?))
}

/// Affine map along one axis derived from the two quad edges.
#[derive(Debug, Clone, Copy)]
struct AxisMap {
    from: f32,
    to: f32,
    scale: f32,
}

impl AxisMap {
    fn between(a: (f32, f32), b: (f32, f32)) -> Option<Self> {
        let span = b.0 - a.0;
        if span.abs() < f32::EPSILON {
            return None;
        }
        Some(Self {
            from: a.0,
            to: a.1,
            scale: (b.1 - a.1) / span,
        })
    }

    fn apply(&self, x: f32) -> f32 {
        self.to + (x - self.from) * self.scale
    }
}

impl GlesApi for SoftwareGles {
    fn default_display(&mut self) -> Option<DisplayHandle> {
        let mut s = self.call();
        if s.should_fail(FailurePoint::NoDisplay) {
            return None;
        }
        Some(DEFAULT_DISPLAY)
    }

    fn initialize_display(&mut self, display: DisplayHandle) -> bool {
        let mut s = self.call();
        if display != DEFAULT_DISPLAY || s.should_fail(FailurePoint::DisplayInit) {
            s.fail_egl(crate::gles::EGL_NOT_INITIALIZED);
            return false;
        }
        s.display_initialized = true;
        true
    }

    fn choose_config(
        &mut self,
        display: DisplayHandle,
        request: &ConfigRequest,
    ) -> Option<ConfigHandle> {
        let mut s = self.call();
        if display != DEFAULT_DISPLAY
            || !s.display_initialized
            || s.should_fail(FailurePoint::NoMatchingConfig)
        {
            return None;
        }
        (*request == ConfigRequest::RGBA8888_ES3).then_some(RGBA8888_ES3_CONFIG)
    }

    fn create_context(
        &mut self,
        _display: DisplayHandle,
        config: ConfigHandle,
    ) -> Option<ContextHandle> {
        let mut s = self.call();
        if config != RGBA8888_ES3_CONFIG {
            s.fail_egl(crate::gles::EGL_BAD_CONFIG);
            return None;
        }
        if s.should_fail(FailurePoint::ContextCreation) {
            s.fail_egl(EGL_BAD_ALLOC);
            return None;
        }
        let name = s.name();
        s.contexts.insert(name);
        Some(ContextHandle(name))
    }

    fn create_pbuffer_surface(
        &mut self,
        _display: DisplayHandle,
        config: ConfigHandle,
        size: Dimensions,
    ) -> Option<SurfaceHandle> {
        let mut s = self.call();
        if config != RGBA8888_ES3_CONFIG || !size.is_valid() {
            s.fail_egl(EGL_BAD_MATCH);
            return None;
        }
        if s.should_fail(FailurePoint::SurfaceCreation) {
            s.fail_egl(EGL_BAD_ALLOC);
            return None;
        }
        let name = s.name();
        s.surfaces.insert(name, size);
        Some(SurfaceHandle(name))
    }

    fn make_current(
        &mut self,
        _display: DisplayHandle,
        surface: SurfaceHandle,
        context: ContextHandle,
    ) -> bool {
        let mut s = self.call();
        if s.context_lost {
            s.fail_egl(EGL_CONTEXT_LOST);
            return false;
        }
        if s.should_fail(FailurePoint::MakeCurrent) {
            s.fail_egl(EGL_BAD_CONTEXT);
            return false;
        }
        if !s.surfaces.contains_key(&surface.0) {
            s.fail_egl(EGL_BAD_SURFACE);
            return false;
        }
        if !s.contexts.contains(&context.0) {
            s.fail_egl(EGL_BAD_CONTEXT);
            return false;
        }
        s.current = Some((surface, context));
        true
    }

    fn release_current(&mut self, _display: DisplayHandle) -> bool {
        self.call().current = None;
        true
    }

    fn destroy_surface(&mut self, _display: DisplayHandle, surface: SurfaceHandle) -> bool {
        let mut s = self.call();
        if s.surfaces.remove(&surface.0).is_none() {
            s.fail_egl(EGL_BAD_SURFACE);
            return false;
        }
        true
    }

    fn destroy_context(&mut self, _display: DisplayHandle, context: ContextHandle) -> bool {
        let mut s = self.call();
        if !s.contexts.remove(&context.0) {
            s.fail_egl(EGL_BAD_CONTEXT);
            return false;
        }
        if s.context_lost {
            s.discard_gl_objects();
        }
        true
    }

    fn terminate(&mut self, _display: DisplayHandle) -> bool {
        let mut s = self.call();
        s.display_initialized = false;
        s.current = None;
        true
    }

    fn egl_error(&mut self) -> i32 {
        let mut s = self.call();
        match std::mem::replace(&mut s.egl_error, EGL_SUCCESS) {
            0 => EGL_SUCCESS,
            code => code,
        }
    }

    fn create_external_texture(&mut self) -> ExternalTextureId {
        let mut s = self.call();
        let name = s.name();
        s.external_textures.insert(name);
        ExternalTextureId(name)
    }

    fn create_plane_texture(&mut self, size: Dimensions) -> TextureId {
        let mut s = self.call();
        let name = s.name();
        s.textures.insert(
            name,
            PlaneTexture {
                size,
                data: vec![0; size.pixel_count()],
            },
        );
        TextureId(name)
    }

    fn create_framebuffer(&mut self, texture: TextureId) -> FramebufferId {
        let mut s = self.call();
        let name = s.name();
        s.framebuffers.insert(name, texture.0);
        FramebufferId(name)
    }

    fn framebuffer_status(&mut self, framebuffer: FramebufferId) -> u32 {
        let mut s = self.call();
        if s.should_fail(FailurePoint::FramebufferIncomplete) {
            return GL_FRAMEBUFFER_INCOMPLETE_ATTACHMENT;
        }
        match s.framebuffers.get(&framebuffer.0) {
            Some(texture) if s.textures.contains_key(texture) => GL_FRAMEBUFFER_COMPLETE,
            _ => GL_FRAMEBUFFER_INCOMPLETE_ATTACHMENT,
        }
    }

    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderId, String> {
        let mut s = self.call();
        if s.should_fail(FailurePoint::ShaderCompile(stage)) {
            return Err(format!("ERROR: 0:1: {stage} shader rejected by driver"));
        }
        if !source.trim_start().starts_with("#version 300 es") {
            return Err("ERROR: 0:1: '' : unsupported or missing #version 300 es".to_string());
        }

        let shader = match stage {
            ShaderStage::Vertex => Shader {
                stage,
                inputs: declared_names(source, "in "),
                uniforms: declared_names(source, "uniform "),
                coefficients: None,
                box_filter: false,
            },
            ShaderStage::Fragment => {
                let coefficients = parse_coefficients(source)
                    .ok_or_else(|| "ERROR: 0:1: 'COEFF' : undeclared identifier".to_string())?;
                let uniforms = declared_names(source, "uniform ");
                let box_filter = uniforms.iter().any(|u| u == "uSourceSize");
                Shader {
                    stage,
                    inputs: Vec::new(),
                    uniforms,
                    coefficients: Some(coefficients),
                    box_filter,
                }
            }
        };

        let name = s.name();
        s.shaders.insert(name, shader);
        Ok(ShaderId(name))
    }

    fn link_program(&mut self, vertex: ShaderId, fragment: ShaderId) -> Result<ProgramId, String> {
        let mut s = self.call();
        if s.should_fail(FailurePoint::ProgramLink) {
            return Err("error: varying vTexCoord not written by vertex shader".to_string());
        }
        let (Some(vs), Some(fs)) = (s.shaders.get(&vertex.0), s.shaders.get(&fragment.0)) else {
            return Err("error: invalid shader object".to_string());
        };
        if vs.stage != ShaderStage::Vertex || fs.stage != ShaderStage::Fragment {
            return Err("error: shader stages do not form a pipeline".to_string());
        }
        let coefficients = fs
            .coefficients
            .ok_or_else(|| "error: fragment stage has no output".to_string())?;

        let mut uniforms = vs.uniforms.clone();
        uniforms.extend(fs.uniforms.iter().cloned());
        let program = Program {
            attribs: vs.inputs.clone(),
            uniforms,
            coefficients,
            box_filter: fs.box_filter,
            matrix: TexMatrix::IDENTITY,
            source_size: (1.0, 1.0),
        };

        let name = s.name();
        s.programs.insert(name, program);
        Ok(ProgramId(name))
    }

    fn attrib_location(&mut self, program: ProgramId, name: &str) -> Option<u32> {
        let s = self.call();
        s.programs
            .get(&program.0)?
            .attribs
            .iter()
            .position(|a| a == name)
            .map(|i| i as u32)
    }

    fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<i32> {
        let s = self.call();
        s.programs.get(&program.0)?.uniform_index(name)
    }

    fn create_vertex_buffer(&mut self, data: &[f32]) -> BufferId {
        let mut s = self.call();
        let name = s.name();
        s.buffers.insert(name, data.to_vec());
        BufferId(name)
    }

    fn bind_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.call().bound_framebuffer = Some(framebuffer.0);
    }

    fn viewport(&mut self, size: Dimensions) {
        self.call().viewport = Some(size);
    }

    fn use_program(&mut self, program: ProgramId) {
        self.call().program_in_use = Some(program.0);
    }

    fn uniform_matrix4(&mut self, location: i32, matrix: &TexMatrix) {
        let mut s = self.call();
        let Some(name) = s.program_in_use else { return };
        if let Some(program) = s.programs.get_mut(&name) {
            if program.uniform_index("uTexMatrix") == Some(location) {
                program.matrix = *matrix;
            }
        }
    }

    fn uniform_vec2(&mut self, location: i32, x: f32, y: f32) {
        let mut s = self.call();
        let Some(name) = s.program_in_use else { return };
        if let Some(program) = s.programs.get_mut(&name) {
            if program.uniform_index("uSourceSize") == Some(location) {
                program.source_size = (x, y);
            }
        }
    }

    fn uniform_sampler(&mut self, _location: i32, _unit: u32) {
        let _s = self.call();
    }

    fn bind_external_texture(&mut self, unit: u32, texture: ExternalTextureId) {
        self.call().external_units.insert(unit, texture);
    }

    fn bind_vertex_buffer(&mut self, buffer: BufferId) {
        self.call().vertex_buffer = Some(buffer.0);
    }

    fn vertex_attrib(&mut self, location: u32, components: u32, stride_bytes: u32, offset_bytes: u32) {
        self.call().attribs.insert(
            location,
            AttribPointer {
                components,
                stride_bytes,
                offset_bytes,
            },
        );
    }

    fn draw_triangle_strip(&mut self, first: u32, count: u32) {
        let mut s = self.call();
        if s.current.is_none() {
            s.fail_gl(GL_INVALID_OPERATION);
            return;
        }
        let (Some(fb), Some(viewport), Some(program_name), Some(vb)) = (
            s.bound_framebuffer,
            s.viewport,
            s.program_in_use,
            s.vertex_buffer,
        ) else {
            return;
        };
        let Some(&texture_name) = s.framebuffers.get(&fb) else {
            return;
        };
        let Some(program) = s.programs.get(&program_name) else {
            return;
        };
        let (Some(pos_loc), Some(tc_loc)) = (
            program.attribs.iter().position(|a| a == "aPosition"),
            program.attribs.iter().position(|a| a == "aTexCoord"),
        ) else {
            return;
        };
        let (Some(&pos_ptr), Some(&tc_ptr)) = (
            s.attribs.get(&(pos_loc as u32)),
            s.attribs.get(&(tc_loc as u32)),
        ) else {
            return;
        };
        let Some(data) = s.buffers.get(&vb) else {
            return;
        };

        let vertices: Vec<((f32, f32), (f32, f32))> = (first..first + count)
            .filter_map(|i| Some((vertex_pair(data, pos_ptr, i)?, vertex_pair(data, tc_ptr, i)?)))
            .collect();
        let extreme = |key: fn(&((f32, f32), (f32, f32))) -> f32, max: bool| {
            vertices
                .iter()
                .copied()
                .reduce(|a, b| if (key(&b) > key(&a)) == max { b } else { a })
        };
        let (Some(left), Some(right), Some(bottom), Some(top)) = (
            extreme(|v| v.0 .0, false),
            extreme(|v| v.0 .0, true),
            extreme(|v| v.0 .1, false),
            extreme(|v| v.0 .1, true),
        ) else {
            return;
        };
        let (Some(map_u), Some(map_v)) = (
            AxisMap::between((left.0 .0, left.1 .0), (right.0 .0, right.1 .0)),
            AxisMap::between((bottom.0 .1, bottom.1 .1), (top.0 .1, top.1 .1)),
        ) else {
            return;
        };

        let coefficients = program.coefficients;
        let box_filter = program.box_filter;
        let matrix = program.matrix;
        let step = (1.0 / program.source_size.0, 1.0 / program.source_size.1);
        let image = s
            .external_units
            .get(&crate::gles::CAPTURE_TEXTURE_UNIT)
            .and_then(|texture| self.store.get(*texture));

        let Some(target) = s.textures.get_mut(&texture_name) else {
            return;
        };
        let width = viewport.width.min(target.size.width);
        let height = viewport.height.min(target.size.height);

        for py in 0..height {
            let ndc_y = (py as f32 + 0.5) / viewport.height as f32 * 2.0 - 1.0;
            let v = map_v.apply(ndc_y);
            for px in 0..width {
                let ndc_x = (px as f32 + 0.5) / viewport.width as f32 * 2.0 - 1.0;
                let u = map_u.apply(ndc_x);
                let (su, sv) = matrix.transform(u, v);

                let rgb = match &image {
                    None => [0.0; 3],
                    Some(image) if box_filter => {
                        let samples = [
                            image.sample(su, sv),
                            image.sample(su + step.0, sv),
                            image.sample(su, sv + step.1),
                            image.sample(su + step.0, sv + step.1),
                        ];
                        let mut avg = [0.0; 3];
                        for sample in samples {
                            for c in 0..3 {
                                avg[c] += sample[c] * 0.25;
                            }
                        }
                        avg
                    }
                    Some(image) => image.sample(su, sv),
                };

                let value = rgb[0] * coefficients.rgb[0]
                    + rgb[1] * coefficients.rgb[1]
                    + rgb[2] * coefficients.rgb[2]
                    + coefficients.offset;
                let index = py as usize * target.size.width as usize + px as usize;
                target.data[index] = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        }
    }

    fn gl_error(&mut self) -> u32 {
        std::mem::replace(&mut self.call().gl_error, GL_NO_ERROR)
    }

    fn read_pixels(&mut self, size: Dimensions, out: &mut [u8]) {
        let mut s = self.call();
        if s.current.is_none() {
            s.fail_gl(GL_INVALID_OPERATION);
            return;
        }
        let Some(fb) = s.bound_framebuffer else { return };
        let Some(texture) = s.framebuffers.get(&fb).and_then(|t| s.textures.get(t)) else {
            return;
        };
        let width = size.width.min(texture.size.width) as usize;
        let height = size.height.min(texture.size.height) as usize;
        for row in 0..height {
            let src = &texture.data[row * texture.size.width as usize..][..width];
            let dst_start = row * size.width as usize;
            if let Some(dst) = out.get_mut(dst_start..dst_start + width) {
                dst.copy_from_slice(src);
            }
        }
    }

    fn delete_shader(&mut self, shader: ShaderId) {
        self.call().shaders.remove(&shader.0);
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.call().programs.remove(&program.0);
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.call().framebuffers.remove(&framebuffer.0);
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.call().textures.remove(&texture.0);
    }

    fn delete_external_texture(&mut self, texture: ExternalTextureId) {
        self.call().external_textures.remove(&texture.0);
        self.store.remove(texture);
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.call().buffers.remove(&buffer.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaders::{VERTEX_SHADER, Y_FRAGMENT_SHADER};

    #[test]
    fn coefficients_are_read_from_source() {
        let c = parse_coefficients(Y_FRAGMENT_SHADER).unwrap();
        assert_eq!(c.rgb, [0.2126, 0.7152, 0.0722]);
        assert_eq!(c.offset, 0.0);
    }

    #[test]
    fn declared_names_follow_declaration_order() {
        assert_eq!(declared_names(VERTEX_SHADER, "in "), ["aPosition", "aTexCoord"]);
        assert_eq!(declared_names(VERTEX_SHADER, "uniform "), ["uTexMatrix"]);
    }

    #[test]
    fn bilinear_sampling_blends_neighbours_and_clamps() {
        let image = RgbaImage::from_fn(2, 1, |x, _| if x == 0 { [0; 4] } else { [255; 4] });
        assert_eq!(image.sample(0.25, 0.5)[0], 0.0);
        assert!((image.sample(0.5, 0.5)[0] - 0.5).abs() < 1e-6);
        assert_eq!(image.sample(2.0, 0.5)[0], 1.0);
        assert_eq!(image.sample(-1.0, 0.5)[0], 0.0);
    }

    #[test]
    fn egl_error_resets_after_read() {
        let mut gl = SoftwareGles::new();
        gl.fail_next(FailurePoint::ContextCreation);
        let display = gl.default_display().unwrap();
        assert!(gl.initialize_display(display));
        let config = gl
            .choose_config(display, &ConfigRequest::RGBA8888_ES3)
            .unwrap();
        assert!(gl.create_context(display, config).is_none());
        assert_eq!(gl.egl_error(), EGL_BAD_ALLOC);
        assert_eq!(gl.egl_error(), EGL_SUCCESS);
    }

    #[test]
    fn unsupported_config_is_not_matched() {
        let mut gl = SoftwareGles::new();
        let display = gl.default_display().unwrap();
        gl.initialize_display(display);
        let request = ConfigRequest {
            es3_renderable: false,
            ..ConfigRequest::RGBA8888_ES3
        };
        assert!(gl.choose_config(display, &request).is_none());
    }

    #[test]
    fn fail_after_skips_earlier_calls() {
        let mut gl = SoftwareGles::new();
        gl.fail_after(FailurePoint::ShaderCompile(ShaderStage::Vertex), 1);
        assert!(gl.compile_shader(ShaderStage::Vertex, VERTEX_SHADER).is_ok());
        assert!(gl.compile_shader(ShaderStage::Vertex, VERTEX_SHADER).is_err());
        assert!(gl.compile_shader(ShaderStage::Vertex, VERTEX_SHADER).is_ok());
    }

    #[test]
    fn draw_without_current_context_records_invalid_operation() {
        let mut gl = SoftwareGles::new();
        gl.draw_triangle_strip(0, 4);
        gl.draw_triangle_strip(0, 4);
        assert_eq!(gl.gl_error(), GL_INVALID_OPERATION);
        assert_eq!(gl.gl_error(), GL_NO_ERROR);

        let mut out = [7u8; 4];
        gl.read_pixels(Dimensions::new(2, 2), &mut out);
        assert_eq!(gl.gl_error(), GL_INVALID_OPERATION);
        assert_eq!(out, [7; 4]);
    }

    #[test]
    fn call_count_is_shared_between_clones() {
        let gl = SoftwareGles::new();
        let mut api = gl.clone();
        api.create_external_texture();
        api.create_vertex_buffer(&[0.0; 4]);
        assert_eq!(gl.call_count(), 2);
    }
}
