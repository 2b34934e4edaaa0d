//! Conversion shader sources and compiled program handles.

use castcap_common::error::{CastcapError, CastcapResult};

use crate::converter::Plane;
use crate::gles::{GlesApi, ProgramId, ShaderStage};

/// Shared vertex stage: pass the quad through and map its texture
/// coordinates into capture-image space.
pub const VERTEX_SHADER: &str = r#"#version 300 es
uniform mat4 uTexMatrix;
in vec4 aPosition;
in vec4 aTexCoord;
out vec2 vTexCoord;
void main() {
    gl_Position = aPosition;
    vTexCoord = (uTexMatrix * aTexCoord).xy;
}
"#;

/// Luma: one sample per output texel.
pub const Y_FRAGMENT_SHADER: &str = r#"#version 300 es
#extension GL_OES_EGL_image_external_essl3 : require
precision mediump float;
uniform samplerExternalOES uTexture;
in vec2 vTexCoord;
out vec4 fragColor;
const vec4 COEFF = vec4(0.2126, 0.7152, 0.0722, 0.0);
void main() {
    vec3 rgb = texture(uTexture, vTexCoord).rgb;
    fragColor = vec4(dot(rgb, COEFF.rgb) + COEFF.a, 0.0, 0.0, 1.0);
}
"#;

/// Cb: average of four samples one source texel apart.
pub const U_FRAGMENT_SHADER: &str = r#"#version 300 es
#extension GL_OES_EGL_image_external_essl3 : require
precision mediump float;
uniform samplerExternalOES uTexture;
uniform vec2 uSourceSize;
in vec2 vTexCoord;
out vec4 fragColor;
const vec4 COEFF = vec4(-0.1146, -0.3854, 0.5, 0.5);
void main() {
    vec2 texelStep = 1.0 / uSourceSize;
    vec3 rgb = (texture(uTexture, vTexCoord).rgb
        + texture(uTexture, vTexCoord + vec2(texelStep.x, 0.0)).rgb
        + texture(uTexture, vTexCoord + vec2(0.0, texelStep.y)).rgb
        + texture(uTexture, vTexCoord + texelStep).rgb) * 0.25;
    fragColor = vec4(dot(rgb, COEFF.rgb) + COEFF.a, 0.0, 0.0, 1.0);
}
"#;

/// Cr: average of four samples one source texel apart.
pub const V_FRAGMENT_SHADER: &str = r#"#version 300 es
#extension GL_OES_EGL_image_external_essl3 : require
precision mediump float;
uniform samplerExternalOES uTexture;
uniform vec2 uSourceSize;
in vec2 vTexCoord;
out vec4 fragColor;
const vec4 COEFF = vec4(0.5, -0.4542, -0.0458, 0.5);
void main() {
    vec2 texelStep = 1.0 / uSourceSize;
    vec3 rgb = (texture(uTexture, vTexCoord).rgb
        + texture(uTexture, vTexCoord + vec2(texelStep.x, 0.0)).rgb
        + texture(uTexture, vTexCoord + vec2(0.0, texelStep.y)).rgb
        + texture(uTexture, vTexCoord + texelStep).rgb) * 0.25;
    fragColor = vec4(dot(rgb, COEFF.rgb) + COEFF.a, 0.0, 0.0, 1.0);
}
"#;

/// Fragment source for a plane.
pub fn fragment_source(plane: Plane) -> &'static str {
    match plane {
        Plane::Y => Y_FRAGMENT_SHADER,
        Plane::U => U_FRAGMENT_SHADER,
        Plane::V => V_FRAGMENT_SHADER,
    }
}

/// A linked conversion program with its cached locations.
#[derive(Debug, Clone, Copy)]
pub struct ShaderProgram {
    pub program: ProgramId,
    pub a_position: u32,
    pub a_tex_coord: u32,
    pub u_tex_matrix: i32,
    pub u_texture: i32,
    /// Only present on the chroma programs.
    pub u_source_size: Option<i32>,
}

impl ShaderProgram {
    /// Compile and link the program for `plane`.
    ///
    /// Intermediate shader objects are deleted whether or not linking
    /// succeeds, so a failure leaves nothing behind.
    pub fn build(gl: &mut dyn GlesApi, plane: Plane) -> CastcapResult<Self> {
        let vertex = gl
            .compile_shader(ShaderStage::Vertex, VERTEX_SHADER)
            .map_err(|log| CastcapError::ShaderCompileFailed {
                stage: ShaderStage::Vertex.to_string(),
                log,
            })?;

        let fragment = match gl.compile_shader(ShaderStage::Fragment, fragment_source(plane)) {
            Ok(fragment) => fragment,
            Err(log) => {
                gl.delete_shader(vertex);
                return Err(CastcapError::ShaderCompileFailed {
                    stage: ShaderStage::Fragment.to_string(),
                    log,
                });
            }
        };

        let linked = gl.link_program(vertex, fragment);
        gl.delete_shader(vertex);
        gl.delete_shader(fragment);
        let program = linked.map_err(|log| CastcapError::ProgramLinkFailed { log })?;

        match Self::resolve_locations(gl, program, plane) {
            Ok(resolved) => Ok(resolved),
            Err(e) => {
                gl.delete_program(program);
                Err(e)
            }
        }
    }

    fn resolve_locations(
        gl: &mut dyn GlesApi,
        program: ProgramId,
        plane: Plane,
    ) -> CastcapResult<Self> {
        let missing = |name: &str| CastcapError::ProgramLinkFailed {
            log: format!("{plane:?} program has no active `{name}`"),
        };

        let a_position = gl
            .attrib_location(program, "aPosition")
            .ok_or_else(|| missing("aPosition"))?;
        let a_tex_coord = gl
            .attrib_location(program, "aTexCoord")
            .ok_or_else(|| missing("aTexCoord"))?;
        let u_tex_matrix = gl
            .uniform_location(program, "uTexMatrix")
            .ok_or_else(|| missing("uTexMatrix"))?;
        let u_texture = gl
            .uniform_location(program, "uTexture")
            .ok_or_else(|| missing("uTexture"))?;
        let u_source_size = if plane.is_chroma() {
            Some(
                gl.uniform_location(program, "uSourceSize")
                    .ok_or_else(|| missing("uSourceSize"))?,
            )
        } else {
            None
        };

        Ok(Self {
            program,
            a_position,
            a_tex_coord,
            u_tex_matrix,
            u_texture,
            u_source_size,
        })
    }

    pub fn delete(self, gl: &mut dyn GlesApi) {
        gl.delete_program(self.program);
    }
}
