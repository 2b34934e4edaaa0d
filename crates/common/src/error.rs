//! Error types shared across Castcap crates.

/// Top-level error type for capture-and-convert operations.
#[derive(Debug, thiserror::Error)]
pub enum CastcapError {
    #[error("Screen capture permission denied")]
    PermissionDenied,

    #[error("No default GPU display is available")]
    ContextUnavailable,

    #[error("No RGBA8888 ES3-renderable GPU configuration found")]
    ConfigurationUnsupported,

    #[error("Failed to create rendering context (code {code:#06x})")]
    ContextCreationFailed { code: i32 },

    #[error("Failed to create off-screen surface (code {code:#06x})")]
    SurfaceCreationFailed { code: i32 },

    #[error("Failed to make rendering context current (code {code:#06x})")]
    MakeCurrentFailed { code: i32 },

    #[error("Failed to compile {stage} shader: {log}")]
    ShaderCompileFailed { stage: String, log: String },

    #[error("Failed to link shader program: {log}")]
    ProgramLinkFailed { log: String },

    #[error("Framebuffer incomplete (status {status:#06x})")]
    FramebufferIncomplete { status: u32 },

    #[error("GPU error while converting a frame (code {code:#06x})")]
    RenderFailed { code: u32 },

    #[error("GPU backend error: {message}")]
    Gpu { message: String },

    #[error("Capture surface error: {message}")]
    CaptureSurface { message: String },

    #[error("Media pipeline error: {message}")]
    Pipeline { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using CastcapError.
pub type CastcapResult<T> = Result<T, CastcapError>;

impl CastcapError {
    pub fn capture_surface(msg: impl Into<String>) -> Self {
        Self::CaptureSurface {
            message: msg.into(),
        }
    }

    pub fn gpu(msg: impl Into<String>) -> Self {
        Self::Gpu {
            message: msg.into(),
        }
    }

    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline {
            message: msg.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this error came out of GPU context, surface, shader or
    /// framebuffer setup.
    pub fn is_gpu_setup(&self) -> bool {
        matches!(
            self,
            Self::ContextUnavailable
                | Self::ConfigurationUnsupported
                | Self::ContextCreationFailed { .. }
                | Self::SurfaceCreationFailed { .. }
                | Self::MakeCurrentFailed { .. }
                | Self::ShaderCompileFailed { .. }
                | Self::ProgramLinkFailed { .. }
                | Self::FramebufferIncomplete { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_setup_classification() {
        assert!(CastcapError::ContextUnavailable.is_gpu_setup());
        assert!(CastcapError::FramebufferIncomplete { status: 0x8cd6 }.is_gpu_setup());
        assert!(!CastcapError::PermissionDenied.is_gpu_setup());
        assert!(!CastcapError::config("bad fps").is_gpu_setup());
    }

    #[test]
    fn shader_error_carries_diagnostic() {
        let err = CastcapError::ShaderCompileFailed {
            stage: "fragment".to_string(),
            log: "0:3: 'vec5' : undeclared identifier".to_string(),
        };
        assert!(err.to_string().contains("vec5"));
        assert!(err.to_string().contains("fragment"));
    }
}
