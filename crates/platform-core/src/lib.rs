//! Castcap platform core contracts.
//!
//! This crate contains the value types exchanged between the platform
//! capture layer, the GPU renderer and the session state machine, without
//! coupling to a concrete OS or GPU backend.

pub mod dimensions;

pub use dimensions::{fit, scale, Dimensions, MIN_CAPTURE_EXTENT};

use serde::{Deserialize, Serialize};

/// Physical display metrics reported by the platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisplayMetrics {
    /// Resolution in physical pixels.
    pub width: u32,
    pub height: u32,
    /// Display density in dots per inch.
    pub density_dpi: u32,
}

impl DisplayMetrics {
    /// Physical resolution as capture dimensions.
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

/// Opaque token proving the user granted screen capture.
///
/// The platform layer maps the id back to whatever projection object it
/// holds; the core only passes it around and hands it back on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureToken(pub u64);

/// Name of an external (producer-fed) GPU texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalTextureId(pub u32);

/// Column-major 4x4 transform from quad texture coordinates to the
/// sampling coordinates of the current capture image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TexMatrix(pub [f32; 16]);

impl TexMatrix {
    pub const IDENTITY: TexMatrix = TexMatrix([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    /// Matrix mapping `v` to `1 - v`, the usual correction for producers
    /// that write images bottom-up.
    pub const VERTICAL_FLIP: TexMatrix = TexMatrix([
        1.0, 0.0, 0.0, 0.0, //
        0.0, -1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 1.0, 0.0, 1.0,
    ]);

    /// Apply the matrix to a texture coordinate `(u, v, 0, 1)`.
    pub fn transform(&self, u: f32, v: f32) -> (f32, f32) {
        let m = &self.0;
        let x = m[0] * u + m[4] * v + m[12];
        let y = m[1] * u + m[5] * v + m[13];
        let w = m[3] * u + m[7] * v + m[15];
        if w.abs() > f32::EPSILON && (w - 1.0).abs() > f32::EPSILON {
            (x / w, y / w)
        } else {
            (x, y)
        }
    }
}

impl Default for TexMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}
