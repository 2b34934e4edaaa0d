//! Castcap Render Engine
//!
//! Owns the dedicated GPU rendering context and converts the platform's
//! continuously updated capture texture into three 8-bit planes (Y, U, V)
//! using full-range BT.709 coefficients.
//!
//! # Pipeline Architecture
//!
//! ```text
//! capture surface ──► external texture (source size)
//!                            │
//!          ┌─────────────────┼─────────────────┐
//!          ▼                 ▼                 ▼
//!     Y program         U program         V program
//!   (full scaled)     (half, 2x2 box)   (half, 2x2 box)
//!          │                 │                 │
//!          ▼                 ▼                 ▼
//!    R8 target Y       R8 target U       R8 target V
//!          │                 │                 │
//!          └──── readPixels into reusable host buffers ────► PlanarFrame
//! ```
//!
//! All GPU calls of a capture session go through [`gles::GlesApi`]; the
//! crate ships the CPU [`software::SoftwareGles`] implementation of it. With
//! the `wgpu` feature, `wgpu_backend::WgpuConverter` runs the same three
//! passes on a real GPU adapter.

pub mod context;
pub mod converter;
pub mod gles;
pub mod shaders;
pub mod software;
pub mod target;
#[cfg(feature = "wgpu")]
pub mod wgpu_backend;

pub use context::{CaptureDimensions, GpuSession, InitRequest, TeardownOutcome};
pub use converter::{ColorConverter, PlanarFrame, Plane};
pub use gles::GlesApi;
pub use software::{ExternalImageStore, RgbaImage, SoftwareGles};
pub use target::PlaneBuffers;
#[cfg(feature = "wgpu")]
pub use wgpu_backend::WgpuConverter;
