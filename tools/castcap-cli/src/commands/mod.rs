pub mod config;
#[cfg(feature = "wgpu")]
pub mod convert;
pub mod scale;
pub mod simulate;
