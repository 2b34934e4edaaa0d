//! Castcap Capture Engine
//!
//! Runs the capture session lifecycle: permission, GPU session setup,
//! rate-gated frame conversion, resize and teardown. All work happens on a
//! single render thread fed by a command queue.
//!
//! # Architecture
//!
//! ```text
//!  main thread                       render thread
//! ┌──────────────────┐  commands   ┌──────────────────────────────────┐
//! │ CaptureController├────────────►│ session state machine            │
//! └──────────────────┘             │  ├─ CapturePlatform (permission) │
//! ┌──────────────────┐  events     │  ├─ GpuSession + ColorConverter  │
//! │ PlatformEvents   ├────────────►│  ├─ FrameScheduler (max fps)     │
//! └──────────────────┘             │  └─ NativeBridge (frames, events)│
//!                                  └──────────────────────────────────┘
//! ```

pub mod bridge;
#[cfg(feature = "gst")]
pub mod gst_sink;
pub mod platform;
pub mod scheduler;
pub mod session;
pub mod synthetic;

pub use bridge::{BridgeEvent, ChannelBridge, NativeBridge, OwnedFrame};
pub use platform::{CapturePlatform, CaptureSurface, PermissionResult, PlatformEvents};
pub use scheduler::{CaptureStats, FrameDecision, FrameScheduler};
pub use session::{CaptureController, CapturePolicy, CaptureState, CaptureStatus};
pub use synthetic::{PermissionMode, SyntheticPlatform};
