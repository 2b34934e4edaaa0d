//! Frame Scheduler: max-fps gating of frame-available notifications.

use std::sync::Arc;

use castcap_common::clock::{FrameClock, FrameGate};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Admission decision for one frame-available notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Render the frame; commit `now_ns` once it was emitted.
    Render { now_ns: u64 },
    /// Too soon after the last emitted frame.
    Gated,
}

/// Rate gate bound to a clock. Lives on the render thread.
pub struct FrameScheduler {
    gate: FrameGate,
    clock: Arc<dyn FrameClock>,
}

impl FrameScheduler {
    pub fn new(max_fps: u32, clock: Arc<dyn FrameClock>) -> Self {
        Self {
            gate: FrameGate::new(max_fps),
            clock,
        }
    }

    /// Decide whether a frame arriving now may be rendered. Read-only.
    pub fn admit(&self) -> FrameDecision {
        let now_ns = self.clock.now_ns();
        if self.gate.should_emit(now_ns) {
            FrameDecision::Render { now_ns }
        } else {
            FrameDecision::Gated
        }
    }

    /// Record an emitted frame.
    pub fn commit(&mut self, now_ns: u64) {
        self.gate.mark_emitted(now_ns);
    }

    /// Start a new session at `max_fps`, forgetting the last emit.
    pub fn reset(&mut self, max_fps: u32) {
        self.gate = FrameGate::new(max_fps);
    }

    pub fn max_fps(&self) -> u32 {
        self.gate.max_fps()
    }
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

/// Runtime counters of a capture controller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    /// Notifications that reached the render thread while capturing.
    pub frames_available: u64,

    /// Frames converted and handed to the bridge.
    pub frames_rendered: u64,

    /// Frames discarded by the rate gate.
    pub frames_dropped: u64,

    /// Frames aborted by a GPU or capture surface error.
    pub frames_failed: u64,

    /// Completed resizes.
    pub resizes: u64,

    /// When the current or last session started capturing.
    pub started_at: Option<DateTime<Utc>>,
}

impl CaptureStats {
    /// Drop rate as a percentage of frames that were rendered or gated.
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_rendered + self.frames_dropped;
        if total == 0 {
            return 0.0;
        }
        self.frames_dropped as f64 / total as f64 * 100.0
    }
}
