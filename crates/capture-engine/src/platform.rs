//! Platform contracts: permission, display metrics and the capture surface.
//!
//! The platform delivers its asynchronous callbacks through
//! [`PlatformEvents`], which posts them onto the render thread's queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use castcap_common::error::CastcapResult;
use castcap_platform_core::{CaptureToken, Dimensions, DisplayMetrics, ExternalTextureId, TexMatrix};
use crossbeam_channel::Sender;

use crate::session::CapturePolicy;

/// Outcome of a capture permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResult {
    Granted(CaptureToken),
    Denied,
}

/// Main-thread side of the platform.
pub trait CapturePlatform: Send {
    /// Ask the user for capture permission. The answer is delivered later
    /// through [`PlatformEvents::permission_result`].
    fn request_permission(&mut self, events: PlatformEvents);

    /// Physical display size.
    fn display_metrics(&self) -> DisplayMetrics;

    /// Create the virtual display feeding `texture` at `source` size.
    /// The surface signals each new image through
    /// [`PlatformEvents::frame_available`].
    fn create_capture_surface(
        &mut self,
        token: CaptureToken,
        texture: ExternalTextureId,
        source: Dimensions,
        events: PlatformEvents,
    ) -> CastcapResult<Box<dyn CaptureSurface>>;

    /// Give up the projection behind `token`.
    fn stop_projection(&mut self, token: CaptureToken);
}

/// Producer bound to the external texture. Used on the render thread with
/// the rendering context current.
pub trait CaptureSurface: Send {
    /// Latch the newest image into the texture and acknowledge it, returning
    /// the transform to sample it with.
    fn update_image(&mut self) -> CastcapResult<TexMatrix>;

    /// Stop producing images.
    fn release(&mut self);
}

/// Work items for the render thread.
#[derive(Debug)]
pub(crate) enum Command {
    Start(CapturePolicy),
    Stop,
    Permission(PermissionResult),
    FrameAvailable,
    DisplayChanged { display_id: u32, size: Dimensions },
    ProjectionStopped,
    Barrier(Sender<()>),
    Shutdown,
}

/// Cloneable handle the platform uses to post callbacks.
#[derive(Debug, Clone)]
pub struct PlatformEvents {
    tx: Sender<Command>,
    capture_mode: Arc<AtomicBool>,
}

impl PlatformEvents {
    pub(crate) fn new(tx: Sender<Command>, capture_mode: Arc<AtomicBool>) -> Self {
        Self { tx, capture_mode }
    }

    pub(crate) fn post(&self, command: Command) -> bool {
        if self.tx.send(command).is_err() {
            tracing::debug!("Render thread gone, dropping event");
            return false;
        }
        true
    }

    pub fn permission_result(&self, result: PermissionResult) {
        self.post(Command::Permission(result));
    }

    /// A new capture image is ready. Dropped immediately while not
    /// capturing.
    pub fn frame_available(&self) {
        if !self.capture_mode.load(Ordering::Acquire) {
            tracing::trace!("Frame available outside capture mode, ignored");
            return;
        }
        self.post(Command::FrameAvailable);
    }

    pub fn display_changed(&self, display_id: u32, size: Dimensions) {
        self.post(Command::DisplayChanged { display_id, size });
    }

    /// The system ended the projection.
    pub fn projection_stopped(&self) {
        self.post(Command::ProjectionStopped);
    }

    /// Whether frames are currently being processed.
    pub fn is_capturing(&self) -> bool {
        self.capture_mode.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_available_is_filtered_by_capture_mode() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mode = Arc::new(AtomicBool::new(false));
        let events = PlatformEvents::new(tx, Arc::clone(&mode));

        events.frame_available();
        assert!(rx.try_recv().is_err());

        mode.store(true, Ordering::Release);
        events.frame_available();
        assert!(matches!(rx.try_recv(), Ok(Command::FrameAvailable)));
    }

    #[test]
    fn lifecycle_events_always_post() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let events = PlatformEvents::new(tx, Arc::new(AtomicBool::new(false)));
        events.permission_result(PermissionResult::Denied);
        events.display_changed(0, Dimensions::new(640, 480));
        events.projection_stopped();
        assert_eq!(rx.len(), 3);
    }

    #[test]
    fn posting_after_receiver_drop_is_harmless() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let events = PlatformEvents::new(tx, Arc::new(AtomicBool::new(true)));
        assert!(!events.post(Command::FrameAvailable));
    }
}
