//! Synthetic platform: scripted permission answers and a generated test
//! pattern written into the software backend's external image store.

use std::collections::HashSet;
use std::sync::Arc;

use castcap_common::error::{CastcapError, CastcapResult};
use castcap_platform_core::{CaptureToken, Dimensions, DisplayMetrics, ExternalTextureId, TexMatrix};
use castcap_render_engine::{ExternalImageStore, RgbaImage};
use parking_lot::Mutex;

use crate::platform::{CapturePlatform, CaptureSurface, PermissionResult, PlatformEvents};

/// How permission requests are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    AutoGrant,
    AutoDeny,
    /// Held until [`SyntheticPlatform::grant_pending`] or
    /// [`SyntheticPlatform::deny_pending`].
    Manual,
}

const GRID_SPACING: u32 = 32;
const BAR_WIDTH: u32 = 8;
const BAR_STEP: u32 = 8;

/// Dark grid with a white vertical bar that moves with `frame_index`.
pub fn test_pattern(size: Dimensions, frame_index: u64) -> RgbaImage {
    let bar_x = if size.width == 0 {
        0
    } else {
        ((frame_index * BAR_STEP as u64) % size.width as u64) as u32
    };
    RgbaImage::from_fn(size.width, size.height, |x, y| {
        if x >= bar_x && x < bar_x + BAR_WIDTH {
            [255, 255, 255, 255]
        } else if x % GRID_SPACING == 0 || y % GRID_SPACING == 0 {
            [80, 80, 90, 255]
        } else {
            [30, 30, 35, 255]
        }
    })
}

#[derive(Debug)]
struct SurfaceBinding {
    texture: ExternalTextureId,
    source: Dimensions,
    events: PlatformEvents,
    frame_index: u64,
}

#[derive(Debug)]
struct Inner {
    metrics: DisplayMetrics,
    mode: PermissionMode,
    events: Option<PlatformEvents>,
    pending: bool,
    next_token: u64,
    live_tokens: HashSet<CaptureToken>,
    surface: Option<SurfaceBinding>,
    fail_next_surface: bool,
    permission_requests: u64,
    images_acknowledged: u64,
}

impl Inner {
    fn issue_token(&mut self) -> CaptureToken {
        self.next_token += 1;
        let token = CaptureToken(self.next_token);
        self.live_tokens.insert(token);
        token
    }
}

/// In-process capture platform. Clones share state, so a test can keep one
/// to drive frames and display changes while the controller owns another.
#[derive(Debug, Clone)]
pub struct SyntheticPlatform {
    inner: Arc<Mutex<Inner>>,
    store: ExternalImageStore,
}

impl SyntheticPlatform {
    pub fn new(metrics: DisplayMetrics, store: ExternalImageStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                metrics,
                mode: PermissionMode::AutoGrant,
                events: None,
                pending: false,
                next_token: 0,
                live_tokens: HashSet::new(),
                surface: None,
                fail_next_surface: false,
                permission_requests: 0,
                images_acknowledged: 0,
            })),
            store,
        }
    }

    pub fn with_permission(self, mode: PermissionMode) -> Self {
        self.inner.lock().mode = mode;
        self
    }

    pub fn set_permission(&self, mode: PermissionMode) {
        self.inner.lock().mode = mode;
    }

    /// Answer a held request with a grant.
    pub fn grant_pending(&self) -> bool {
        let mut inner = self.inner.lock();
        if !std::mem::take(&mut inner.pending) {
            return false;
        }
        let token = inner.issue_token();
        let events = inner.events.clone();
        drop(inner);
        match events {
            Some(events) => {
                events.permission_result(PermissionResult::Granted(token));
                true
            }
            None => false,
        }
    }

    /// Answer a held request with a denial.
    pub fn deny_pending(&self) -> bool {
        let mut inner = self.inner.lock();
        if !std::mem::take(&mut inner.pending) {
            return false;
        }
        let events = inner.events.clone();
        drop(inner);
        match events {
            Some(events) => {
                events.permission_result(PermissionResult::Denied);
                true
            }
            None => false,
        }
    }

    /// Refuse the next capture surface.
    pub fn fail_next_surface(&self) {
        self.inner.lock().fail_next_surface = true;
    }

    /// Projection tokens issued and not yet stopped.
    pub fn live_tokens(&self) -> usize {
        self.inner.lock().live_tokens.len()
    }

    pub fn permission_requests(&self) -> u64 {
        self.inner.lock().permission_requests
    }

    pub fn images_acknowledged(&self) -> u64 {
        self.inner.lock().images_acknowledged
    }

    /// Source size of the bound capture surface.
    pub fn surface_source(&self) -> Option<Dimensions> {
        self.inner.lock().surface.as_ref().map(|s| s.source)
    }

    /// Draw the next pattern frame into the bound texture and signal it.
    pub fn produce_frame(&self) -> bool {
        let (texture, image, events) = {
            let mut inner = self.inner.lock();
            let Some(surface) = inner.surface.as_mut() else {
                return false;
            };
            let image = test_pattern(surface.source, surface.frame_index);
            surface.frame_index += 1;
            (surface.texture, image, surface.events.clone())
        };
        self.store.publish(texture, image);
        events.frame_available();
        true
    }

    /// Signal a new image without redrawing the texture.
    pub fn signal_frame(&self) -> bool {
        let events = self.inner.lock().surface.as_ref().map(|s| s.events.clone());
        match events {
            Some(events) => {
                events.frame_available();
                true
            }
            None => false,
        }
    }

    /// Change the physical display size and report it, as a rotation does.
    pub fn set_display_size(&self, size: Dimensions) {
        let events = {
            let mut inner = self.inner.lock();
            inner.metrics.width = size.width;
            inner.metrics.height = size.height;
            inner.events.clone()
        };
        if let Some(events) = events {
            events.display_changed(0, size);
        }
    }

    /// End the projection from the system side.
    pub fn stop_from_system(&self) {
        let events = {
            let mut inner = self.inner.lock();
            inner.live_tokens.clear();
            inner.events.clone()
        };
        if let Some(events) = events {
            events.projection_stopped();
        }
    }
}

impl CapturePlatform for SyntheticPlatform {
    fn request_permission(&mut self, events: PlatformEvents) {
        let mut inner = self.inner.lock();
        inner.permission_requests += 1;
        inner.events = Some(events.clone());
        let mode = inner.mode;
        match mode {
            PermissionMode::AutoGrant => {
                let token = inner.issue_token();
                drop(inner);
                events.permission_result(PermissionResult::Granted(token));
            }
            PermissionMode::AutoDeny => {
                drop(inner);
                events.permission_result(PermissionResult::Denied);
            }
            PermissionMode::Manual => {
                inner.pending = true;
                tracing::debug!("Permission request held");
            }
        }
    }

    fn display_metrics(&self) -> DisplayMetrics {
        self.inner.lock().metrics
    }

    fn create_capture_surface(
        &mut self,
        token: CaptureToken,
        texture: ExternalTextureId,
        source: Dimensions,
        events: PlatformEvents,
    ) -> CastcapResult<Box<dyn CaptureSurface>> {
        let mut inner = self.inner.lock();
        if std::mem::take(&mut inner.fail_next_surface) {
            return Err(CastcapError::capture_surface(
                "virtual display creation refused",
            ));
        }
        if !inner.live_tokens.contains(&token) {
            return Err(CastcapError::capture_surface(format!(
                "projection {} is not active",
                token.0
            )));
        }

        self.store.publish(texture, test_pattern(source, 0));
        inner.surface = Some(SurfaceBinding {
            texture,
            source,
            events,
            frame_index: 1,
        });
        tracing::debug!(source = %source, texture = texture.0, "Synthetic capture surface created");

        Ok(Box::new(SyntheticSurface {
            inner: Arc::clone(&self.inner),
            texture,
        }))
    }

    fn stop_projection(&mut self, token: CaptureToken) {
        if self.inner.lock().live_tokens.remove(&token) {
            tracing::debug!(token = token.0, "Synthetic projection stopped");
        }
    }
}

struct SyntheticSurface {
    inner: Arc<Mutex<Inner>>,
    texture: ExternalTextureId,
}

impl CaptureSurface for SyntheticSurface {
    fn update_image(&mut self) -> CastcapResult<TexMatrix> {
        let mut inner = self.inner.lock();
        let bound = inner
            .surface
            .as_ref()
            .is_some_and(|s| s.texture == self.texture);
        if !bound {
            return Err(CastcapError::capture_surface("capture surface released"));
        }
        inner.images_acknowledged += 1;
        Ok(TexMatrix::IDENTITY)
    }

    fn release(&mut self) {
        let mut inner = self.inner.lock();
        if inner
            .surface
            .as_ref()
            .is_some_and(|s| s.texture == self.texture)
        {
            inner.surface = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Command;
    use std::sync::atomic::AtomicBool;

    fn metrics() -> DisplayMetrics {
        DisplayMetrics {
            width: 64,
            height: 32,
            density_dpi: 160,
        }
    }

    fn events() -> (PlatformEvents, crossbeam_channel::Receiver<Command>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            PlatformEvents::new(tx, Arc::new(AtomicBool::new(true))),
            rx,
        )
    }

    #[test]
    fn bar_moves_between_frames() {
        let size = Dimensions::new(64, 8);
        let first = test_pattern(size, 0);
        let second = test_pattern(size, 1);
        assert_eq!(first.pixel(0, 1), [255, 255, 255, 255]);
        assert_ne!(second.pixel(0, 1), [255, 255, 255, 255]);
        assert_eq!(second.pixel(BAR_STEP, 1), [255, 255, 255, 255]);
    }

    #[test]
    fn auto_grant_issues_a_live_token() {
        let mut platform = SyntheticPlatform::new(metrics(), ExternalImageStore::new());
        let (events, rx) = events();
        platform.request_permission(events);

        let Ok(Command::Permission(PermissionResult::Granted(token))) = rx.try_recv() else {
            panic!("expected a grant");
        };
        assert_eq!(platform.live_tokens(), 1);
        platform.stop_projection(token);
        assert_eq!(platform.live_tokens(), 0);
    }

    #[test]
    fn manual_mode_holds_until_answered() {
        let mut platform = SyntheticPlatform::new(metrics(), ExternalImageStore::new())
            .with_permission(PermissionMode::Manual);
        let (events, rx) = events();
        platform.request_permission(events);
        assert!(rx.try_recv().is_err());

        assert!(platform.deny_pending());
        assert!(matches!(
            rx.try_recv(),
            Ok(Command::Permission(PermissionResult::Denied))
        ));
        assert!(!platform.grant_pending());
    }

    #[test]
    fn surface_requires_a_live_token_and_publishes_images() {
        let store = ExternalImageStore::new();
        let mut platform = SyntheticPlatform::new(metrics(), store.clone());
        let (events, rx) = events();
        let texture = ExternalTextureId(7);

        assert!(platform
            .create_capture_surface(CaptureToken(99), texture, Dimensions::new(64, 32), events.clone())
            .is_err());

        platform.request_permission(events.clone());
        let Ok(Command::Permission(PermissionResult::Granted(token))) = rx.try_recv() else {
            panic!("expected a grant");
        };
        let mut surface = platform
            .create_capture_surface(token, texture, Dimensions::new(64, 32), events)
            .unwrap();
        assert_eq!(store.get(texture).unwrap().dimensions(), Dimensions::new(64, 32));

        assert!(platform.produce_frame());
        assert!(matches!(rx.try_recv(), Ok(Command::FrameAvailable)));
        assert_eq!(surface.update_image().unwrap(), TexMatrix::IDENTITY);
        assert_eq!(platform.images_acknowledged(), 1);

        surface.release();
        assert!(surface.update_image().is_err());
        assert!(!platform.produce_frame());
    }

    #[test]
    fn refused_surface_is_reported_once() {
        let mut platform = SyntheticPlatform::new(metrics(), ExternalImageStore::new());
        let (events, rx) = events();
        platform.request_permission(events.clone());
        let Ok(Command::Permission(PermissionResult::Granted(token))) = rx.try_recv() else {
            panic!("expected a grant");
        };

        platform.fail_next_surface();
        let texture = ExternalTextureId(1);
        let size = Dimensions::new(64, 32);
        let err = platform
            .create_capture_surface(token, texture, size, events.clone())
            .err()
            .unwrap();
        assert!(matches!(err, CastcapError::CaptureSurface { .. }));
        assert!(platform
            .create_capture_surface(token, texture, size, events)
            .is_ok());
    }
}
