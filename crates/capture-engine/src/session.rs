//! Capture session state machine and its render thread.
//!
//! [`CaptureController`] is the handle used from the main thread. Every
//! request it accepts, and every platform callback, is posted to a single
//! dedicated render thread that owns the GPU backend, the platform and the
//! bridge, and runs them strictly in order.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use castcap_common::clock::FrameClock;
use castcap_common::config::CaptureDefaults;
use castcap_common::error::{CastcapError, CastcapResult};
use castcap_platform_core::{CaptureToken, Dimensions, MIN_CAPTURE_EXTENT};
use castcap_render_engine::{CaptureDimensions, GlesApi, GpuSession, InitRequest, PlaneBuffers};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};

use crate::bridge::NativeBridge;
use crate::platform::{
    CapturePlatform, CaptureSurface, Command, PermissionResult, PlatformEvents,
};
use crate::scheduler::{CaptureStats, FrameDecision, FrameScheduler};

/// Lifecycle state of the capture controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureState {
    /// No session, nothing held.
    Idle,
    /// Permission requested, waiting for the answer.
    AwaitingPermission,
    /// Building the GPU session and capture surface.
    Initializing,
    /// Frames are being converted and emitted.
    Capturing,
    /// Rebuilding the session for a new display size.
    Resizing,
    /// Releasing everything.
    Stopping,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::AwaitingPermission => "awaiting-permission",
            CaptureState::Initializing => "initializing",
            CaptureState::Capturing => "capturing",
            CaptureState::Resizing => "resizing",
            CaptureState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Limits supplied with a start request. Kept for the whole session,
/// including every resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturePolicy {
    /// Maximum luma size, orientation-agnostic.
    pub max: Dimensions,

    /// Maximum frames emitted per second.
    pub max_fps: u32,

    /// Source size to capture at instead of the physical display size.
    #[serde(default)]
    pub suggested: Option<Dimensions>,
}

impl CapturePolicy {
    pub fn new(max: Dimensions, max_fps: u32) -> Self {
        Self {
            max,
            max_fps,
            suggested: None,
        }
    }

    pub fn with_suggested(mut self, suggested: Dimensions) -> Self {
        self.suggested = Some(suggested);
        self
    }

    pub fn validate(&self) -> CastcapResult<()> {
        if !self.max.is_valid() {
            return Err(CastcapError::config(format!(
                "maximum capture size must be positive, got {}",
                self.max
            )));
        }
        if self.max.width < MIN_CAPTURE_EXTENT || self.max.height < MIN_CAPTURE_EXTENT {
            return Err(CastcapError::config(format!(
                "maximum capture size must be at least {MIN_CAPTURE_EXTENT}x{MIN_CAPTURE_EXTENT}, got {}",
                self.max
            )));
        }
        if self.max_fps == 0 {
            return Err(CastcapError::config("max_fps must be at least 1"));
        }
        if let Some(suggested) = self.suggested {
            if !suggested.is_valid() {
                return Err(CastcapError::config(format!(
                    "suggested capture size must be positive, got {suggested}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self::from(&CaptureDefaults::default())
    }
}

impl From<&CaptureDefaults> for CapturePolicy {
    fn from(defaults: &CaptureDefaults) -> Self {
        Self::new(
            Dimensions::new(defaults.max_width, defaults.max_height),
            defaults.max_fps,
        )
    }
}

/// Snapshot of the controller published after every transition.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub policy: Option<CapturePolicy>,
    pub dimensions: Option<CaptureDimensions>,
    pub stats: CaptureStats,
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self {
            state: CaptureState::Idle,
            policy: None,
            dimensions: None,
            stats: CaptureStats::default(),
        }
    }
}

/// Everything a live capture session owns.
struct ActiveSession {
    gpu: GpuSession,
    surface: Box<dyn CaptureSurface>,
}

/// Session state guarded by the session lock.
struct SessionCore {
    state: CaptureState,
    policy: Option<CapturePolicy>,
    token: Option<CaptureToken>,
    active: Option<ActiveSession>,
    scheduler: FrameScheduler,
    /// Plane buffers parked between sessions.
    buffers: PlaneBuffers,
}

struct Shared {
    /// Reentrant so a resize can hold it across the nested teardown and
    /// initialize sections.
    session: ReentrantMutex<RefCell<SessionCore>>,
    status: Mutex<CaptureStatus>,
    capture_mode: Arc<AtomicBool>,
    /// Stop requests made through [`CaptureController::stop_capture`].
    stops_requested: AtomicU64,
}

impl Shared {
    fn transition(&self, core: &mut SessionCore, next: CaptureState) {
        let previous = core.state;
        core.state = next;
        tracing::info!(from = %previous, to = %next, "Capture state transition");

        let mut status = self.status.lock();
        status.state = next;
        status.policy = core.policy;
        status.dimensions = core.active.as_ref().map(|a| a.gpu.dimensions());
    }

    fn stats(&self, update: impl FnOnce(&mut CaptureStats)) {
        update(&mut self.status.lock().stats);
    }
}

/// Why a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    ProjectionStopped,
}

/// State owned by the render thread.
struct Worker {
    gl: Box<dyn GlesApi>,
    platform: Box<dyn CapturePlatform>,
    bridge: Box<dyn NativeBridge>,
    events: PlatformEvents,
    shared: Arc<Shared>,
    /// Stop commands taken off the queue so far.
    stops_handled: u64,
}

impl Worker {
    fn run(mut self, rx: Receiver<Command>) {
        let _span = tracing::info_span!("render_thread").entered();
        tracing::debug!("Render thread started");
        while let Ok(command) = rx.recv() {
            match command {
                Command::Start(policy) => self.handle_start(policy),
                Command::Stop => {
                    self.stops_handled += 1;
                    self.handle_stop(StopReason::Requested)
                }
                Command::Permission(result) => self.handle_permission(result),
                Command::FrameAvailable => self.handle_frame_available(),
                Command::DisplayChanged { display_id, size } => {
                    self.handle_display_changed(display_id, size)
                }
                Command::ProjectionStopped => self.handle_stop(StopReason::ProjectionStopped),
                Command::Barrier(done) => {
                    let _ = done.send(());
                }
                Command::Shutdown => {
                    self.handle_stop(StopReason::Requested);
                    break;
                }
            }
        }
        tracing::debug!("Render thread exiting");
    }

    /// Whether a stop was requested that the queue has not delivered yet.
    fn stop_pending(&self) -> bool {
        self.shared.stops_requested.load(Ordering::SeqCst) > self.stops_handled
    }

    /// Turn capture mode back on unless a stop is pending. Rechecks after
    /// the store so a concurrent `stop_capture` always wins.
    fn resume_capture_mode(&self) -> bool {
        self.shared.capture_mode.store(true, Ordering::SeqCst);
        if self.stop_pending() {
            self.shared.capture_mode.store(false, Ordering::SeqCst);
            tracing::debug!("Capture mode left off, stop pending");
            return false;
        }
        true
    }

    fn handle_start(&mut self, policy: CapturePolicy) {
        {
            let shared = Arc::clone(&self.shared);
            let guard = shared.session.lock();
            let mut core = guard.borrow_mut();
            if core.state != CaptureState::Idle {
                tracing::warn!(state = %core.state, "Start ignored, capture already in progress");
                return;
            }
            core.policy = Some(policy);
            self.shared
                .transition(&mut core, CaptureState::AwaitingPermission);
        }

        tracing::info!(
            max = %policy.max,
            max_fps = policy.max_fps,
            "Requesting capture permission"
        );
        self.platform.request_permission(self.events.clone());
    }

    fn handle_permission(&mut self, result: PermissionResult) {
        let shared = Arc::clone(&self.shared);
        let guard = shared.session.lock();
        let mut core = guard.borrow_mut();

        if core.state != CaptureState::AwaitingPermission {
            tracing::info!(state = %core.state, ?result, "Permission result with no pending request");
            if let PermissionResult::Granted(token) = result {
                self.platform.stop_projection(token);
            }
            return;
        }

        let token = match result {
            PermissionResult::Granted(token) => token,
            PermissionResult::Denied => {
                tracing::info!("Capture permission denied");
                core.policy = None;
                self.shared.transition(&mut core, CaptureState::Idle);
                self.bridge.capture_cancelled();
                return;
            }
        };

        let Some(policy) = core.policy else {
            self.platform.stop_projection(token);
            self.shared.transition(&mut core, CaptureState::Idle);
            return;
        };

        core.token = Some(token);
        self.shared
            .transition(&mut core, CaptureState::Initializing);

        match self.initialize(&mut core, policy, token, policy.suggested) {
            Ok(()) => {
                self.shared.stats(|s| s.started_at = Some(chrono::Utc::now()));
                self.shared.transition(&mut core, CaptureState::Capturing);
                self.resume_capture_mode();
                self.bridge.capture_started();
            }
            Err(e) => {
                if e.is_gpu_setup() {
                    tracing::error!(error = %e, "GPU setup failed, capture not started");
                } else {
                    tracing::error!(error = %e, "Failed to start capture");
                }
                self.abandon(&mut core);
                self.bridge.capture_failed(&e);
            }
        }
    }

    /// Build the GPU session and bind a capture surface to it.
    fn initialize(
        &mut self,
        core: &mut SessionCore,
        policy: CapturePolicy,
        token: CaptureToken,
        suggested: Option<Dimensions>,
    ) -> CastcapResult<()> {
        let request = InitRequest {
            target: policy.max,
            suggested,
            metrics: self.platform.display_metrics(),
        };

        let buffers = std::mem::take(&mut core.buffers);
        let gpu = GpuSession::initialize(self.gl.as_mut(), &request, buffers)?;
        let dims = gpu.dimensions();

        let surface = match self.platform.create_capture_surface(
            token,
            gpu.external_texture(),
            dims.source,
            self.events.clone(),
        ) {
            Ok(surface) => surface,
            Err(e) => {
                core.buffers = gpu.teardown(self.gl.as_mut()).buffers;
                return Err(e);
            }
        };

        core.scheduler.reset(policy.max_fps);
        core.active = Some(ActiveSession { gpu, surface });
        tracing::info!(
            source = %dims.source,
            scaled = %dims.scaled,
            max_fps = policy.max_fps,
            "Capture session ready"
        );
        Ok(())
    }

    /// Release the capture surface and GPU session, capture surface first.
    /// Returns the make-current error if the GPU objects could not be
    /// deleted cleanly.
    fn release_session(&mut self, core: &mut SessionCore) -> Option<CastcapError> {
        let mut active = core.active.take()?;
        let suspect = active.gpu.is_context_suspect();
        active.surface.release();
        let outcome = active.gpu.teardown(self.gl.as_mut());
        core.buffers = outcome.buffers;
        if suspect && outcome.make_current_error.is_some() {
            tracing::warn!("Make-current failed again after an aborted frame");
        }
        outcome.make_current_error
    }

    /// Drop back to idle after a failure, releasing whatever is held.
    fn abandon(&mut self, core: &mut SessionCore) {
        self.shared.capture_mode.store(false, Ordering::Release);
        self.release_session(core);
        if let Some(token) = core.token.take() {
            self.platform.stop_projection(token);
        }
        core.policy = None;
        self.shared.transition(core, CaptureState::Idle);
    }

    fn handle_frame_available(&mut self) {
        if !self.shared.capture_mode.load(Ordering::Acquire) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let guard = shared.session.lock();
        let mut core = guard.borrow_mut();
        if core.state != CaptureState::Capturing {
            return;
        }
        self.shared.stats(|s| s.frames_available += 1);

        let SessionCore {
            active, scheduler, ..
        } = &mut *core;
        let Some(ActiveSession { gpu, surface }) = active.as_mut() else {
            return;
        };
        let gl = self.gl.as_mut();

        if let Err(e) = gpu.make_current(gl) {
            tracing::error!(error = %e, "Frame aborted, context could not be made current");
            self.shared.stats(|s| s.frames_failed += 1);
            return;
        }

        let matrix = match surface.update_image() {
            Ok(matrix) => matrix,
            Err(e) => {
                tracing::warn!(error = %e, "Frame aborted, capture image unavailable");
                self.shared.stats(|s| s.frames_failed += 1);
                gpu.release_current(gl);
                return;
            }
        };

        let now_ns = match scheduler.admit() {
            FrameDecision::Render { now_ns } => now_ns,
            FrameDecision::Gated => {
                tracing::trace!("Frame dropped by rate gate");
                self.shared.stats(|s| s.frames_dropped += 1);
                gpu.release_current(gl);
                return;
            }
        };

        match gpu.render(gl, &matrix) {
            Ok(frame) => {
                self.bridge.frame_ready(&frame);
                scheduler.commit(now_ns);
                self.shared.stats(|s| s.frames_rendered += 1);
            }
            Err(e) => {
                tracing::error!(error = %e, "Frame aborted, conversion failed");
                self.shared.stats(|s| s.frames_failed += 1);
            }
        }
        gpu.release_current(gl);
    }

    fn handle_display_changed(&mut self, display_id: u32, size: Dimensions) {
        if self.stop_pending() {
            tracing::debug!(display_id, size = %size, "Display change dropped, stop pending");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let guard = shared.session.lock();

        let (policy, token) = {
            let core = guard.borrow();
            if core.state != CaptureState::Capturing {
                tracing::debug!(state = %core.state, "Display change ignored");
                return;
            }
            let current = core.active.as_ref().map(|a| a.gpu.dimensions().source);
            if current == Some(size) || !size.is_valid() {
                return;
            }
            match (core.policy, core.token) {
                (Some(policy), Some(token)) => (policy, token),
                _ => return,
            }
        };

        tracing::info!(display_id, size = %size, "Display changed, resizing capture");
        self.shared.capture_mode.store(false, Ordering::Release);
        {
            let mut core = guard.borrow_mut();
            self.shared.transition(&mut core, CaptureState::Resizing);
        }

        if let Some(e) = self.teardown_nested(&guard) {
            tracing::warn!(error = %e, "Context lost during resize, stopping capture");
            let mut core = guard.borrow_mut();
            self.abandon(&mut core);
            self.bridge.capture_stopped();
            return;
        }

        let result = {
            let mut core = guard.borrow_mut();
            self.initialize(&mut core, policy, token, Some(size))
        };

        let mut core = guard.borrow_mut();
        match result {
            Ok(()) => {
                self.shared.stats(|s| s.resizes += 1);
                self.shared.transition(&mut core, CaptureState::Capturing);
                self.resume_capture_mode();
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to rebuild capture after resize");
                self.abandon(&mut core);
                self.bridge.capture_failed(&e);
                self.bridge.capture_stopped();
            }
        }
    }

    /// Teardown as a nested section of an already held session lock.
    fn teardown_nested(
        &mut self,
        outer: &parking_lot::ReentrantMutexGuard<'_, RefCell<SessionCore>>,
    ) -> Option<CastcapError> {
        let shared = Arc::clone(&self.shared);
        let _inner = shared.session.lock();
        let mut core = outer.borrow_mut();
        self.release_session(&mut core)
    }

    fn handle_stop(&mut self, reason: StopReason) {
        self.shared.capture_mode.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let guard = shared.session.lock();
        let mut core = guard.borrow_mut();

        match core.state {
            CaptureState::Idle => {
                tracing::debug!(?reason, "Stop ignored, nothing to release");
            }
            CaptureState::AwaitingPermission => {
                tracing::info!("Stop while awaiting permission, dropping request");
                core.policy = None;
                self.shared.transition(&mut core, CaptureState::Idle);
            }
            _ => {
                self.shared.transition(&mut core, CaptureState::Stopping);

                if let Some(e) = self.release_session(&mut core) {
                    tracing::warn!(error = %e, "GPU resources presumed invalid, released best-effort");
                }
                if let Some(token) = core.token.take() {
                    if reason == StopReason::Requested {
                        self.platform.stop_projection(token);
                    }
                }
                core.policy = None;
                self.shared.transition(&mut core, CaptureState::Idle);
                self.bridge.capture_stopped();
            }
        }
    }
}

/// Handle to the capture state machine and its render thread.
pub struct CaptureController {
    tx: Sender<Command>,
    events: PlatformEvents,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureController {
    /// Spawn the render thread.
    pub fn spawn(
        gl: Box<dyn GlesApi>,
        platform: Box<dyn CapturePlatform>,
        bridge: Box<dyn NativeBridge>,
        clock: Arc<dyn FrameClock>,
    ) -> CastcapResult<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let capture_mode = Arc::new(AtomicBool::new(false));
        let events = PlatformEvents::new(tx.clone(), Arc::clone(&capture_mode));

        let shared = Arc::new(Shared {
            session: ReentrantMutex::new(RefCell::new(SessionCore {
                state: CaptureState::Idle,
                policy: None,
                token: None,
                active: None,
                scheduler: FrameScheduler::new(CaptureDefaults::default().max_fps, clock),
                buffers: PlaneBuffers::default(),
            })),
            status: Mutex::new(CaptureStatus::default()),
            capture_mode,
            stops_requested: AtomicU64::new(0),
        });

        let worker = Worker {
            gl,
            platform,
            bridge,
            events: events.clone(),
            shared: Arc::clone(&shared),
            stops_handled: 0,
        };

        let thread = std::thread::Builder::new()
            .name("castcap-render".to_string())
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            tx,
            events,
            shared,
            thread: Some(thread),
        })
    }

    /// Request capture with `policy`. Ignored unless idle.
    pub fn start_capture(&self, policy: CapturePolicy) -> CastcapResult<()> {
        policy.validate()?;
        self.post(Command::Start(policy))
    }

    /// Stop capturing. Frame notifications are rejected from this point on,
    /// and a resize still queued ahead of the stop is dropped.
    pub fn stop_capture(&self) -> CastcapResult<()> {
        self.shared.stops_requested.fetch_add(1, Ordering::SeqCst);
        self.shared.capture_mode.store(false, Ordering::SeqCst);
        self.post(Command::Stop)
    }

    /// Handle for the platform's callbacks.
    pub fn events(&self) -> PlatformEvents {
        self.events.clone()
    }

    /// Whether frames are currently being processed.
    pub fn is_capturing(&self) -> bool {
        self.shared.capture_mode.load(Ordering::Acquire)
    }

    pub fn state(&self) -> CaptureState {
        self.shared.status.lock().state
    }

    /// Dimensions of the live session, if any.
    pub fn dimensions(&self) -> Option<CaptureDimensions> {
        self.shared.status.lock().dimensions
    }

    /// Policy of the live session, if any.
    pub fn policy(&self) -> Option<CapturePolicy> {
        self.shared.status.lock().policy
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.status.lock().stats.clone()
    }

    pub fn status(&self) -> CaptureStatus {
        self.shared.status.lock().clone()
    }

    /// Block until every command posted before this call has been handled.
    pub fn sync(&self) -> CastcapResult<()> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.post(Command::Barrier(done_tx))?;
        done_rx
            .recv()
            .map_err(|_| CastcapError::invalid_state("render thread exited"))
    }

    /// Stop any capture and join the render thread.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn post(&self, command: Command) -> CastcapResult<()> {
        self.tx
            .send(command)
            .map_err(|_| CastcapError::invalid_state("render thread exited"))
    }

    fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.capture_mode.store(false, Ordering::Release);
        let _ = self.tx.send(Command::Shutdown);
        if thread.join().is_err() {
            tracing::error!("Render thread panicked");
        }
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_validation() {
        assert!(CapturePolicy::default().validate().is_ok());
        assert!(CapturePolicy::new(Dimensions::new(0, 1080), 30)
            .validate()
            .is_err());
        assert!(CapturePolicy::new(Dimensions::new(1920, 1080), 0)
            .validate()
            .is_err());
        assert!(CapturePolicy::default()
            .with_suggested(Dimensions::new(0, 0))
            .validate()
            .is_err());
    }

    #[test]
    fn policy_below_smallest_capture_is_rejected() {
        assert!(CapturePolicy::new(Dimensions::new(4, 1080), 30)
            .validate()
            .is_err());
        assert!(CapturePolicy::new(Dimensions::new(1920, 7), 30)
            .validate()
            .is_err());
        assert!(CapturePolicy::new(Dimensions::new(8, 8), 30)
            .validate()
            .is_ok());
    }

    #[test]
    fn status_serializes_with_state_and_stats() {
        let status = CaptureStatus {
            policy: Some(CapturePolicy::default()),
            ..CaptureStatus::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "Idle");
        assert_eq!(value["policy"]["max_fps"], 30);
        assert_eq!(value["stats"]["frames_rendered"], 0);

        let policy: CapturePolicy =
            serde_json::from_str(r#"{"max":{"width":1280,"height":720},"max_fps":15}"#).unwrap();
        assert_eq!(policy, CapturePolicy::new(Dimensions::new(1280, 720), 15));
    }

    #[test]
    fn default_policy_matches_config_defaults() {
        let policy = CapturePolicy::default();
        assert_eq!(policy.max, Dimensions::new(1920, 1080));
        assert_eq!(policy.max_fps, 30);
        assert_eq!(policy.suggested, None);
    }

    #[test]
    fn state_names() {
        assert_eq!(CaptureState::AwaitingPermission.to_string(), "awaiting-permission");
        assert_eq!(CaptureState::Idle.to_string(), "idle");
    }
}
