//! Clock and frame-rate utilities.
//!
//! Frame gating compares monotonic timestamps taken on the render thread.
//! The clock is a trait so tests and the simulator can drive time by hand
//! instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of monotonic timestamps in nanoseconds.
pub trait FrameClock: Send + Sync {
    /// Nanoseconds since an arbitrary fixed epoch.
    fn now_ns(&self) -> u64;
}

/// Wall-independent clock anchored to the moment it was created.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,

    /// Wall-clock time at epoch (RFC 3339).
    epoch_wall: String,
}

impl MonotonicClock {
    /// Create a new clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Wall-clock time at the clock's epoch.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::start()
    }
}

impl FrameClock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ns: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.now_ns.fetch_add(ms * 1_000_000, Ordering::SeqCst);
    }

    /// Advance the clock by `ns` nanoseconds.
    pub fn advance_ns(&self, ns: u64) {
        self.now_ns.fetch_add(ns, Ordering::SeqCst);
    }

    /// Set an absolute time.
    pub fn set_ns(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }
}

impl FrameClock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}

/// Maximum-frame-rate gate.
///
/// Holds the timestamp of the last emitted frame. Checking and committing
/// are separate so a frame that fails to render does not consume a slot.
#[derive(Debug, Clone)]
pub struct FrameGate {
    max_fps: u32,
    min_interval_ns: u64,
    last_emit_ns: Option<u64>,
}

impl FrameGate {
    /// Create a gate for the given maximum rate. A rate of zero is treated
    /// as one frame per second.
    pub fn new(max_fps: u32) -> Self {
        let max_fps = max_fps.max(1);
        Self {
            max_fps,
            min_interval_ns: 1_000_000_000 / max_fps as u64,
            last_emit_ns: None,
        }
    }

    /// Whether a frame arriving at `now_ns` may be emitted.
    /// The first frame always passes.
    pub fn should_emit(&self, now_ns: u64) -> bool {
        match self.last_emit_ns {
            None => true,
            Some(last) => now_ns.saturating_sub(last) >= self.min_interval_ns,
        }
    }

    /// Record that a frame was emitted at `now_ns`.
    pub fn mark_emitted(&mut self, now_ns: u64) {
        self.last_emit_ns = Some(now_ns);
    }

    /// Configured maximum frame rate.
    pub fn max_fps(&self) -> u32 {
        self.max_fps
    }

    /// Minimum spacing between emitted frames in nanoseconds.
    pub fn interval_ns(&self) -> u64 {
        self.min_interval_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::start();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
        assert!(!clock.epoch_wall().is_empty());
    }

    #[test]
    fn test_manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance_ms(5);
        assert_eq!(other.now_ns(), 5_000_000);
        other.set_ns(42);
        assert_eq!(clock.now_ns(), 42);
        clock.advance_ns(8);
        assert_eq!(other.now_ns(), 50);
    }

    #[test]
    fn test_gate_thirty_fps() {
        let mut gate = FrameGate::new(30);
        assert!(gate.should_emit(0)); // first frame always passes
        gate.mark_emitted(0);
        assert!(!gate.should_emit(10_000_000)); // 10ms later, too soon
        assert!(gate.should_emit(40_000_000)); // 40ms later, past 33.3ms
    }

    #[test]
    fn test_gate_check_does_not_commit() {
        let gate = FrameGate::new(60);
        assert!(gate.should_emit(100));
        assert!(gate.should_emit(101));
    }

    #[test]
    fn test_gate_zero_fps_is_one_per_second() {
        let mut gate = FrameGate::new(0);
        assert_eq!(gate.max_fps(), 1);
        assert_eq!(gate.interval_ns(), 1_000_000_000);
        gate.mark_emitted(10);
        assert!(!gate.should_emit(20));
        assert!(gate.should_emit(1_000_000_010));
    }
}
