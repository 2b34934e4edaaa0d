//! Native Bridge: the consumer of lifecycle events and converted frames.

use castcap_common::error::CastcapError;
use castcap_render_engine::PlanarFrame;
use crossbeam_channel::Sender;

/// Receiver of capture lifecycle events and frames.
///
/// All methods are called on the render thread. `frame_ready` borrows the
/// converter's buffers; implementations copy out whatever they keep.
pub trait NativeBridge: Send {
    fn capture_started(&mut self);

    fn capture_stopped(&mut self);

    /// Permission was denied.
    fn capture_cancelled(&mut self);

    fn frame_ready(&mut self, frame: &PlanarFrame<'_>);

    /// Session setup failed after permission was granted.
    fn capture_failed(&mut self, error: &CastcapError) {
        let _ = error;
    }
}

/// A frame copied out of the converter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl From<&PlanarFrame<'_>> for OwnedFrame {
    fn from(frame: &PlanarFrame<'_>) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            y: frame.y.to_vec(),
            u: frame.u.to_vec(),
            v: frame.v.to_vec(),
        }
    }
}

/// Bridge callbacks as values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Started,
    Stopped,
    Cancelled,
    Failed(String),
    Frame(OwnedFrame),
}

/// Forwards every callback into a channel.
#[derive(Debug, Clone)]
pub struct ChannelBridge {
    tx: Sender<BridgeEvent>,
    copy_frames: bool,
}

impl ChannelBridge {
    /// Frames are sent with full plane copies.
    pub fn new(tx: Sender<BridgeEvent>) -> Self {
        Self {
            tx,
            copy_frames: true,
        }
    }

    /// Frames are sent with dimensions only, planes left empty.
    pub fn dimensions_only(tx: Sender<BridgeEvent>) -> Self {
        Self {
            tx,
            copy_frames: false,
        }
    }

    fn send(&self, event: BridgeEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Bridge receiver dropped");
        }
    }
}

impl NativeBridge for ChannelBridge {
    fn capture_started(&mut self) {
        self.send(BridgeEvent::Started);
    }

    fn capture_stopped(&mut self) {
        self.send(BridgeEvent::Stopped);
    }

    fn capture_cancelled(&mut self) {
        self.send(BridgeEvent::Cancelled);
    }

    fn frame_ready(&mut self, frame: &PlanarFrame<'_>) {
        let owned = if self.copy_frames {
            OwnedFrame::from(frame)
        } else {
            OwnedFrame {
                width: frame.width,
                height: frame.height,
                y: Vec::new(),
                u: Vec::new(),
                v: Vec::new(),
            }
        };
        self.send(BridgeEvent::Frame(owned));
    }

    fn capture_failed(&mut self, error: &CastcapError) {
        self.send(BridgeEvent::Failed(error.to_string()));
    }
}
