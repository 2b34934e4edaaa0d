//! GStreamer hand-off: push converted frames into an `appsrc` as I420.
//!
//! Frames are copied plane by plane into buffers from a
//! [`gst_video::VideoBufferPool`] sized for the current capture size. The
//! pool and the source caps are rebuilt together whenever the size changes.

use std::sync::OnceLock;
use std::time::Instant;

use castcap_common::error::{CastcapError, CastcapResult};
use castcap_platform_core::Dimensions;
use castcap_render_engine::{PlanarFrame, Plane};
use gst::prelude::*;
use gst_video::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::bridge::NativeBridge;

const APPSRC_NAME: &str = "castcap_src";

/// Buffers the pool may hold at once.
const POOL_MAX_BUFFERS: u32 = 4;

fn init_gstreamer() -> CastcapResult<()> {
    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();
    let init_res = GST_INIT.get_or_init(|| gst::init().map_err(|e| e.to_string()));
    match init_res {
        Ok(()) => Ok(()),
        Err(e) => Err(CastcapError::pipeline(format!(
            "Failed to initialize GStreamer: {e}"
        ))),
    }
}

/// Full-range BT.709: range 0-255, BT.709 matrix, transfer and primaries.
pub fn full_range_bt709() -> gst_video::VideoColorimetry {
    gst_video::VideoColorimetry::new(
        gst_video::VideoColorRange::Range0_255,
        gst_video::VideoColorMatrix::Bt709,
        gst_video::VideoTransferFunction::Bt709,
        gst_video::VideoColorPrimaries::Bt709,
    )
}

/// Video info for an I420 frame of `size` at `max_fps`.
pub fn i420_info(size: Dimensions, max_fps: u32) -> CastcapResult<gst_video::VideoInfo> {
    gst_video::VideoInfo::builder(gst_video::VideoFormat::I420, size.width, size.height)
        .colorimetry(&full_range_bt709())
        .fps(gst::Fraction::new(max_fps as i32, 1))
        .build()
        .map_err(|e| CastcapError::pipeline(format!("No I420 video info for {size}: {e}")))
}

/// Pooled I420 buffers for one frame size.
struct FramePool {
    size: Dimensions,
    info: gst_video::VideoInfo,
    caps: gst::Caps,
    pool: gst_video::VideoBufferPool,
}

impl FramePool {
    fn new(size: Dimensions, max_fps: u32) -> CastcapResult<Self> {
        let info = i420_info(size, max_fps)?;
        let caps = info
            .to_caps()
            .map_err(|e| CastcapError::pipeline(format!("No caps for {size}: {e}")))?;

        let pool = gst_video::VideoBufferPool::new();
        let mut config = pool.config();
        config.set_params(Some(&caps), info.size() as u32, 1, POOL_MAX_BUFFERS);
        pool.set_config(config)
            .map_err(|e| CastcapError::pipeline(format!("Buffer pool rejected config: {e}")))?;
        pool.set_active(true)
            .map_err(|e| CastcapError::pipeline(format!("Failed to activate buffer pool: {e}")))?;

        Ok(Self {
            size,
            info,
            caps,
            pool,
        })
    }

    /// A pooled buffer holding `frame`, stamped with `pts`.
    fn fill(&self, frame: &PlanarFrame<'_>, pts: gst::ClockTime) -> CastcapResult<gst::Buffer> {
        let mut buffer = self
            .pool
            .acquire_buffer(None)
            .map_err(|flow| CastcapError::pipeline(format!("No pooled buffer: {flow:?}")))?;
        buffer.make_mut().set_pts(pts);

        let mut vframe = gst_video::VideoFrame::from_buffer_writable(buffer, &self.info)
            .map_err(|_| CastcapError::pipeline("Pooled buffer cannot be mapped as I420"))?;
        for (index, plane) in Plane::ALL.into_iter().enumerate() {
            let width = plane.extent(frame.luma_size()).width as usize;
            copy_plane(&mut vframe, index as u32, frame.plane(plane), width)?;
        }
        Ok(vframe.into_buffer())
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        if let Err(e) = self.pool.set_active(false) {
            tracing::debug!(error = %e, "Failed to deactivate buffer pool");
        }
    }
}

/// Copy tightly packed rows of `width` bytes into a plane with the frame's
/// own stride.
fn copy_plane(
    vframe: &mut gst_video::VideoFrame<gst_video::video_frame::Writable>,
    index: u32,
    src: &[u8],
    width: usize,
) -> CastcapResult<()> {
    let stride = vframe
        .plane_stride()
        .get(index as usize)
        .copied()
        .ok_or_else(|| CastcapError::pipeline(format!("I420 frame has no plane {index}")))?
        as usize;
    let dest = vframe
        .plane_data_mut(index)
        .map_err(|e| CastcapError::pipeline(format!("Plane {index} not writable: {e}")))?;

    for (dest_row, src_row) in dest.chunks_mut(stride).zip(src.chunks_exact(width)) {
        let n = width.min(dest_row.len());
        dest_row[..n].copy_from_slice(&src_row[..n]);
    }
    Ok(())
}

/// Wraps another bridge and additionally pushes every frame into an
/// `appsrc` at the head of a pipeline.
pub struct AppSrcBridge<B> {
    inner: B,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    pool: Option<FramePool>,
    max_fps: u32,
    epoch: Instant,
}

impl<B: NativeBridge> AppSrcBridge<B> {
    /// Build `appsrc ! <tail>` and start it, e.g. with a tail of
    /// `"videoconvert ! x264enc ! fakesink"`.
    pub fn from_launch(inner: B, tail: &str, max_fps: u32) -> CastcapResult<Self> {
        init_gstreamer()?;

        let appsrc = gst_app::AppSrc::builder()
            .name(APPSRC_NAME)
            .is_live(true)
            .format(gst::Format::Time)
            .do_timestamp(false)
            .build();
        let tail = gst::parse::bin_from_description(tail, true)
            .map_err(|e| CastcapError::pipeline(format!("Failed to build pipeline: {e}")))?;

        let pipeline = gst::Pipeline::new();
        pipeline
            .add_many([appsrc.upcast_ref::<gst::Element>(), tail.upcast_ref()])
            .map_err(|e| CastcapError::pipeline(format!("Failed to assemble pipeline: {e}")))?;
        appsrc
            .link(&tail)
            .map_err(|e| CastcapError::pipeline(format!("appsrc cannot feed pipeline: {e}")))?;

        pipeline.set_state(gst::State::Playing).map_err(|e| {
            CastcapError::pipeline(format!("Failed to start pipeline: {e:?}"))
        })?;

        Ok(Self {
            inner,
            pipeline,
            appsrc,
            pool: None,
            max_fps,
            epoch: Instant::now(),
        })
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Copy `frame` into a pooled buffer and push it, switching caps and
    /// pool first if the frame size changed.
    fn push(&mut self, frame: &PlanarFrame<'_>) -> CastcapResult<gst::FlowSuccess> {
        let size = frame.luma_size();
        let pool = match self.pool.take() {
            Some(pool) if pool.size == size => pool,
            _ => {
                let pool = FramePool::new(size, self.max_fps)?;
                self.appsrc.set_caps(Some(&pool.caps));
                tracing::debug!(size = %size, "appsrc caps and buffer pool updated");
                pool
            }
        };

        let pts = gst::ClockTime::from_nseconds(self.epoch.elapsed().as_nanos() as u64);
        let buffer = pool.fill(frame, pts);
        self.pool = Some(pool);

        self.appsrc
            .push_buffer(buffer?)
            .map_err(|flow| CastcapError::pipeline(format!("appsrc refused frame: {flow:?}")))
    }
}

impl<B: NativeBridge> NativeBridge for AppSrcBridge<B> {
    fn capture_started(&mut self) {
        self.epoch = Instant::now();
        self.inner.capture_started();
    }

    fn capture_stopped(&mut self) {
        if let Err(flow) = self.appsrc.end_of_stream() {
            tracing::debug!(?flow, "appsrc did not take end-of-stream");
        }
        self.pool = None;
        self.inner.capture_stopped();
    }

    fn capture_cancelled(&mut self) {
        self.inner.capture_cancelled();
    }

    fn frame_ready(&mut self, frame: &PlanarFrame<'_>) {
        if let Err(e) = self.push(frame) {
            tracing::warn!(error = %e, "Failed to push frame to appsrc");
        }
        self.inner.frame_ready(frame);
    }

    fn capture_failed(&mut self, error: &CastcapError) {
        self.inner.capture_failed(error);
    }
}

impl<B> Drop for AppSrcBridge<B> {
    fn drop(&mut self) {
        self.pool = None;
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            tracing::warn!(error = ?e, "Failed to stop appsrc pipeline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeEvent, ChannelBridge};

    fn planes(size: Dimensions) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let luma = size.pixel_count();
        let chroma = size.half().pixel_count();
        (
            (0..luma).map(|i| (i % 251) as u8).collect(),
            vec![90; chroma],
            vec![200; chroma],
        )
    }

    fn frame<'a>(size: Dimensions, planes: &'a (Vec<u8>, Vec<u8>, Vec<u8>)) -> PlanarFrame<'a> {
        PlanarFrame {
            width: size.width,
            height: size.height,
            y: &planes.0,
            u: &planes.1,
            v: &planes.2,
        }
    }

    #[test]
    fn info_carries_full_range_bt709() {
        init_gstreamer().unwrap();
        let info = i420_info(Dimensions::new(320, 240), 30).unwrap();
        let colorimetry = info.colorimetry();
        assert_eq!(colorimetry.range(), gst_video::VideoColorRange::Range0_255);
        assert_eq!(colorimetry.matrix(), gst_video::VideoColorMatrix::Bt709);
        assert_eq!(info.fps(), gst::Fraction::new(30, 1));
        assert_eq!(info.format(), gst_video::VideoFormat::I420);
    }

    #[test]
    fn pooled_buffer_keeps_rows_across_strides() {
        init_gstreamer().unwrap();
        // 20 is not a multiple of the 4-byte row alignment once halved.
        let size = Dimensions::new(20, 8);
        let data = planes(size);
        let pool = FramePool::new(size, 30).unwrap();
        let buffer = pool
            .fill(&frame(size, &data), gst::ClockTime::from_mseconds(5))
            .unwrap();
        assert_eq!(buffer.pts(), Some(gst::ClockTime::from_mseconds(5)));

        let vframe = gst_video::VideoFrame::from_buffer_readable(buffer, &pool.info).unwrap();
        let stride = vframe.plane_stride()[0] as usize;
        let y = vframe.plane_data(0).unwrap();
        for row in 0..8 {
            assert_eq!(&y[row * stride..row * stride + 20], &data.0[row * 20..(row + 1) * 20]);
        }
        let u_stride = vframe.plane_stride()[1] as usize;
        let u = vframe.plane_data(1).unwrap();
        assert_eq!(&u[u_stride..u_stride + 10], &[90; 10]);
    }

    #[test]
    fn frames_flow_through_a_fakesink_pipeline() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut bridge =
            AppSrcBridge::from_launch(ChannelBridge::dimensions_only(tx), "fakesink", 30).unwrap();
        bridge.capture_started();

        let small = Dimensions::new(16, 16);
        let data = planes(small);
        assert!(bridge.push(&frame(small, &data)).is_ok());

        let rotated = Dimensions::new(16, 32);
        let data = planes(rotated);
        bridge.frame_ready(&frame(rotated, &data));
        assert_eq!(bridge.pool.as_ref().map(|p| p.size), Some(rotated));

        bridge.capture_stopped();
        assert!(bridge.pool.is_none());
        let events: Vec<BridgeEvent> = rx.try_iter().collect();
        assert_eq!(events.first(), Some(&BridgeEvent::Started));
        assert_eq!(events.last(), Some(&BridgeEvent::Stopped));
    }

    #[test]
    fn unknown_element_is_reported() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let result = AppSrcBridge::from_launch(
            ChannelBridge::dimensions_only(tx),
            "no-such-element-castcap",
            30,
        );
        assert!(matches!(result, Err(CastcapError::Pipeline { .. })));
    }
}
