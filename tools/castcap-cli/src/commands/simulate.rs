//! Run a full capture session on the software backend.

use std::sync::Arc;
use std::time::Duration;

use castcap_capture_engine::{
    BridgeEvent, CaptureController, CapturePolicy, CaptureState, CaptureStats, ChannelBridge,
    NativeBridge, PermissionMode, SyntheticPlatform,
};
use castcap_common::clock::MonotonicClock;
use castcap_common::error::CastcapError;
use castcap_platform_core::{Dimensions, DisplayMetrics};
use castcap_render_engine::{CaptureDimensions, ExternalImageStore, SoftwareGles};
use crossbeam_channel::Sender;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};

pub struct SimulateOptions {
    pub source: Dimensions,
    pub max: Dimensions,
    pub max_fps: u32,
    pub source_fps: u32,
    pub duration_secs: f64,
    pub resize_to: Option<Dimensions>,
    pub deny: bool,
    #[cfg(feature = "gst")]
    pub pipeline: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    Completed,
    Cancelled,
    Failed { error: String },
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    outcome: Outcome,
    policy: CapturePolicy,
    initial: Option<CaptureDimensions>,
    frames_produced: u64,
    frames_delivered: u64,
    sizes_delivered: Vec<Dimensions>,
    stats: CaptureStats,
    drop_rate: f64,
}

pub async fn run(options: SimulateOptions, json: bool) -> anyhow::Result<()> {
    if options.source_fps == 0 {
        anyhow::bail!("--source-fps must be at least 1");
    }
    if !options.duration_secs.is_finite() || options.duration_secs <= 0.0 {
        anyhow::bail!("--duration-secs must be positive");
    }
    let policy = CapturePolicy::new(options.max, options.max_fps);
    policy.validate()?;

    let store = ExternalImageStore::new();
    let gl = SoftwareGles::with_store(store.clone());
    let metrics = DisplayMetrics {
        width: options.source.width,
        height: options.source.height,
        density_dpi: 320,
    };
    let permission = if options.deny {
        PermissionMode::AutoDeny
    } else {
        PermissionMode::AutoGrant
    };
    let platform = SyntheticPlatform::new(metrics, store).with_permission(permission);

    let (tx, rx) = crossbeam_channel::unbounded();
    let controller = CaptureController::spawn(
        Box::new(gl),
        Box::new(platform.clone()),
        make_bridge(tx, &options)?,
        Arc::new(MonotonicClock::start()),
    )?;

    controller.start_capture(policy)?;
    // The permission answer is posted while the start request is handled.
    controller.sync()?;
    controller.sync()?;
    let initial = controller.dimensions();

    let mut frames_produced = 0;
    if controller.state() == CaptureState::Capturing {
        if !json {
            if let Some(dims) = initial {
                println!(
                    "Capturing {} as {} (chroma {}), max {} fps",
                    dims.source, dims.scaled, dims.chroma, policy.max_fps
                );
            }
        }
        frames_produced = drive(&platform, &options).await;
    }

    controller.stop_capture()?;
    controller.sync()?;
    let stats = controller.stats();
    controller.shutdown();

    let mut outcome = Outcome::Completed;
    let mut frames_delivered = 0;
    let mut sizes_delivered: Vec<Dimensions> = Vec::new();
    for event in rx.try_iter() {
        match event {
            BridgeEvent::Frame(frame) => {
                frames_delivered += 1;
                let size = Dimensions::new(frame.width, frame.height);
                if sizes_delivered.last() != Some(&size) {
                    sizes_delivered.push(size);
                }
            }
            BridgeEvent::Cancelled => outcome = Outcome::Cancelled,
            BridgeEvent::Failed(error) => outcome = Outcome::Failed { error },
            BridgeEvent::Started | BridgeEvent::Stopped => {}
        }
    }

    let report = SimulationReport {
        outcome,
        policy,
        initial,
        frames_produced,
        frames_delivered,
        sizes_delivered,
        drop_rate: stats.drop_rate(),
        stats,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

/// Produce display images at the source rate until the duration elapses,
/// resizing halfway through if requested. Returns the images produced.
async fn drive(platform: &SyntheticPlatform, options: &SimulateOptions) -> u64 {
    let duration = Duration::from_secs_f64(options.duration_secs);
    let start = Instant::now();
    let deadline = start + duration;
    let resize_at = start + duration / 2;

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(
        1.0 / f64::from(options.source_fps),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut resize_to = options.resize_to;
    let mut produced = 0;
    loop {
        let tick = tokio::select! {
            tick = ticker.tick() => tick,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping capture");
                break;
            }
        };
        if tick >= deadline {
            break;
        }
        if tick >= resize_at {
            if let Some(size) = resize_to.take() {
                tracing::info!(size = %size, "Rotating synthetic display");
                platform.set_display_size(size);
            }
        }
        if platform.produce_frame() {
            produced += 1;
        }
    }
    produced
}

#[cfg(feature = "gst")]
fn make_bridge(
    tx: Sender<BridgeEvent>,
    options: &SimulateOptions,
) -> anyhow::Result<Box<dyn NativeBridge>> {
    use castcap_capture_engine::gst_sink::AppSrcBridge;

    let channel = ChannelBridge::dimensions_only(tx);
    match &options.pipeline {
        Some(tail) => Ok(Box::new(AppSrcBridge::from_launch(
            channel,
            tail,
            options.max_fps,
        )?)),
        None => Ok(Box::new(channel)),
    }
}

#[cfg(not(feature = "gst"))]
fn make_bridge(
    tx: Sender<BridgeEvent>,
    _options: &SimulateOptions,
) -> anyhow::Result<Box<dyn NativeBridge>> {
    Ok(Box::new(ChannelBridge::dimensions_only(tx)))
}

fn print_report(report: &SimulationReport) {
    println!("Simulated capture");
    println!("{}", "=".repeat(50));
    match &report.outcome {
        Outcome::Completed => println!("[OK] Session completed"),
        Outcome::Cancelled => println!("[WARN] {}", CastcapError::PermissionDenied),
        Outcome::Failed { error } => println!("[FAIL] Capture failed: {error}"),
    }
    println!(
        "  Policy: max {} @ {} fps",
        report.policy.max, report.policy.max_fps
    );
    println!("  Images produced: {}", report.frames_produced);
    println!("  Frames delivered: {}", report.frames_delivered);
    println!(
        "  Dropped by rate gate: {} ({:.1}%)",
        report.stats.frames_dropped, report.drop_rate
    );
    println!("  Failed frames: {}", report.stats.frames_failed);
    println!("  Resizes: {}", report.stats.resizes);
    if !report.sizes_delivered.is_empty() {
        let sizes: Vec<String> = report
            .sizes_delivered
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("  Frame sizes: {}", sizes.join(" -> "));
    }
    if let Some(started) = report.stats.started_at {
        println!("  Started at: {}", started.to_rfc3339());
    }
}
