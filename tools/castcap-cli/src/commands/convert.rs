//! Convert one synthetic frame on a GPU adapter and compare it with the
//! software backend.

use std::path::PathBuf;

use castcap_capture_engine::synthetic::test_pattern;
use castcap_platform_core::{Dimensions, DisplayMetrics, TexMatrix};
use castcap_render_engine::{
    CaptureDimensions, GpuSession, InitRequest, Plane, PlaneBuffers, RgbaImage, SoftwareGles,
    WgpuConverter,
};
use serde::Serialize;

pub struct ConvertOptions {
    pub source: Dimensions,
    pub max: Dimensions,
    pub flip: bool,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct PlaneReport {
    plane: Plane,
    bytes: usize,
    /// Largest per-sample difference from the software backend.
    max_difference: u8,
}

#[derive(Debug, Serialize)]
struct ConvertReport {
    adapter: String,
    dimensions: CaptureDimensions,
    planes: Vec<PlaneReport>,
    output: Option<PathBuf>,
}

pub fn run(options: ConvertOptions, json: bool) -> anyhow::Result<()> {
    if !options.max.is_valid() {
        anyhow::bail!("maximum capture size must be positive, got {}", options.max);
    }
    let dims = CaptureDimensions::negotiate(options.source, options.max);
    let matrix = if options.flip {
        TexMatrix::VERTICAL_FLIP
    } else {
        TexMatrix::IDENTITY
    };

    let image = test_pattern(options.source, 0);
    let reference = convert_on_cpu(&image, options.max, &matrix)?;

    let mut gpu = WgpuConverter::new(dims.scaled)?;
    let adapter = gpu.adapter_name().to_string();
    let frame = gpu.convert(&image, &matrix)?;

    let planes = Plane::ALL
        .into_iter()
        .zip(&reference)
        .map(|(plane, cpu)| {
            let converted = frame.plane(plane);
            PlaneReport {
                plane,
                bytes: converted.len(),
                max_difference: converted
                    .iter()
                    .zip(cpu)
                    .map(|(a, b)| a.abs_diff(*b))
                    .max()
                    .unwrap_or(0),
            }
        })
        .collect();

    if let Some(path) = &options.output {
        std::fs::write(path, frame.to_i420())?;
        tracing::info!(path = %path.display(), bytes = frame.i420_len(), "Wrote I420 frame");
    }

    let report = ConvertReport {
        adapter,
        dimensions: dims,
        planes,
        output: options.output,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

/// The same conversion through a one-frame software session.
fn convert_on_cpu(
    image: &RgbaImage,
    max: Dimensions,
    matrix: &TexMatrix,
) -> anyhow::Result<[Vec<u8>; 3]> {
    let gl = SoftwareGles::new();
    let mut api = gl.clone();
    let source = image.dimensions();
    let request = InitRequest {
        target: max,
        suggested: Some(source),
        metrics: DisplayMetrics {
            width: source.width,
            height: source.height,
            density_dpi: 160,
        },
    };

    let mut session = GpuSession::initialize(&mut api, &request, PlaneBuffers::default())?;
    gl.store().publish(session.external_texture(), image.clone());
    let planes = match session.make_current(&mut api) {
        Ok(()) => session
            .render(&mut api, matrix)
            .map(|frame| [frame.y.to_vec(), frame.u.to_vec(), frame.v.to_vec()]),
        Err(e) => Err(e),
    };
    session.release_current(&mut api);
    session.teardown(&mut api);
    Ok(planes?)
}

fn print_report(report: &ConvertReport) {
    let dims = report.dimensions;
    println!("GPU conversion on {}", report.adapter);
    println!("{}", "=".repeat(50));
    println!(
        "  Source {} -> luma {} (chroma {})",
        dims.source, dims.scaled, dims.chroma
    );
    for plane in &report.planes {
        let status = if plane.max_difference <= 2 { "OK" } else { "WARN" };
        println!(
            "  [{status}] {:?}: {} bytes, max difference from software {}",
            plane.plane, plane.bytes, plane.max_difference
        );
    }
    if let Some(path) = &report.output {
        println!("  I420 written to {}", path.display());
    }
}
