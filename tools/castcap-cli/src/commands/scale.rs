//! Show the negotiated capture dimensions for a display size.

use castcap_platform_core::{fit, Dimensions};
use castcap_render_engine::CaptureDimensions;

pub fn run(source: Dimensions, max: Dimensions, json: bool) -> anyhow::Result<()> {
    if !max.is_valid() {
        anyhow::bail!("maximum capture size must be positive, got {max}");
    }

    let dims = CaptureDimensions::negotiate(source, max);
    if json {
        println!("{}", serde_json::to_string_pretty(&dims)?);
        return Ok(());
    }

    let fitted = fit(source, max);
    println!("Source:  {}", dims.source);
    let limit = if source.is_portrait() { max.swapped() } else { max };
    println!("Limit:   {limit}");
    println!("Fitted:  {fitted}");
    println!("Luma:    {} ({} bytes)", dims.scaled, dims.scaled.pixel_count());
    println!(
        "Chroma:  {} x2 ({} bytes each)",
        dims.chroma,
        dims.chroma.pixel_count()
    );
    println!(
        "I420:    {} bytes per frame",
        dims.scaled.pixel_count() + 2 * dims.chroma.pixel_count()
    );

    Ok(())
}
