//! Show or initialize the configuration file.

use castcap_common::config::{config_file_path, AppConfig};

pub fn run(config: &AppConfig, init: bool, json: bool) -> anyhow::Result<()> {
    if init {
        let path = AppConfig::default()
            .save()
            .map_err(|e| anyhow::anyhow!("Failed to write config: {e}"))?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    let path = config_file_path();
    println!(
        "Config file: {} ({})",
        path.display(),
        if path.exists() { "found" } else { "not found, using defaults" }
    );
    println!();
    println!("Capture:");
    println!(
        "  Max size: {}x{}",
        config.capture.max_width, config.capture.max_height
    );
    println!("  Max FPS: {}", config.capture.max_fps);
    println!();
    println!("Logging:");
    println!("  Level: {}", config.logging.level);
    println!("  JSON: {}", config.logging.json);

    Ok(())
}
