//! Castcap CLI: command-line interface for the capture-and-convert core.
//!
//! Usage:
//!   castcap scale <WxH> [--max WxH]   Show negotiated capture dimensions
//!   castcap simulate [OPTIONS]        Run a capture session on the software backend
//!   castcap convert [OPTIONS]         Convert a test frame on the GPU (feature `wgpu`)
//!   castcap config [--init]           Show or write the configuration file

use castcap_platform_core::Dimensions;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "castcap",
    about = "Screen capture to planar YUV with GPU color conversion",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show source, scaled luma and chroma sizes for a display
    Scale {
        /// Source size, e.g. 2400x1080
        source: Dimensions,

        /// Maximum capture size (defaults to the configured limit)
        #[arg(long)]
        max: Option<Dimensions>,
    },

    /// Run a capture session against a synthetic display
    Simulate {
        /// Synthetic display size
        #[arg(long, default_value = "1280x720")]
        source: Dimensions,

        /// Maximum capture size (defaults to the configured limit)
        #[arg(long)]
        max: Option<Dimensions>,

        /// Maximum emitted frame rate (defaults to the configured limit)
        #[arg(long)]
        fps: Option<u32>,

        /// Rate at which the display produces new images
        #[arg(long, default_value = "60")]
        source_fps: u32,

        /// Session length in seconds
        #[arg(long, default_value = "2.0")]
        duration_secs: f64,

        /// Change the display size halfway through
        #[arg(long)]
        resize_to: Option<Dimensions>,

        /// Deny the capture permission request
        #[arg(long)]
        deny: bool,

        /// Also push frames into `appsrc ! <PIPELINE>`
        #[cfg(feature = "gst")]
        #[arg(long)]
        pipeline: Option<String>,
    },

    /// Convert a test pattern on a GPU adapter and compare with the software backend
    #[cfg(feature = "wgpu")]
    Convert {
        /// Test pattern size
        #[arg(long, default_value = "1280x720")]
        source: Dimensions,

        /// Maximum capture size (defaults to the configured limit)
        #[arg(long)]
        max: Option<Dimensions>,

        /// Sample the image bottom-up
        #[arg(long)]
        flip: bool,

        /// Write the converted frame as raw I420
        #[arg(long)]
        output: Option<std::path::PathBuf>,
    },

    /// Show the effective configuration
    Config {
        /// Write the defaults to the config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = castcap_common::config::AppConfig::load();

    // Initialize logging
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    castcap_common::logging::init_logging(&logging);

    match cli.command {
        Commands::Scale { source, max } => {
            let max = max.unwrap_or(Dimensions::new(
                config.capture.max_width,
                config.capture.max_height,
            ));
            commands::scale::run(source, max, cli.json)
        }
        Commands::Simulate {
            source,
            max,
            fps,
            source_fps,
            duration_secs,
            resize_to,
            deny,
            #[cfg(feature = "gst")]
            pipeline,
        } => {
            let options = commands::simulate::SimulateOptions {
                source,
                max: max.unwrap_or(Dimensions::new(
                    config.capture.max_width,
                    config.capture.max_height,
                )),
                max_fps: fps.unwrap_or(config.capture.max_fps),
                source_fps,
                duration_secs,
                resize_to,
                deny,
                #[cfg(feature = "gst")]
                pipeline,
            };
            commands::simulate::run(options, cli.json).await
        }
        #[cfg(feature = "wgpu")]
        Commands::Convert {
            source,
            max,
            flip,
            output,
        } => {
            let options = commands::convert::ConvertOptions {
                source,
                max: max.unwrap_or(Dimensions::new(
                    config.capture.max_width,
                    config.capture.max_height,
                )),
                flip,
                output,
            };
            // The converter drives its own runtime for wgpu's futures.
            let json = cli.json;
            tokio::task::spawn_blocking(move || commands::convert::run(options, json)).await?
        }
        Commands::Config { init } => commands::config::run(&config, init, cli.json),
    }
}
