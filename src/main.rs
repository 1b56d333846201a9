mod commands;
mod config;
mod logging;

use anyhow::{Context, Result};
use audiohal_engine::AudioHal;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "audiohal", version)]
#[command(about = "Inspect and control CoreAudio devices and their properties")]
struct Args {
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Use a built-in simulated HAL with two demo devices
    #[arg(long, global = true)]
    simulated: bool,

    /// TOML configuration file (defaults to $AUDIOHAL_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter such as `debug` or `audiohal_engine=trace`.
    /// RUST_LOG takes precedence.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List audio devices with their streams
    Devices,
    /// Print the number of audio devices
    Count,
    /// Show the default output and input devices
    Current,
    /// Probe which well-known properties a device has and which are settable
    Describe { device: u32 },
    /// Read one property
    Get {
        device: u32,
        /// Selector name (`volume`), four-char code (`volm`) or number
        selector: String,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long, default_value_t = 0)]
        element: u32,
    },
    /// Write one property
    Set {
        device: u32,
        selector: String,
        value: String,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long, default_value_t = 0)]
        element: u32,
    },
    /// List the output channels that have a volume control
    Channels {
        /// Device ID; the default output device when omitted
        #[arg(long)]
        device: Option<u32>,
    },
    /// Show or set the output volume in percent
    Volume {
        percent: Option<u32>,
        #[arg(long)]
        device: Option<u32>,
    },
    /// Show or change the output mute state
    Mute {
        state: Option<Toggle>,
        #[arg(long)]
        device: Option<u32>,
    },
    /// Print property changes until Ctrl+C
    Watch {
        /// Selectors to follow; a useful default set when empty
        selectors: Vec<String>,
        #[arg(long)]
        device: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = config::Settings::load(args.config.as_deref())?;
    logging::init(args.log_level.as_deref().or(settings.log_level.as_deref()));

    let hal = if args.simulated || settings.simulated {
        AudioHal::simulated(settings.engine)
    } else {
        AudioHal::system_with(settings.engine).context("opening the audio HAL")?
    };
    let hal = Arc::new(hal);
    let out = commands::Output {
        json: args.json || settings.json,
    };

    let result = commands::run(&hal, &args.command, out).await;
    hal.shutdown();
    result
}
