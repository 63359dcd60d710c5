//! `livegrab` CLI - watch or sample a live stream

mod cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use livegrab::Config;

#[derive(Parser)]
#[command(name = "livegrab")]
#[command(about = "Pull decoded frames from live adaptive-bitrate streams")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/livegrab/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a stream, optionally in a preview window
    Play {
        /// Stream URL (HLS manifest, rtmp://, rtsp://, srt://, ...)
        url: String,

        /// Decode without opening a preview window
        #[arg(long)]
        no_preview: bool,

        /// Skip the hardware probe and decode on the CPU
        #[arg(long)]
        force_cpu: bool,

        /// Output width (requires --height)
        #[arg(long, requires = "height")]
        width: Option<u32>,

        /// Output height (requires --width)
        #[arg(long, requires = "width")]
        height: Option<u32>,

        /// Consecutive stalled reads tolerated before giving up
        #[arg(long)]
        max_stalls: Option<u32>,

        /// Per-frame read timeout in milliseconds
        #[arg(long)]
        read_timeout: Option<u64>,

        /// Stop after this many frames
        #[arg(short = 'n', long)]
        frames: Option<u64>,

        /// Restarts from a fresh manifest after a stream failure
        #[arg(long)]
        restarts: Option<u32>,

        /// Preview player binary
        #[arg(long, default_value = "ffplay")]
        player: String,
    },

    /// Show renditions and the decode backend that would be used
    Info {
        /// Stream URL
        url: String,

        /// Skip the hardware probe
        #[arg(long)]
        force_cpu: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("livegrab=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Play {
            url,
            no_preview,
            force_cpu,
            width,
            height,
            max_stalls,
            read_timeout,
            frames,
            restarts,
            player,
        } => {
            let args = cmd::play::PlayArgs {
                no_preview,
                force_cpu,
                size: width.zip(height),
                max_stalls,
                read_timeout_ms: read_timeout,
                frames,
                restarts,
                player,
            };
            cmd::play::cmd_play(&url, &config, args).await?;
        }
        Commands::Info { url, force_cpu } => {
            cmd::info::cmd_info(&url, &config, force_cpu).await?;
        }
    }

    Ok(())
}
