//! `livegrab` - frame acquisition from live adaptive-bitrate streams
//!
//! # Pipeline
//!
//! - **Manifest**: fetch an HLS playlist (or probe an RTMP/RTSP/SRT URL) and
//!   pick the highest-resolution rendition
//! - **Backend**: use hardware decode when a runtime probe says it works,
//!   software otherwise
//! - **Source**: pull decoded frames one at a time, absorbing transient
//!   stalls up to a bound
//! - **Playback**: hand frames to a preview window, a channel, or nowhere
//!
//! # Example
//!
//! ```rust,no_run
//! use livegrab::{Config, NullSink, Pipeline, PipelineOptions, PlaybackLoop};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pipeline = Pipeline::from_config(&config, PipelineOptions::from_config(&config))?;
//!     let mut playback = PlaybackLoop::new(NullSink).with_max_frames(Some(100));
//!     let report = pipeline.run("https://example.com/live/master.m3u8", &mut playback).await?;
//!     println!("Decoded {} frames", report.frames);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod playback;
pub mod source;

pub use backend::{select_backend, DecodeBackend, FfmpegHwaccelProbe, HardwareProbe};
pub use config::Config;
pub use error::{Error, Result};
pub use manifest::{Manifest, ManifestResolver, ManifestSource, Rendition};
pub use pipeline::{Pipeline, PipelineOptions, Session};
pub use playback::{ChannelSink, FfplayPreview, FrameSink, NullSink, PlaybackLoop, PlaybackReport};
pub use source::{Frame, FrameGeometry, FrameSource, PixelFormat, SourceConfig, StopHandle};

/// Version of livegrab
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
