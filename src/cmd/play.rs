use anyhow::Result;
use tracing::info;

use livegrab::{
    Config, FfplayPreview, FrameSink, NullSink, Pipeline, PipelineOptions, PlaybackLoop,
};

/// Command-line overrides for `play`.
pub struct PlayArgs {
    pub no_preview: bool,
    pub force_cpu: bool,
    pub size: Option<(u32, u32)>,
    pub max_stalls: Option<u32>,
    pub read_timeout_ms: Option<u64>,
    pub frames: Option<u64>,
    pub restarts: Option<u32>,
    pub player: String,
}

impl PlayArgs {
    fn options(&self, config: &Config) -> PipelineOptions {
        let mut options = PipelineOptions::from_config(config);
        options.prefer_hardware = !self.force_cpu;
        options.output_size = self.size;
        if let Some(max) = self.max_stalls {
            options.source.max_consecutive_stalls = max;
        }
        if let Some(ms) = self.read_timeout_ms {
            options.source.read_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(restarts) = self.restarts {
            options.max_restarts = restarts;
        }
        options
    }
}

pub async fn cmd_play(url: &str, config: &Config, args: PlayArgs) -> Result<()> {
    let pipeline = Pipeline::from_config(config, args.options(config))?;

    let stop = pipeline.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            stop.stop();
        }
    });

    if args.no_preview {
        play_into(&pipeline, url, NullSink, args.frames).await
    } else {
        play_into(&pipeline, url, FfplayPreview::new(&args.player), args.frames).await
    }
}

async fn play_into<S: FrameSink>(
    pipeline: &Pipeline<livegrab::source::ffmpeg::FfmpegOpener>,
    url: &str,
    sink: S,
    frames: Option<u64>,
) -> Result<()> {
    let mut playback = PlaybackLoop::new(sink).with_max_frames(frames);
    let report = pipeline.run(url, &mut playback).await?;

    println!(
        "✅ {} frames ({} stalls, longest run {})",
        report.frames, report.stats.stalls_total, report.stats.max_stall_run
    );
    Ok(())
}
