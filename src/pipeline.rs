//! Session setup and restart policy.
//!
//! Wires the stages together: resolve the manifest, pick the best
//! rendition, choose a decode backend, then open a [`FrameSource`] on it.
//! A hardware decoder that refuses to open is retried once in software.
//! A stream failure may restart everything from a fresh manifest.

use std::time::Duration;

use tracing::{info, warn};

use crate::backend::{select_backend, DecodeBackend, FfmpegHwaccelProbe, HardwareProbe};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::manifest::{Ffprobe, Manifest, ManifestResolver, ManifestSource, Rendition};
use crate::playback::{FrameSink, PlaybackLoop, PlaybackReport};
use crate::source::ffmpeg::FfmpegOpener;
use crate::source::{
    DecodeOpener, DecodeTarget, FrameGeometry, FrameSource, PixelFormat, SourceConfig, StopHandle,
};

/// Largest accepted frame width or height.
pub const MAX_DIMENSION: u32 = 16_384;

/// Knobs for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub prefer_hardware: bool,
    /// Output size; the rendition's own size when `None`.
    pub output_size: Option<(u32, u32)>,
    pub pixel_format: PixelFormat,
    pub source: SourceConfig,
    pub probe_timeout: Duration,
    pub max_restarts: u32,
    pub restart_delay: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefer_hardware: true,
            output_size: None,
            pixel_format: config.source.pixel_format,
            source: config.source.source_config(),
            probe_timeout: config.probe.timeout(),
            max_restarts: config.pipeline.max_restarts,
            restart_delay: config.pipeline.restart_delay(),
        }
    }
}

/// An opened stream, ready for [`FrameSource::next_frame`].
pub struct Session<O: DecodeOpener> {
    pub manifest: Manifest,
    pub rendition: Rendition,
    /// Backend actually in use (after any software fallback).
    pub backend: DecodeBackend,
    pub source: FrameSource<O>,
}

/// Resolve → select → open.
pub struct Pipeline<O: DecodeOpener + Clone> {
    resolver: Box<dyn ManifestSource>,
    probe: Box<dyn HardwareProbe>,
    opener: O,
    ffprobe: Option<Ffprobe>,
    options: PipelineOptions,
    stop: StopHandle,
}

impl Pipeline<FfmpegOpener> {
    /// The production pipeline: HTTP/ffprobe manifests, ffmpeg decoding.
    pub fn from_config(config: &Config, options: PipelineOptions) -> Result<Self> {
        let ffprobe = Ffprobe::new(&config.decoder.ffprobe_path(), config.probe.timeout());
        let resolver = ManifestResolver::new(&config.fetch, ffprobe.clone())?;
        let probe = FfmpegHwaccelProbe::new(&config.decoder.ffmpeg_path(), &config.decoder.hwaccel);

        Ok(Self::new(
            Box::new(resolver),
            Box::new(probe),
            FfmpegOpener::new(&config.decoder),
            options,
        )
        .with_ffprobe(ffprobe))
    }
}

impl<O: DecodeOpener + Clone> Pipeline<O> {
    #[must_use]
    pub fn new(
        resolver: Box<dyn ManifestSource>,
        probe: Box<dyn HardwareProbe>,
        opener: O,
        options: PipelineOptions,
    ) -> Self {
        Self {
            resolver,
            probe,
            opener,
            ffprobe: None,
            options,
            stop: StopHandle::new(),
        }
    }

    /// Use ffprobe to size renditions whose manifest omits `RESOLUTION`.
    #[must_use]
    pub fn with_ffprobe(mut self, ffprobe: Ffprobe) -> Self {
        self.ffprobe = Some(ffprobe);
        self
    }

    /// Stops every source this pipeline opens, and any pending restart.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    #[must_use]
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Resolve `url` and pick its best rendition. No decoding happens.
    pub async fn resolve(&self, url: &str) -> Result<Manifest> {
        self.resolver.resolve(url).await
    }

    pub async fn select_backend(&self) -> DecodeBackend {
        select_backend(
            self.options.prefer_hardware,
            self.probe.as_ref(),
            self.options.probe_timeout,
        )
        .await
    }

    /// Resolve, select a backend, and open a source.
    pub async fn start(&self, url: &str) -> Result<Session<O>> {
        let backend = self.select_backend().await;
        self.start_with_backend(url, backend).await
    }

    async fn start_with_backend(&self, url: &str, backend: DecodeBackend) -> Result<Session<O>> {
        let manifest = self.resolver.resolve(url).await?;
        let rendition = manifest.best().clone();
        let geometry = self.output_geometry(&rendition).await?;

        let mut target = DecodeTarget {
            uri: rendition.uri.clone(),
            stream_index: rendition.stream_index,
            backend,
            geometry,
        };

        let source = match self.open_source(target.clone()).await {
            Ok(source) => source,
            Err(e) if backend == DecodeBackend::Hardware => {
                warn!("Hardware decoder failed to open ({e}); retrying in software");
                target.backend = DecodeBackend::Software;
                self.open_source(target.clone()).await?
            }
            Err(e) => return Err(e),
        };

        Ok(Session {
            manifest,
            rendition,
            backend: target.backend,
            source,
        })
    }

    async fn open_source(&self, target: DecodeTarget) -> Result<FrameSource<O>> {
        let mut source = FrameSource::new(self.opener.clone(), target, self.options.source)
            .with_stop_handle(self.stop.clone());
        source.open().await?;
        Ok(source)
    }

    async fn output_geometry(&self, rendition: &Rendition) -> Result<FrameGeometry> {
        let (width, height) = match self.options.output_size {
            Some(size) => size,
            None if rendition.has_dimensions() => (rendition.width, rendition.height),
            None => match &self.ffprobe {
                Some(ffprobe) => ffprobe.dimensions(&rendition.uri).await.map_err(|e| {
                    Error::DecodeOpen(format!("cannot determine frame size: {e}"))
                })?,
                None => {
                    return Err(Error::DecodeOpen(
                        "rendition does not advertise its frame size".to_string(),
                    ))
                }
            },
        };

        if width == 0 || height == 0 {
            return Err(Error::InvalidInput(format!(
                "output size must be non-zero, got {width}x{height}"
            )));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(Error::InvalidInput(format!(
                "output size {width}x{height} exceeds {MAX_DIMENSION} pixels per side"
            )));
        }
        Ok(FrameGeometry::new(width, height, self.options.pixel_format))
    }

    /// Play `url` into `playback`, restarting after stream failures.
    ///
    /// The backend is chosen once. A hardware session that fails before
    /// its first frame is retried in software without using up a restart,
    /// and the fallback sticks. Setup errors are never retried.
    pub async fn run<S: FrameSink>(
        &self,
        url: &str,
        playback: &mut PlaybackLoop<S>,
    ) -> Result<PlaybackReport> {
        let mut backend = self.select_backend().await;
        let mut restarts = 0;

        loop {
            let mut session = self.start_with_backend(url, backend).await?;
            backend = session.backend;
            info!(
                "Streaming {} via {} decode",
                session.rendition, session.backend
            );

            match playback.run(&mut session.source).await {
                Err(e @ Error::Stream { .. })
                    if session.backend == DecodeBackend::Hardware
                        && session.source.stats().frames == 0
                        && !self.stop.is_stopped() =>
                {
                    warn!("Hardware decode failed before the first frame ({e}); retrying in software");
                    backend = DecodeBackend::Software;
                }
                Err(e @ Error::Stream { .. })
                    if restarts < self.options.max_restarts && !self.stop.is_stopped() =>
                {
                    restarts += 1;
                    warn!(
                        "{e}; restarting ({restarts}/{})",
                        self.options.max_restarts
                    );
                    tokio::select! {
                        biased;
                        () = self.stop.stopped() => return Err(e),
                        () = tokio::time::sleep(self.options.restart_delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::StaticProbe;
    use crate::playback::{EndReason, NullSink};
    use crate::source::testing::{ScriptedOpener, Step, GEOMETRY};
    use crate::source::SourceState;

    struct StaticManifest {
        renditions: Vec<Rendition>,
        fetches: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ManifestSource for StaticManifest {
        async fn resolve(&self, input: &str) -> Result<Manifest> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Manifest::new(input, self.renditions.clone())
        }
    }

    fn rendition(width: u32, height: u32) -> Rendition {
        Rendition {
            width,
            height,
            bitrate: u64::from(width) * 1000,
            uri: format!("https://cdn.example.com/{height}p.m3u8"),
            codecs: None,
            stream_index: None,
        }
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            prefer_hardware: true,
            output_size: Some((GEOMETRY.width, GEOMETRY.height)),
            pixel_format: GEOMETRY.pixel_format,
            source: SourceConfig {
                max_consecutive_stalls: 1,
                read_timeout: Duration::from_secs(1),
                stall_backoff: Duration::ZERO,
            },
            probe_timeout: Duration::from_secs(1),
            max_restarts: 0,
            restart_delay: Duration::ZERO,
        }
    }

    fn pipeline(
        renditions: Vec<Rendition>,
        hardware: bool,
        opener: ScriptedOpener,
        options: PipelineOptions,
    ) -> (Pipeline<ScriptedOpener>, Arc<AtomicU32>) {
        let fetches = Arc::new(AtomicU32::new(0));
        let resolver = StaticManifest {
            renditions,
            fetches: fetches.clone(),
        };
        (
            Pipeline::new(Box::new(resolver), Box::new(StaticProbe(hardware)), opener, options),
            fetches,
        )
    }

    fn ladder() -> Vec<Rendition> {
        vec![rendition(640, 360), rendition(1920, 1080), rendition(1280, 720)]
    }

    #[tokio::test]
    async fn test_start_opens_best_rendition() {
        let opener = ScriptedOpener::new(&[Step::Frame]);
        let (pipeline, _) = pipeline(ladder(), true, opener.clone(), options());

        let session = pipeline.start("https://example.com/master.m3u8").await.unwrap();
        assert_eq!(session.rendition.height, 1080);
        assert_eq!(session.source.target().uri, "https://cdn.example.com/1080p.m3u8");
        assert_eq!(session.backend, DecodeBackend::Hardware);
        assert_eq!(session.source.state(), SourceState::Streaming);
        assert_eq!(opener.opens(), 1);
    }

    #[tokio::test]
    async fn test_hardware_open_failure_falls_back_to_software() {
        let opener = ScriptedOpener::new(&[Step::Frame]).failing_on(DecodeBackend::Hardware);
        let (pipeline, _) = pipeline(ladder(), true, opener.clone(), options());

        let mut session = pipeline.start("https://example.com/master.m3u8").await.unwrap();
        assert_eq!(session.backend, DecodeBackend::Software);
        assert_eq!(session.source.target().backend, DecodeBackend::Software);
        assert_eq!(opener.opens(), 2);
        assert!(session.source.next_frame().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_software_open_failure_is_fatal() {
        let opener = ScriptedOpener::new(&[Step::Frame]).failing_on(DecodeBackend::Software);
        let (pipeline, _) = pipeline(ladder(), false, opener.clone(), options());

        let err = pipeline.start("https://example.com/master.m3u8").await.err().unwrap();
        assert!(matches!(err, Error::DecodeOpen(_)));
        assert_eq!(opener.opens(), 1);
    }

    #[tokio::test]
    async fn test_no_hardware_uses_software() {
        let opener = ScriptedOpener::new(&[Step::Frame]);
        let (pipeline, _) = pipeline(ladder(), false, opener, options());

        let session = pipeline.start("https://example.com/master.m3u8").await.unwrap();
        assert_eq!(session.backend, DecodeBackend::Software);
    }

    #[tokio::test]
    async fn test_geometry_from_rendition() {
        let opener = ScriptedOpener::new(&[Step::Frame]);
        let (pipeline, _) = pipeline(
            ladder(),
            false,
            opener,
            PipelineOptions {
                output_size: None,
                ..options()
            },
        );

        let session = pipeline.start("https://example.com/master.m3u8").await.unwrap();
        assert_eq!(session.source.target().geometry.width, 1920);
        assert_eq!(session.source.target().geometry.height, 1080);
    }

    #[tokio::test]
    async fn test_unknown_size_without_ffprobe_is_open_error() {
        let opener = ScriptedOpener::new(&[Step::Frame]);
        let (pipeline, _) = pipeline(
            vec![rendition(0, 0)],
            false,
            opener.clone(),
            PipelineOptions {
                output_size: None,
                ..options()
            },
        );

        let err = pipeline.start("https://example.com/live.m3u8").await.err().unwrap();
        assert!(matches!(err, Error::DecodeOpen(_)));
        assert_eq!(opener.opens(), 0);
    }

    #[tokio::test]
    async fn test_zero_output_size_rejected() {
        let opener = ScriptedOpener::new(&[Step::Frame]);
        let (pipeline, _) = pipeline(
            ladder(),
            false,
            opener,
            PipelineOptions {
                output_size: Some((0, 720)),
                ..options()
            },
        );

        let err = pipeline.start("https://example.com/master.m3u8").await.err().unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_oversized_rendition_rejected() {
        let opener = ScriptedOpener::new(&[Step::Frame]);
        let (pipeline, _) = pipeline(
            vec![rendition(65_535, 65_535)],
            false,
            opener.clone(),
            PipelineOptions {
                output_size: None,
                ..options()
            },
        );

        let err = pipeline.start("https://example.com/master.m3u8").await.err().unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(opener.opens(), 0);

        let (pipeline, _) = pipeline_with_size(Some((MAX_DIMENSION, MAX_DIMENSION + 1)));
        let err = pipeline.start("https://example.com/master.m3u8").await.err().unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    fn pipeline_with_size(size: Option<(u32, u32)>) -> (Pipeline<ScriptedOpener>, Arc<AtomicU32>) {
        pipeline(
            ladder(),
            false,
            ScriptedOpener::new(&[Step::Frame]),
            PipelineOptions {
                output_size: size,
                ..options()
            },
        )
    }

    #[tokio::test]
    async fn test_hardware_failure_before_first_frame_falls_back_to_software() {
        let opener = ScriptedOpener::new(&[Step::Frame, Step::Frame, Step::End])
            .with_hardware_script(&[Step::Fail]);
        let (pipeline, fetches) = pipeline(ladder(), true, opener.clone(), options());

        let mut playback = PlaybackLoop::new(NullSink);
        let report = pipeline
            .run("https://example.com/master.m3u8", &mut playback)
            .await
            .unwrap();
        assert_eq!(report.frames, 2);
        assert_eq!(report.reason, EndReason::SourceEnded);
        assert_eq!(opener.opens(), 2);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hardware_failure_after_frames_uses_restart_policy() {
        let opener = ScriptedOpener::new(&[Step::Frame, Step::End])
            .with_hardware_script(&[Step::Frame, Step::Fail]);
        let (pipeline, _) = pipeline(ladder(), true, opener.clone(), options());

        let mut playback = PlaybackLoop::new(NullSink);
        let err = pipeline
            .run("https://example.com/master.m3u8", &mut playback)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stream { .. }));
        assert_eq!(opener.opens(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_reusable_after_session_close() {
        let opener = ScriptedOpener::new(&[Step::Frame; 3]);
        let (pipeline, _) = pipeline(ladder(), false, opener.clone(), options());

        let mut first = pipeline.start("https://example.com/master.m3u8").await.unwrap();
        assert!(first.source.next_frame().await.unwrap().is_some());
        first.source.close().await;

        let mut second = pipeline.start("https://example.com/master.m3u8").await.unwrap();
        assert_eq!(second.source.next_frame().await.unwrap().unwrap().index(), 0);
        assert_eq!(opener.opens(), 2);

        let mut playback = PlaybackLoop::new(NullSink).with_max_frames(Some(1));
        pipeline
            .run("https://example.com/master.m3u8", &mut playback)
            .await
            .unwrap();
        let mut playback = PlaybackLoop::new(NullSink).with_max_frames(Some(2));
        let report = pipeline
            .run("https://example.com/master.m3u8", &mut playback)
            .await
            .unwrap();
        assert_eq!(report.frames, 2);
    }

    #[tokio::test]
    async fn test_manifest_error_is_not_retried() {
        let opener = ScriptedOpener::new(&[Step::Frame]);
        let (pipeline, fetches) = pipeline(
            Vec::new(),
            false,
            opener.clone(),
            PipelineOptions {
                max_restarts: 3,
                ..options()
            },
        );

        let mut playback = PlaybackLoop::new(NullSink);
        let err = pipeline
            .run("https://example.com/master.m3u8", &mut playback)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRenditionsFound));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(opener.opens(), 0);
    }

    #[tokio::test]
    async fn test_run_until_end() {
        let opener = ScriptedOpener::new(&[Step::Frame, Step::Frame, Step::End]);
        let (pipeline, _) = pipeline(ladder(), true, opener.clone(), options());

        let mut playback = PlaybackLoop::new(NullSink);
        let report = pipeline
            .run("https://example.com/master.m3u8", &mut playback)
            .await
            .unwrap();
        assert_eq!(report.frames, 2);
        assert_eq!(report.reason, EndReason::SourceEnded);
        assert!(opener.closed());
    }

    #[tokio::test]
    async fn test_stream_failure_restarts_from_fresh_manifest() {
        let opener = ScriptedOpener::new(&[Step::Frame, Step::Stall, Step::Stall]);
        let (pipeline, fetches) = pipeline(
            ladder(),
            true,
            opener.clone(),
            PipelineOptions {
                max_restarts: 2,
                ..options()
            },
        );

        let mut playback = PlaybackLoop::new(NullSink);
        let err = pipeline
            .run("https://example.com/master.m3u8", &mut playback)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stream { stalls: 2, .. }));
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
        assert_eq!(opener.opens(), 3);
        assert_eq!(playback.frames(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_restart() {
        let opener = ScriptedOpener::new(&[Step::Frame, Step::Stall, Step::Stall]);
        let (pipeline, fetches) = pipeline(
            ladder(),
            false,
            opener,
            PipelineOptions {
                max_restarts: 5,
                restart_delay: Duration::from_secs(60),
                ..options()
            },
        );

        let stop = pipeline.stop_handle();
        let mut playback = PlaybackLoop::new(NullSink);
        let run = pipeline.run("https://example.com/master.m3u8", &mut playback);
        let stopper = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop.stop();
        };
        let started = tokio::time::Instant::now();
        let (result, ()) = tokio::join!(run, stopper);

        assert!(matches!(result, Err(Error::Stream { .. })));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_stop_before_start_yields_no_frames() {
        let opener = ScriptedOpener::new(&[Step::Frame; 5]);
        let (pipeline, _) = pipeline(ladder(), false, opener.clone(), options());

        pipeline.stop_handle().stop();
        let mut playback = PlaybackLoop::new(NullSink);
        let report = pipeline
            .run("https://example.com/master.m3u8", &mut playback)
            .await
            .unwrap();
        assert_eq!(report.frames, 0);
        assert_eq!(opener.opens(), 0);
    }
}
