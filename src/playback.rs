//! Playback loop: drains a [`FrameSource`] into a [`FrameSink`].
//!
//! The loop pulls one frame at a time, so a slow sink slows decoding
//! instead of queueing frames. Throughput is logged once per second.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::source::{DecodeOpener, Frame, FrameGeometry, FrameSource, SourceStats};

/// Whether the loop should keep pulling frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Where decoded frames go.
#[async_trait]
pub trait FrameSink: Send {
    /// Take ownership of one frame. [`Flow::Stop`] ends playback.
    async fn on_frame(&mut self, frame: Frame) -> Flow;

    /// Called once when playback ends for any reason.
    async fn finish(&mut self) {}
}

/// Discards frames (headless mode).
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl FrameSink for NullSink {
    async fn on_frame(&mut self, _frame: Frame) -> Flow {
        Flow::Continue
    }
}

/// Forwards frames to a bounded channel.
///
/// A full channel blocks the loop. A dropped receiver stops playback.
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn on_frame(&mut self, frame: Frame) -> Flow {
        match self.tx.send(frame).await {
            Ok(()) => Flow::Continue,
            Err(_) => {
                info!("Frame consumer went away");
                Flow::Stop
            }
        }
    }
}

/// Shows frames in an `ffplay` window fed over stdin.
///
/// The player is started on the first frame, and restarted if the frame
/// size changes. Closing the window stops playback.
pub struct FfplayPreview {
    player_path: String,
    player: Option<(Child, ChildStdin)>,
    geometry: Option<FrameGeometry>,
}

impl FfplayPreview {
    #[must_use]
    pub fn new(player_path: &str) -> Self {
        Self {
            player_path: player_path.to_string(),
            player: None,
            geometry: None,
        }
    }

    fn player_args(geometry: FrameGeometry) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-window_title".to_string(),
            "livegrab".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pixel_format".to_string(),
            geometry.pixel_format.ffmpeg_name().to_string(),
            "-video_size".to_string(),
            format!("{}x{}", geometry.width, geometry.height),
            "-i".to_string(),
            "-".to_string(),
        ]
    }

    fn spawn(&mut self, geometry: FrameGeometry) -> std::io::Result<()> {
        let mut child = Command::new(&self.player_path)
            .args(Self::player_args(geometry))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("player stdin unavailable"))?;

        info!(
            "Preview window open ({}x{})",
            geometry.width, geometry.height
        );
        self.player = Some((child, stdin));
        self.geometry = Some(geometry);
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some((mut child, stdin)) = self.player.take() {
            drop(stdin);
            if tokio::time::timeout(Duration::from_secs(1), child.wait())
                .await
                .is_err()
            {
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill {}: {e}", self.player_path);
                }
            }
        }
    }
}

#[async_trait]
impl FrameSink for FfplayPreview {
    async fn on_frame(&mut self, frame: Frame) -> Flow {
        if self.geometry != Some(frame.geometry()) {
            self.shutdown().await;
            if let Err(e) = self.spawn(frame.geometry()) {
                warn!("Failed to start {}: {e}", self.player_path);
                return Flow::Stop;
            }
        }

        let Some((_, stdin)) = self.player.as_mut() else {
            return Flow::Stop;
        };
        match stdin.write_all(frame.data()).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                info!("Preview closed ({e})");
                self.player = None;
                Flow::Stop
            }
        }
    }

    async fn finish(&mut self) {
        self.shutdown().await;
    }
}

/// Frames-per-second counter reporting once per elapsed window.
#[derive(Debug)]
pub struct FpsMeter {
    window: Duration,
    started: Instant,
    count: u64,
}

impl FpsMeter {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: Instant::now(),
            count: 0,
        }
    }

    /// Count a frame. Returns the rate when a window has elapsed.
    pub fn tick(&mut self) -> Option<f64> {
        self.count += 1;
        let elapsed = self.started.elapsed();
        if elapsed < self.window {
            return None;
        }

        #[allow(clippy::cast_precision_loss)]
        let fps = self.count as f64 / elapsed.as_secs_f64();
        self.started = Instant::now();
        self.count = 0;
        Some(fps)
    }
}

/// Why playback ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Upstream finished, or the source was stopped.
    SourceEnded,
    /// The sink asked to stop.
    SinkStopped,
    /// The configured frame count was reached.
    FrameLimit,
}

/// Summary of one playback run.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackReport {
    pub frames: u64,
    pub reason: EndReason,
    pub stats: SourceStats,
}

/// Pulls frames and hands them to a sink.
pub struct PlaybackLoop<S: FrameSink> {
    sink: S,
    max_frames: Option<u64>,
    fps_window: Duration,
    frames: u64,
}

impl<S: FrameSink> PlaybackLoop<S> {
    #[must_use]
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            max_frames: None,
            fps_window: Duration::from_secs(1),
            frames: 0,
        }
    }

    /// Stop after this many frames in total, across restarts.
    #[must_use]
    pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Frames handed to the sink so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Drain `source` until it ends, fails, or the sink or frame limit
    /// says stop. The source is closed on every exit path.
    pub async fn run<O: DecodeOpener>(&mut self, source: &mut FrameSource<O>) -> Result<PlaybackReport> {
        let mut fps = FpsMeter::new(self.fps_window);

        let result = loop {
            if self.max_frames.is_some_and(|max| self.frames >= max) {
                info!("Reached frame limit ({})", self.frames);
                break Ok(EndReason::FrameLimit);
            }

            let frame = match source.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(EndReason::SourceEnded),
                Err(e) => break Err(e),
            };

            self.frames += 1;
            if let Some(rate) = fps.tick() {
                info!("{rate:.1} frames/sec");
            }

            if self.sink.on_frame(frame).await == Flow::Stop {
                break Ok(EndReason::SinkStopped);
            }
        };

        if matches!(result, Ok(EndReason::FrameLimit | EndReason::SinkStopped)) {
            source.close().await;
        }
        self.sink.finish().await;

        let reason = result?;
        debug!("Playback ended: {reason:?}");
        Ok(PlaybackReport {
            frames: self.frames,
            reason,
            stats: source.stats(),
        })
    }
}
