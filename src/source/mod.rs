//! Resilient frame acquisition.
//!
//! A [`FrameSource`] owns one decode session and hands out frames on
//! demand. Reads are pulled by the consumer one at a time; nothing is read
//! ahead. A failed or late read is a *stall*: it is retried quietly, and
//! only a run of more than `max_consecutive_stalls` stalls ends the stream
//! with [`Error::Stream`].
//!
//! ```text
//! Unopened -> Opening -> Streaming <-> Stalled -> Closed | Failed
//! ```

pub mod ffmpeg;
mod frame;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::DecodeBackend;
use crate::error::{Error, Result};

pub use frame::{Frame, FrameGeometry, PixelFormat};

/// Result of one read against a decode handle.
#[derive(Debug)]
pub enum ReadOutcome {
    /// One complete frame of packed pixels.
    Frame(Bytes),
    /// Transient failure; the read may be retried.
    Stall(String),
    /// Upstream finished cleanly.
    End,
    /// The decoder died; the stream cannot continue.
    Failed(String),
}

/// An open decode session.
#[async_trait]
pub trait DecodeHandle: Send {
    /// Layout of the frames this handle produces.
    fn geometry(&self) -> FrameGeometry;

    /// Read the next frame.
    ///
    /// Must be cancel safe: dropping the future part-way through a frame
    /// may not lose bytes already read, so the next call resumes the same
    /// frame.
    async fn read_frame(&mut self) -> ReadOutcome;

    /// Release the session. Called at most once.
    async fn close(&mut self);
}

/// What to open: one rendition URI with one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeTarget {
    pub uri: String,
    /// Container stream to decode, when the URI carries several.
    pub stream_index: Option<u32>,
    pub backend: DecodeBackend,
    /// Output geometry; the decoder scales to it.
    pub geometry: FrameGeometry,
}

/// Opens decode sessions.
#[async_trait]
pub trait DecodeOpener: Send + Sync {
    type Handle: DecodeHandle + 'static;

    async fn open(&self, target: &DecodeTarget) -> Result<Self::Handle>;
}

/// Stall handling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceConfig {
    /// Stalls in a row tolerated; one more fails the stream.
    pub max_consecutive_stalls: u32,
    /// Upper bound on a single read.
    pub read_timeout: Duration,
    /// Pause before retrying after a stall.
    pub stall_backoff: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_consecutive_stalls: 5,
            read_timeout: Duration::from_secs(5),
            stall_backoff: Duration::from_millis(200),
        }
    }
}

/// Lifecycle of a [`FrameSource`]. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Unopened,
    Opening,
    Streaming,
    Stalled,
    Closed,
    Failed,
}

impl SourceState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames: u64,
    pub stalls_total: u64,
    /// Longest run of consecutive stalls seen.
    pub max_stall_run: u32,
}

/// Requests a [`FrameSource`] to stop. Cheap to clone, usable from any task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        stop_requested(&mut self.subscribe()).await;
    }
}

/// Resolves once a stop has been requested.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stopped| *stopped).await.is_err() {
        // Sender gone: nobody can stop us any more.
        futures::future::pending::<()>().await;
    }
}

/// Pull-based, forward-only frame sequence over one decode session.
pub struct FrameSource<O: DecodeOpener> {
    opener: O,
    target: DecodeTarget,
    config: SourceConfig,
    state: SourceState,
    handle: Option<O::Handle>,
    geometry: FrameGeometry,
    next_index: u64,
    consecutive_stalls: u32,
    stats: SourceStats,
    stop: StopHandle,
    stop_rx: watch::Receiver<bool>,
}

impl<O: DecodeOpener> FrameSource<O> {
    #[must_use]
    pub fn new(opener: O, target: DecodeTarget, config: SourceConfig) -> Self {
        let stop = StopHandle::new();
        let stop_rx = stop.subscribe();
        Self {
            opener,
            geometry: target.geometry,
            target,
            config,
            state: SourceState::Unopened,
            handle: None,
            next_index: 0,
            consecutive_stalls: 0,
            stats: SourceStats::default(),
            stop,
            stop_rx,
        }
    }

    /// Share an existing stop handle, e.g. one stop signal across restarts.
    #[must_use]
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop_rx = stop.subscribe();
        self.stop = stop;
        self
    }

    #[must_use]
    pub fn state(&self) -> SourceState {
        self.state
    }

    #[must_use]
    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    #[must_use]
    pub fn target(&self) -> &DecodeTarget {
        &self.target
    }

    /// Geometry of yielded frames (as reported by the handle once open).
    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// `true` once no decode handle is held.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Open the decode session.
    ///
    /// Optional: [`next_frame`](Self::next_frame) opens lazily. Calling it
    /// up front surfaces [`Error::DecodeOpen`] before any frame is pulled.
    pub async fn open(&mut self) -> Result<()> {
        match self.state {
            SourceState::Unopened | SourceState::Opening => {}
            SourceState::Streaming | SourceState::Stalled => return Ok(()),
            SourceState::Closed | SourceState::Failed => {
                return Err(Error::DecodeOpen(
                    "source already finished and cannot be reopened".to_string(),
                ))
            }
        }

        if self.stop.is_stopped() {
            self.finish(SourceState::Closed).await;
            return Ok(());
        }

        self.state = SourceState::Opening;
        info!(
            "Opening {} decoder for {} ({}x{})",
            self.target.backend, self.target.uri, self.geometry.width, self.geometry.height
        );

        let opened = tokio::select! {
            biased;
            () = stop_requested(&mut self.stop_rx) => None,
            result = self.opener.open(&self.target) => Some(result),
        };

        match opened {
            None => {
                self.finish(SourceState::Closed).await;
                Ok(())
            }
            Some(Ok(handle)) => {
                self.geometry = handle.geometry();
                self.handle = Some(handle);
                self.state = SourceState::Streaming;
                Ok(())
            }
            Some(Err(e)) => {
                warn!("Decoder open failed: {e}");
                self.state = SourceState::Failed;
                Err(match e {
                    e @ Error::DecodeOpen(_) => e,
                    other => Error::DecodeOpen(other.to_string()),
                })
            }
        }
    }

    /// Pull the next frame.
    ///
    /// `Ok(None)` means the sequence is over (upstream ended, or stopped).
    /// A stream failure is returned once; later calls return `Ok(None)`.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if matches!(self.state, SourceState::Unopened | SourceState::Opening) {
            self.open().await?;
        }

        loop {
            if self.state.is_terminal() {
                return Ok(None);
            }
            if self.stop.is_stopped() {
                self.finish(SourceState::Closed).await;
                return Ok(None);
            }
            let Some(handle) = self.handle.as_mut() else {
                self.state = SourceState::Closed;
                return Ok(None);
            };

            let read_timeout = self.config.read_timeout;
            let read = tokio::time::timeout(read_timeout, handle.read_frame());
            let outcome = tokio::select! {
                biased;
                () = stop_requested(&mut self.stop_rx) => None,
                result = read => Some(result),
            };

            let outcome = match outcome {
                None => {
                    info!("Stop requested, closing decoder");
                    self.finish(SourceState::Closed).await;
                    return Ok(None);
                }
                Some(Err(_)) => ReadOutcome::Stall(format!("no frame within {read_timeout:?}")),
                Some(Ok(outcome)) => outcome,
            };

            match outcome {
                ReadOutcome::Frame(data) if data.len() == self.geometry.frame_size() => {
                    return Ok(Some(self.accept(data)));
                }
                ReadOutcome::Frame(data) => {
                    let reason = format!(
                        "decoder returned {} bytes, expected {}",
                        data.len(),
                        self.geometry.frame_size()
                    );
                    self.stall(reason).await?;
                }
                ReadOutcome::Stall(reason) => self.stall(reason).await?,
                ReadOutcome::Failed(reason) => {
                    warn!("Decoder failed: {reason}");
                    self.finish(SourceState::Failed).await;
                    return Err(Error::Stream {
                        stalls: self.consecutive_stalls,
                        reason,
                    });
                }
                ReadOutcome::End => {
                    info!("Stream ended after {} frames", self.stats.frames);
                    self.finish(SourceState::Closed).await;
                    return Ok(None);
                }
            }
        }
    }

    /// Release the decode handle now.
    ///
    /// Only this source is closed; a stop handle shared with other sources
    /// is left untouched.
    pub async fn close(&mut self) {
        if !self.state.is_terminal() {
            self.finish(SourceState::Closed).await;
        }
    }

    /// Adapt into a [`Stream`] of frames. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame>>
    where
        O: 'static,
    {
        futures::stream::unfold(self, |mut source| async move {
            match source.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), source)),
                Ok(None) => None,
                Err(e) => Some((Err(e), source)),
            }
        })
    }

    fn accept(&mut self, data: Bytes) -> Frame {
        if self.state == SourceState::Stalled {
            info!("Recovered after {} stalled reads", self.consecutive_stalls);
        }
        self.state = SourceState::Streaming;
        self.consecutive_stalls = 0;
        self.stats.frames += 1;

        let frame = Frame::new(self.next_index, self.geometry, data);
        self.next_index += 1;
        debug!("Frame {}", frame.index());
        frame
    }

    /// Record a stall; escalates once the run exceeds the bound.
    async fn stall(&mut self, reason: String) -> Result<()> {
        self.consecutive_stalls += 1;
        self.stats.stalls_total += 1;
        self.stats.max_stall_run = self.stats.max_stall_run.max(self.consecutive_stalls);

        if self.consecutive_stalls > self.config.max_consecutive_stalls {
            warn!(
                "Giving up after {} consecutive stalls: {reason}",
                self.consecutive_stalls
            );
            self.finish(SourceState::Failed).await;
            return Err(Error::Stream {
                stalls: self.consecutive_stalls,
                reason,
            });
        }

        self.state = SourceState::Stalled;
        warn!(
            "Stall {}/{}: {reason}",
            self.consecutive_stalls, self.config.max_consecutive_stalls
        );

        if !self.config.stall_backoff.is_zero() {
            tokio::select! {
                biased;
                () = stop_requested(&mut self.stop_rx) => {}
                () = tokio::time::sleep(self.config.stall_backoff) => {}
            }
        }
        Ok(())
    }

    async fn finish(&mut self, state: SourceState) {
        if let Some(mut handle) = self.handle.take() {
            handle.close().await;
            debug!("Decoder released");
        }
        self.state = state;
    }
}
