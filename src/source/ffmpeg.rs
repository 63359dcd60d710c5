//! ffmpeg subprocess decoder
//!
//! Decodes the rendition with an ffmpeg child process that writes packed
//! raw video to stdout. Every frame is exactly `width × height × bpp`
//! bytes, so framing is a fixed-size read.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DecodeHandle, DecodeOpener, DecodeTarget, FrameGeometry, ReadOutcome};
use crate::backend::DecodeBackend;
use crate::config::DecoderSettings;
use crate::error::{Error, Result};

/// stderr lines kept for error reports.
const STDERR_TAIL: usize = 8;

/// How long to wait for ffmpeg to exit once its output has ended.
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// Spawns ffmpeg decode sessions.
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    ffmpeg_path: String,
    hwaccel: String,
    log_level: String,
    open_grace: Duration,
}

impl FfmpegOpener {
    #[must_use]
    pub fn new(settings: &DecoderSettings) -> Self {
        Self {
            ffmpeg_path: settings.ffmpeg_path(),
            hwaccel: settings.hwaccel.clone(),
            log_level: settings.log_level.clone(),
            open_grace: settings.open_grace(),
        }
    }

    /// Specify custom ffmpeg binary path
    #[must_use]
    pub fn with_ffmpeg_path(mut self, path: &str) -> Self {
        self.ffmpeg_path = path.to_string();
        self
    }

    /// Build ffmpeg command arguments
    fn build_args(&self, target: &DecodeTarget) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", self.log_level.as_str()]
            .iter()
            .map(std::string::ToString::to_string)
            .collect();

        // Reconnection for network inputs
        if target.uri.starts_with("http://") || target.uri.starts_with("https://") {
            args.extend(
                [
                    "-reconnect", "1",
                    "-reconnect_streamed", "1",
                    "-reconnect_delay_max", "2",
                ]
                .iter()
                .map(std::string::ToString::to_string),
            );
        }

        args.extend(["-fflags", "+genpts"].iter().map(std::string::ToString::to_string));

        if target.backend == DecodeBackend::Hardware {
            args.push("-hwaccel".to_string());
            args.push(self.hwaccel.clone());
        }

        args.push("-i".to_string());
        args.push(target.uri.clone());

        args.push("-map".to_string());
        args.push(match target.stream_index {
            Some(idx) => format!("0:{idx}"),
            None => "0:v:0".to_string(),
        });

        let geometry = target.geometry;
        args.extend(
            [
                "-an".to_string(),
                "-sn".to_string(),
                "-vf".to_string(),
                format!("scale={}:{}", geometry.width, geometry.height),
                "-f".to_string(),
                "rawvideo".to_string(),
                "-pix_fmt".to_string(),
                geometry.pixel_format.ffmpeg_name().to_string(),
                "pipe:1".to_string(),
            ],
        );

        args
    }
}

#[async_trait]
impl DecodeOpener for FfmpegOpener {
    type Handle = FfmpegHandle;

    async fn open(&self, target: &DecodeTarget) -> Result<FfmpegHandle> {
        if target.geometry.frame_size() == 0 {
            return Err(Error::DecodeOpen(format!(
                "output size {}x{} is empty",
                target.geometry.width, target.geometry.height
            )));
        }

        let args = self.build_args(target);
        debug!("ffmpeg args: {:?}", args);

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::DecodeOpen(format!("failed to spawn {}: {e}", self.ffmpeg_path)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::DecodeOpen("failed to capture ffmpeg stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::DecodeOpen("failed to capture ffmpeg stderr".to_string()))?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
        let stderr_task = tokio::spawn(forward_stderr(stderr, tail.clone()));

        // An ffmpeg that cannot open the input or init the hwaccel exits almost at once.
        if let Ok(status) = tokio::time::timeout(self.open_grace, child.wait()).await {
            let status = status.map_err(|e| Error::DecodeOpen(e.to_string()))?;
            if !status.success() {
                stderr_task.abort();
                return Err(Error::DecodeOpen(format!(
                    "ffmpeg exited with {status}: {}",
                    join_tail(&tail)
                )));
            }
        }

        info!(
            "ffmpeg decoding {} ({} backend, pid {:?})",
            target.uri,
            target.backend,
            child.id()
        );

        Ok(FfmpegHandle {
            child,
            reader: RawVideoReader::new(stdout, target.geometry.frame_size()),
            geometry: target.geometry,
            stderr_task,
            tail,
        })
    }
}

fn join_tail(tail: &Mutex<VecDeque<String>>) -> String {
    tail.lock()
        .map(|t| t.iter().cloned().collect::<Vec<_>>().join("; "))
        .unwrap_or_default()
}

/// Log ffmpeg stderr and keep its last few lines.
async fn forward_stderr(
    stderr: tokio::process::ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let lower = line.to_lowercase();
        if lower.contains("error") || lower.contains("failed") {
            warn!("ffmpeg: {}", line);
        } else {
            debug!("ffmpeg: {}", line);
        }

        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

/// A running ffmpeg decode session.
pub struct FfmpegHandle {
    child: Child,
    reader: RawVideoReader<ChildStdout>,
    geometry: FrameGeometry,
    stderr_task: JoinHandle<()>,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl FfmpegHandle {
    /// Classify the end of ffmpeg's output by its exit status.
    async fn exit_outcome(&mut self) -> ReadOutcome {
        match tokio::time::timeout(EXIT_WAIT, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => ReadOutcome::End,
            Ok(Ok(status)) => {
                // Let the stderr task drain the last lines.
                let _ = tokio::time::timeout(Duration::from_millis(200), &mut self.stderr_task).await;
                ReadOutcome::Failed(format!(
                    "ffmpeg exited with {status}: {}",
                    join_tail(&self.tail)
                ))
            }
            Ok(Err(e)) => ReadOutcome::Failed(format!("failed to reap ffmpeg: {e}")),
            Err(_) => ReadOutcome::Stall("ffmpeg closed its output but is still running".to_string()),
        }
    }
}

#[async_trait]
impl DecodeHandle for FfmpegHandle {
    fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    async fn read_frame(&mut self) -> ReadOutcome {
        match self.reader.read_frame().await {
            ReadOutcome::End => self.exit_outcome().await,
            outcome => outcome,
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("ffmpeg already exited: {e}");
        }
        match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(Ok(status)) => debug!("ffmpeg exited with {status}"),
            Ok(Err(e)) => warn!("Failed to reap ffmpeg: {e}"),
            Err(_) => warn!("ffmpeg did not exit after kill"),
        }
        self.stderr_task.abort();
    }
}

impl Drop for FfmpegHandle {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
        self.stderr_task.abort();
    }
}

/// Splits a byte stream into fixed-size frames.
///
/// Cancel safe: bytes of a partially read frame stay buffered, so an
/// abandoned read resumes where it left off.
pub struct RawVideoReader<R> {
    reader: R,
    buf: BytesMut,
    frame_size: usize,
    filled: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> RawVideoReader<R> {
    pub fn new(reader: R, frame_size: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::zeroed(frame_size),
            frame_size,
            filled: 0,
            eof: false,
        }
    }

    /// Read one frame.
    ///
    /// EOF on a frame boundary ends the stream; EOF inside a frame drops
    /// the partial frame as a stall and the following read ends the stream.
    pub async fn read_frame(&mut self) -> ReadOutcome {
        if self.eof {
            return ReadOutcome::End;
        }

        while self.filled < self.frame_size {
            match self.reader.read(&mut self.buf[self.filled..]).await {
                Ok(0) => {
                    self.eof = true;
                    if self.filled == 0 {
                        return ReadOutcome::End;
                    }
                    let partial = std::mem::take(&mut self.filled);
                    return ReadOutcome::Stall(format!(
                        "truncated frame: {partial} of {} bytes",
                        self.frame_size
                    ));
                }
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return ReadOutcome::Stall(format!("read failed: {e}")),
            }
        }

        self.filled = 0;
        let frame = self.buf.split_to(self.frame_size).freeze();
        self.buf.resize(self.frame_size, 0);
        ReadOutcome::Frame(frame)
    }
}
