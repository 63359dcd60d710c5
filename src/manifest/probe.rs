//! Container probing via ffprobe
//!
//! Used for inputs that are not HTTP playlists (RTMP, RTSP, SRT, ...),
//! where the "manifest" is the list of video streams inside the container,
//! and to discover the dimensions of a rendition that does not advertise them.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::Rendition;
use crate::error::{Error, Result};

/// Runs `ffprobe` against a stream URI.
#[derive(Debug, Clone)]
pub struct Ffprobe {
    ffprobe_path: String,
    timeout: Duration,
}

impl Ffprobe {
    #[must_use]
    pub fn new(ffprobe_path: &str, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.to_string(),
            timeout,
        }
    }

    /// List the video streams of `uri` as renditions, in container order.
    pub async fn video_renditions(&self, uri: &str) -> Result<Vec<Rendition>> {
        let output = self
            .run(&["-v", "error", "-show_streams", "-select_streams", "v", "-of", "json", uri])
            .await?;
        parse_streams(&output, uri)
    }

    /// Width and height of the first video stream of `uri`.
    pub async fn dimensions(&self, uri: &str) -> Result<(u32, u32)> {
        let renditions = self.video_renditions(uri).await?;
        renditions
            .iter()
            .find(|r| r.has_dimensions())
            .map(|r| (r.width, r.height))
            .ok_or_else(|| Error::Parse(format!("no video dimensions reported for {uri}")))
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!("ffprobe args: {:?}", args);

        let child = Command::new(&self.ffprobe_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Fetch(format!("failed to run {}: {e}", self.ffprobe_path)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Fetch(format!("ffprobe timed out after {:?}", self.timeout)))?
            .map_err(|e| Error::Fetch(format!("ffprobe failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fetch(format!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

fn parse_streams(json: &[u8], uri: &str) -> Result<Vec<Rendition>> {
    let probe: FfprobeOutput = serde_json::from_slice(json)?;

    Ok(probe
        .streams
        .into_iter()
        .filter(|s| s.codec_type.as_deref().map_or(true, |t| t == "video"))
        .map(|s| Rendition {
            width: s.width.unwrap_or(0),
            height: s.height.unwrap_or(0),
            bitrate: s.bit_rate.and_then(|b| b.parse().ok()).unwrap_or(0),
            uri: uri.to_string(),
            codecs: s.codec_name,
            stream_index: s.index,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: Option<u32>,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    bit_rate: Option<String>,
}
