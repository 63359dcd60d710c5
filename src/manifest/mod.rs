//! Stream discovery: fetch a manifest, list its renditions, pick the best.
//!
//! HTTP(S) inputs are treated as HLS playlists. Every other supported
//! scheme (RTMP, RTSP, SRT, ...) is probed with ffprobe and its video
//! streams become the renditions.

mod hls;
pub mod probe;

use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use crate::config::FetchSettings;
use crate::error::{Error, Result};

pub use hls::parse_playlist;
pub use probe::Ffprobe;

/// Largest playlist body read into memory.
const MAX_PLAYLIST_BYTES: usize = 1024 * 1024;

/// Schemes handed to ffprobe instead of fetched over HTTP.
const PROBED_SCHEMES: &[&str] = &["rtmp", "rtmps", "rtsp", "rtsps", "srt", "udp", "file"];

/// One encoded variant of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    /// Width in pixels (`0` when the manifest doesn't say).
    pub width: u32,
    /// Height in pixels (`0` when the manifest doesn't say).
    pub height: u32,
    /// Advertised bitrate in bits per second.
    pub bitrate: u64,
    /// Absolute media URI.
    pub uri: String,
    /// Codec string (HLS `CODECS`, or the ffprobe codec name).
    pub codecs: Option<String>,
    /// Container stream index, for renditions discovered by probing.
    pub stream_index: Option<u32>,
}

impl Rendition {
    #[must_use]
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    #[must_use]
    pub fn has_dimensions(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl fmt::Display for Rendition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_dimensions() {
            write!(f, "{}x{}", self.width, self.height)?;
        } else {
            write!(f, "unknown size")?;
        }
        if self.bitrate > 0 {
            write!(f, " @ {} bps", self.bitrate)?;
        }
        if let Some(idx) = self.stream_index {
            write!(f, " (stream {idx})")?;
        }
        Ok(())
    }
}

/// Parsed manifest. Always holds at least one rendition.
#[derive(Debug, Clone)]
pub struct Manifest {
    url: String,
    renditions: Vec<Rendition>,
}

impl Manifest {
    /// Build a manifest from renditions in manifest order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRenditionsFound`] when `renditions` is empty.
    pub fn new(url: impl Into<String>, renditions: Vec<Rendition>) -> Result<Self> {
        if renditions.is_empty() {
            return Err(Error::NoRenditionsFound);
        }
        Ok(Self {
            url: url.into(),
            renditions,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn renditions(&self) -> &[Rendition] {
        &self.renditions
    }

    /// Position of the largest rendition by `width × height`.
    ///
    /// Equal areas keep the earliest entry, so the choice is stable for an
    /// unchanged manifest.
    #[must_use]
    pub fn best_index(&self) -> usize {
        self.renditions
            .iter()
            .enumerate()
            .fold(0, |best, (idx, r)| {
                if r.area() > self.renditions[best].area() {
                    idx
                } else {
                    best
                }
            })
    }

    #[must_use]
    pub fn best(&self) -> &Rendition {
        &self.renditions[self.best_index()]
    }
}

/// Validate a user-supplied stream address.
pub fn parse_stream_url(input: &str) -> Result<Url> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::InvalidInput("stream URL is empty".to_string()));
    }

    let url = Url::parse(input).map_err(|e| Error::InvalidInput(format!("'{input}': {e}")))?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" && !PROBED_SCHEMES.contains(&scheme) {
        return Err(Error::InvalidInput(format!("unsupported scheme '{scheme}'")));
    }
    if url.cannot_be_a_base() || (scheme != "file" && url.host_str().is_none()) {
        return Err(Error::InvalidInput(format!("'{input}' has no host")));
    }

    Ok(url)
}

/// Turns a stream address into a [`Manifest`].
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn resolve(&self, input: &str) -> Result<Manifest>;
}

/// Fetches and parses stream manifests.
pub struct ManifestResolver {
    client: Client,
    ffprobe: Ffprobe,
}

impl ManifestResolver {
    pub fn new(settings: &FetchSettings, ffprobe: Ffprobe) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .connect_timeout(settings.timeout())
            .user_agent(settings.user_agent.as_str())
            .tcp_nodelay(true)
            .build()?;

        Ok(Self { client, ffprobe })
    }

    /// Fetch `input` once and list its renditions. Failures are not retried.
    pub async fn resolve(&self, input: &str) -> Result<Manifest> {
        let url = parse_stream_url(input)?;

        let renditions = if matches!(url.scheme(), "http" | "https") {
            match self.fetch_playlist(&url).await? {
                Some(body) => hls::parse_playlist(&body, &url)?,
                None => {
                    debug!("{url} is not an HLS playlist, trying ffprobe");
                    self.ffprobe
                        .video_renditions(url.as_str())
                        .await
                        .map_err(|e| {
                            Error::Parse(format!(
                                "{url} is neither an HLS playlist nor a stream ffprobe can read: {e}"
                            ))
                        })?
                }
            }
        } else {
            self.ffprobe.video_renditions(url.as_str()).await?
        };
        debug!("Found {} renditions at {}", renditions.len(), url);

        let manifest = Manifest::new(url.as_str(), renditions)?;
        info!(
            "Selected rendition {} of {}: {}",
            manifest.best_index() + 1,
            manifest.renditions().len(),
            manifest.best()
        );
        Ok(manifest)
    }

    /// Fetch an HLS playlist body. `None` when the URL serves something else
    /// (a media byte stream, DASH, ...), detected from the first bytes.
    async fn fetch_playlist(&self, url: &Url) -> Result<Option<String>> {
        let mut resp = self.client.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Fetch(format!("{url} returned {}", resp.status())));
        }
        let declared = resp.content_length();

        let mut body = Vec::new();
        let mut is_playlist = None;
        while let Some(chunk) = resp.chunk().await? {
            body.extend_from_slice(&chunk);

            if is_playlist.is_none() {
                is_playlist = hls::playlist_prefix(&body);
                match is_playlist {
                    Some(false) => return Ok(None),
                    Some(true) if declared.is_some_and(|len| len > MAX_PLAYLIST_BYTES as u64) => {
                        return Err(playlist_too_large(url));
                    }
                    _ => {}
                }
            }
            if body.len() > MAX_PLAYLIST_BYTES {
                return Err(playlist_too_large(url));
            }
        }

        if is_playlist != Some(true) {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&body).into_owned()))
    }
}

fn playlist_too_large(url: &Url) -> Error {
    Error::Fetch(format!("{url} playlist exceeds {MAX_PLAYLIST_BYTES} bytes"))
}

#[async_trait]
impl ManifestSource for ManifestResolver {
    async fn resolve(&self, input: &str) -> Result<Manifest> {
        ManifestResolver::resolve(self, input).await
    }
}
