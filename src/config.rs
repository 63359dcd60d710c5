//! Runtime configuration loaded from `~/.config/livegrab/config.toml`.
//!
//! Every field has a default, so the file is optional and may be partial.
//! Durations are written in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::source::{PixelFormat, SourceConfig};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub source: SourceSettings,
    pub decoder: DecoderSettings,
    pub probe: ProbeSettings,
    pub fetch: FetchSettings,
    pub pipeline: PipelineSettings,
}

/// Frame acquisition tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSettings {
    /// Consecutive stalls tolerated before the stream is declared failed.
    pub max_consecutive_stalls: u32,
    pub read_timeout_ms: u64,
    pub stall_backoff_ms: u64,
    pub pixel_format: PixelFormat,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            max_consecutive_stalls: 5,
            read_timeout_ms: 5_000,
            stall_backoff_ms: 200,
            pixel_format: PixelFormat::Bgr24,
        }
    }
}

impl SourceSettings {
    #[must_use]
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            max_consecutive_stalls: self.max_consecutive_stalls,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            stall_backoff: Duration::from_millis(self.stall_backoff_ms),
        }
    }
}

/// ffmpeg / ffprobe invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderSettings {
    /// Explicit ffmpeg binary; looked up in `PATH` when unset.
    pub ffmpeg_path: Option<String>,
    /// Explicit ffprobe binary; looked up in `PATH` when unset.
    pub ffprobe_path: Option<String>,
    /// ffmpeg `-hwaccel` method used for the hardware backend.
    pub hwaccel: String,
    /// How long a freshly spawned decoder must survive to count as opened.
    pub open_grace_ms: u64,
    /// ffmpeg `-loglevel`.
    pub log_level: String,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            hwaccel: "cuda".to_string(),
            open_grace_ms: 500,
            log_level: "warning".to_string(),
        }
    }
}

impl DecoderSettings {
    #[must_use]
    pub fn ffmpeg_path(&self) -> String {
        self.ffmpeg_path
            .clone()
            .unwrap_or_else(|| find_binary("ffmpeg"))
    }

    #[must_use]
    pub fn ffprobe_path(&self) -> String {
        self.ffprobe_path
            .clone()
            .unwrap_or_else(|| find_binary("ffprobe"))
    }

    #[must_use]
    pub fn open_grace(&self) -> Duration {
        Duration::from_millis(self.open_grace_ms)
    }
}

/// Hardware capability probing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeSettings {
    pub timeout_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl ProbeSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Manifest fetching.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchSettings {
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            user_agent: format!("livegrab/{}", crate::VERSION),
        }
    }
}

impl FetchSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Whole-pipeline restart policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    /// Restarts (fresh manifest fetch) allowed after a stream failure.
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_restarts: 0,
            restart_delay_ms: 1_000,
        }
    }
}

impl PipelineSettings {
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Config {
    /// Load from the default location.
    ///
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load from an explicit path, falling back to defaults when it is absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        toml::from_str(&content).with_context(|| format!("invalid TOML in {}", path.display()))
    }
}

/// Return the path to the config file.
#[must_use]
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("livegrab")
        .join("config.toml")
}

fn find_binary(name: &str) -> String {
    which::which(name).map_or_else(|_| name.to_string(), |p| p.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.source.max_consecutive_stalls, 5);
        assert_eq!(config.source.pixel_format, PixelFormat::Bgr24);
        assert_eq!(config.decoder.hwaccel, "cuda");
        assert_eq!(config.pipeline.max_restarts, 0);
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
[source]
max_consecutive_stalls = 10
pixel_format = "gray8"

[decoder]
ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.source.max_consecutive_stalls, 10);
        assert_eq!(config.source.read_timeout_ms, 5_000);
        assert_eq!(config.source.pixel_format, PixelFormat::Gray8);
        assert_eq!(config.decoder.ffmpeg_path(), "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.decoder.log_level, "warning");
    }

    #[test]
    fn source_config_converts_durations() {
        let settings = SourceSettings {
            read_timeout_ms: 1_500,
            stall_backoff_ms: 0,
            ..SourceSettings::default()
        };
        let config = settings.source_config();
        assert_eq!(config.read_timeout, Duration::from_millis(1_500));
        assert_eq!(config.stall_backoff, Duration::ZERO);
        assert_eq!(config.max_consecutive_stalls, 5);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[source]\nmax_stalls = 3\n").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/livegrab/config.toml")).unwrap();
        assert_eq!(config.fetch.timeout_ms, 10_000);
    }

    #[test]
    fn config_path_ends_with_livegrab() {
        let path = config_path();
        assert!(path.ends_with("livegrab/config.toml"));
    }
}
