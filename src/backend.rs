//! Decode backend selection.
//!
//! Hardware decode is an optimization, never a requirement: whatever the
//! probe does (reports no device, errors, panics, hangs) the selector
//! still returns a backend, degrading to [`DecodeBackend::Software`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Decode execution path, chosen once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeBackend {
    /// GPU-accelerated decode (ffmpeg `-hwaccel`).
    Hardware,
    /// Plain CPU decode.
    Software,
}

impl fmt::Display for DecodeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware => f.write_str("hardware"),
            Self::Software => f.write_str("software"),
        }
    }
}

/// Runtime check for usable hardware decode.
#[async_trait]
pub trait HardwareProbe: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// `Ok(true)` when hardware decode can be initialized.
    async fn probe(&self) -> Result<bool>;
}

/// Pick a backend. Never fails.
///
/// With `prefer_hardware == false` the probe is not run at all.
pub async fn select_backend(
    prefer_hardware: bool,
    probe: &dyn HardwareProbe,
    timeout: Duration,
) -> DecodeBackend {
    if !prefer_hardware {
        info!("Hardware decode disabled, using software");
        return DecodeBackend::Software;
    }

    let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(probe.probe()).catch_unwind()).await;

    match outcome {
        Ok(Ok(Ok(true))) => {
            info!("Hardware decode available ({})", probe.name());
            DecodeBackend::Hardware
        }
        Ok(Ok(Ok(false))) => {
            info!("No hardware decode device ({}), using software", probe.name());
            DecodeBackend::Software
        }
        Ok(Ok(Err(e))) => {
            warn!("Hardware probe {} failed: {e:#}; using software", probe.name());
            DecodeBackend::Software
        }
        Ok(Err(_)) => {
            warn!("Hardware probe {} panicked; using software", probe.name());
            DecodeBackend::Software
        }
        Err(_) => {
            warn!(
                "Hardware probe {} timed out after {timeout:?}; using software",
                probe.name()
            );
            DecodeBackend::Software
        }
    }
}

/// Fixed probe answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

#[async_trait]
impl HardwareProbe for StaticProbe {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn probe(&self) -> Result<bool> {
        Ok(self.0)
    }
}

/// Asks ffmpeg whether it was built with the configured `-hwaccel` method.
///
/// For `cuda` it also requires `nvidia-smi -L` to list a GPU, since ffmpeg
/// advertises the method whether or not a device is present.
pub struct FfmpegHwaccelProbe {
    ffmpeg_path: String,
    hwaccel: String,
}

impl FfmpegHwaccelProbe {
    #[must_use]
    pub fn new(ffmpeg_path: &str, hwaccel: &str) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.to_string(),
            hwaccel: hwaccel.to_string(),
        }
    }

    async fn nvidia_gpu_present() -> Result<bool> {
        let nvidia_smi = which::which("nvidia-smi").context("nvidia-smi not in PATH")?;
        let output = Command::new(nvidia_smi)
            .arg("-L")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).contains("GPU"))
    }
}

#[async_trait]
impl HardwareProbe for FfmpegHwaccelProbe {
    fn name(&self) -> &'static str {
        "ffmpeg-hwaccel"
    }

    async fn probe(&self) -> Result<bool> {
        if self.hwaccel == "cuda" && !Self::nvidia_gpu_present().await? {
            return Ok(false);
        }

        let output = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-hwaccels"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.ffmpeg_path))?;

        if !output.status.success() {
            return Err(anyhow!("ffmpeg -hwaccels exited with {}", output.status));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        debug!("ffmpeg hwaccels: {}", listing.trim());
        Ok(hwaccel_listed(&listing, &self.hwaccel))
    }
}

/// Whether `method` appears in `ffmpeg -hwaccels` output.
fn hwaccel_listed(listing: &str, method: &str) -> bool {
    listing
        .lines()
        .skip_while(|l| !l.starts_with("Hardware acceleration methods"))
        .skip(1)
        .any(|l| l.trim() == method)
}
