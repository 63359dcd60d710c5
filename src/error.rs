//! Error taxonomy for the acquisition pipeline.
//!
//! Manifest-phase and open errors are fatal and surface immediately.
//! Read stalls never appear here unless they exceed the configured bound,
//! at which point they escalate to [`Error::Stream`]. Hardware probe
//! failures are never errors at all.

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to fetch manifest: {0}")]
    Fetch(String),

    #[error("failed to parse manifest: {0}")]
    Parse(String),

    #[error("manifest lists no renditions")]
    NoRenditionsFound,

    #[error("failed to open decoder: {0}")]
    DecodeOpen(String),

    #[error("stream failed ({stalls} consecutive stalls): {reason}")]
    Stream { stalls: u32, reason: String },
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Fetch(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
