//! Typed errors for the capture → encode → deliver pipeline.
//!
//! The server and CLI edges use `anyhow`; everything the capture worker
//! has to branch on is one of these.

use std::path::PathBuf;
use thiserror::Error;

/// A single capture attempt failed. Always recoverable: skip the tick.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture source unavailable: {0}")]
    Unavailable(String),

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }
}

#[derive(Debug, Error)]
pub enum EncoderError {
    /// Neither the hardware nor the software profile could be started.
    #[error("encoder failed to start: {0}")]
    StartFailed(String),

    /// The encoder process has exited. Fatal for the current pipeline run.
    #[error("encoder process is not running")]
    NotRunning,

    #[error("frame encode failed: {0}")]
    Encode(String),

    #[error("encoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no audio capture device")]
    NoDevice,

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("audio worker could not be spawned: {0}")]
    Spawn(std::io::Error),
}

/// A config file that exists but cannot be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// A client message that could not be turned into a command.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown event {0:?}")]
    UnknownEvent(String),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("pipeline worker could not be spawned: {0}")]
    Spawn(std::io::Error),
}

impl PipelineError {
    /// Errors after which the current run must end instead of backing off.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Encoder(EncoderError::NotRunning)
                | PipelineError::Encoder(EncoderError::StartFailed(_))
        )
    }
}
