//! Error taxonomy shared by the engine, the task registry and the HTTP layer.

use std::fmt;

use thiserror::Error;

use crate::resolve::ResolutionError;
use crate::tasks::TaskError;

/// Machine readable cause attached to a failed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The source reported that the video does not exist or was removed.
    Unavailable,
    /// Age gate, region lock, private video or sign-in wall.
    Restricted,
    /// Network failure that outlived the engine's retry budget.
    Network,
    /// ffmpeg post-processing failed.
    Transcode,
    /// Anything else the engine reported, including a missing executable.
    Engine,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Restricted => "restricted",
            Self::Network => "network",
            Self::Transcode => "transcode",
            Self::Engine => "engine",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata lookup (or search) produced nothing usable.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no title available for {url}")]
    MissingTitle { url: String },
    #[error("metadata lookup failed ({reason}): {message}")]
    Engine {
        reason: FailureReason,
        message: String,
    },
    #[error("unreadable engine output: {0}")]
    Malformed(String),
}

/// Fetching or transcoding failed after the engine exhausted its retries.
#[derive(Debug, Error)]
#[error("download failed ({reason}): {message}")]
pub struct DownloadError {
    pub reason: FailureReason,
    pub message: String,
}

impl DownloadError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Everything a service operation can fail with.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid file name")]
    InvalidFilename,
    #[error("file not found: {0}")]
    FileMissing(String),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("worker pool unavailable: {0}")]
    Worker(String),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
