//! Update Error Types

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Release service unavailable: {0}")]
    TransientFetch(String),

    #[error("Corrupt download: {0}")]
    CorruptDownload(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Install failed: {0}")]
    InstallFailure(String),

    #[error("An update is already in progress")]
    AlreadyRunning,
}

impl UpdateError {
    /// Wrap a filesystem error raised while staging or swapping
    pub fn install(context: impl std::fmt::Display, err: io::Error) -> Self {
        Self::InstallFailure(format!("{}: {}", context, err))
    }

    /// Whether the host may try the same cycle again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetch(_) | Self::AlreadyRunning)
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::UnsupportedPlatform(_) => FailureKind::UnsupportedPlatform,
            Self::TransientFetch(_) => FailureKind::TransientFetch,
            Self::CorruptDownload(_) => FailureKind::CorruptDownload,
            Self::ChecksumMismatch { .. } => FailureKind::ChecksumMismatch,
            Self::InstallFailure(_) => FailureKind::InstallFailure,
            Self::AlreadyRunning => FailureKind::AlreadyRunning,
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::TransientFetch(format!("request timed out: {}", e))
        } else {
            Self::TransientFetch(e.to_string())
        }
    }
}

/// Machine-readable failure category handed to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnsupportedPlatform,
    TransientFetch,
    CorruptDownload,
    ChecksumMismatch,
    InstallFailure,
    AlreadyRunning,
}

/// Structured reason for a failed cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&UpdateError> for FailureReason {
    fn from(err: &UpdateError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
