//! Error type shared by the audio pipeline and the channel controller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    #[error("no usable audio device: {0}")]
    DeviceUnavailable(String),

    #[error("no recording at {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("cannot decode audio: {0}")]
    Decode(String),

    #[error("audio i/o failed: {0}")]
    Io(String),

    #[error("channel {channel} is out of range (0..{count})")]
    InvalidChannel { channel: usize, count: usize },
}

/// Coarse classification used in notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnavailable,
    FileNotFound,
    DecodeError,
    IoFailure,
    InvalidChannel,
}

impl LoopError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoopError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            LoopError::FileNotFound(_) => ErrorKind::FileNotFound,
            LoopError::Decode(_) => ErrorKind::DecodeError,
            LoopError::Io(_) => ErrorKind::IoFailure,
            LoopError::InvalidChannel { .. } => ErrorKind::InvalidChannel,
        }
    }

    /// Map a hound error raised while writing a recording.
    pub fn from_write(err: hound::Error) -> Self {
        LoopError::Io(err.to_string())
    }

    /// Map a hound error raised while reading a recording.
    ///
    /// Errors the OS raised (EIO, revoked permissions) are I/O failures.
    /// hound reports a short read as a plain I/O error without an OS code;
    /// that means the file is damaged and is a decode problem.
    pub fn from_read(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) if e.raw_os_error().is_some() => LoopError::Io(e.to_string()),
            other => LoopError::Decode(other.to_string()),
        }
    }
}

impl From<std::io::Error> for LoopError {
    fn from(err: std::io::Error) -> Self {
        LoopError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LoopError>;
