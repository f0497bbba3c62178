use crate::audio::BackendPreference;
use crate::error::{ErrorKind, LoopError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What a channel slot is currently doing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Idle,
    Recording,
    Playing,
}

/// Payload of a channel notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEventKind {
    Recording,
    Playing,
    Stopped,
    /// Playback wrapped back to the start of the file
    LoopCompleted { cycles: u64 },
    /// A running session failed and the channel went back to idle
    Failed { kind: ErrorKind, message: String },
}

/// Asynchronous notification about one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub at: DateTime<Utc>,
    pub channel: usize,
    #[serde(flatten)]
    pub kind: ChannelEventKind,
}

impl ChannelEvent {
    pub fn new(channel: usize, kind: ChannelEventKind) -> Self {
        Self {
            at: Utc::now(),
            channel,
            kind,
        }
    }

    pub fn failed(channel: usize, error: &LoopError) -> Self {
        Self::new(
            channel,
            ChannelEventKind::Failed {
                kind: error.kind(),
                message: error.to_string(),
            },
        )
    }
}

/// Snapshot of one channel for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel: usize,
    pub state: ChannelState,
    pub file: PathBuf,
    pub recorded: bool,
    pub duration_seconds: Option<f64>,
}

/// Looper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LooperConfig {
    pub channels: usize,
    pub recordings_dir: PathBuf,
    pub backend: BackendPreference,
    /// Device buffers held between the capture callback and the file writer
    pub capture_queue: usize,
    /// Frames decoded per playback block
    pub playback_block_frames: usize,
    /// Decoded blocks held ahead of the output device
    pub playback_queue: usize,
    /// How often a recording's WAV header is brought up to date
    pub flush_interval_ms: u64,
}

impl LooperConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    /// Default recordings directory
    pub fn default_recordings_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("loopstation")
            .join("channels")
    }
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            channels: 10,
            recordings_dir: Self::default_recordings_dir(),
            backend: BackendPreference::Auto,
            capture_queue: 64,
            playback_block_frames: 1024,
            playback_queue: 8,
            flush_interval_ms: 1000,
        }
    }
}
