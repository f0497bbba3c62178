//! Audio devices, channel files and the sessions that connect them
//!
//! This module provides:
//! - Device backends (PipeWire, cpal, virtual) behind one trait
//! - Canonical 8kHz stereo 16-bit channel files via hound
//! - Sample-rate and channel-layout conversion
//! - Capture and looped playback sessions

pub mod backend;
pub mod convert;
pub mod format;
pub mod looping;
pub mod pipeline;
pub mod recorder;

pub use backend::{select_backend, AudioBackend, BackendPreference};
pub use pipeline::{AudioPipeline, Notifier, PipelineOptions, ResourceHandle, SupervisorMessage};
pub use recorder::ChannelFiles;
