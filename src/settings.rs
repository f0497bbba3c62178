//! Looper settings persistence using dconf
//!
//! Settings are stored in dconf under `/com/loopstation/looper/`. Missing or
//! unreadable keys fall back to the built-in defaults.

use crate::audio::BackendPreference;
use crate::models::LooperConfig;
use log::{debug, error, warn};
use std::path::PathBuf;

const DCONF_PATH: &str = "/com/loopstation/looper/";

/// Keys for dconf settings
mod keys {
    pub const RECORDINGS_DIR: &str = "recordings-dir";
    pub const CHANNEL_COUNT: &str = "channel-count";
    pub const BACKEND: &str = "backend";
}

fn key(name: &str) -> String {
    format!("{}{}", DCONF_PATH, name)
}

/// Get the recordings directory from dconf
pub fn get_recordings_dir() -> Option<PathBuf> {
    dconf_rs::get_string(&key(keys::RECORDINGS_DIR))
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
}

/// Set the recordings directory in dconf
pub fn set_recordings_dir(dir: &std::path::Path) {
    if let Err(e) = dconf_rs::set_string(&key(keys::RECORDINGS_DIR), &dir.to_string_lossy()) {
        error!("Failed to save recordings directory to dconf: {}", e);
    }
}

/// Get the channel count from dconf
pub fn get_channel_count() -> Option<usize> {
    let value = dconf_rs::get_string(&key(keys::CHANNEL_COUNT)).ok()?;
    parse_channel_count(&value)
}

/// Set the channel count in dconf
pub fn set_channel_count(count: usize) {
    if let Err(e) = dconf_rs::set_string(&key(keys::CHANNEL_COUNT), &count.to_string()) {
        error!("Failed to save channel count to dconf: {}", e);
    }
}

/// Get the preferred audio backend from dconf
pub fn get_backend() -> Option<BackendPreference> {
    let value = dconf_rs::get_string(&key(keys::BACKEND)).ok()?;
    let parsed = BackendPreference::parse(&value);
    if parsed.is_none() && !value.is_empty() {
        warn!("Ignoring unknown backend '{}' in dconf", value);
    }
    parsed
}

/// Set the preferred audio backend in dconf
pub fn set_backend(backend: BackendPreference) {
    if let Err(e) = dconf_rs::set_string(&key(keys::BACKEND), backend.as_str()) {
        error!("Failed to save backend to dconf: {}", e);
    }
}

fn parse_channel_count(value: &str) -> Option<usize> {
    match value.trim().trim_matches('\'').parse::<usize>() {
        Ok(count) if count > 0 => Some(count),
        _ => {
            if !value.is_empty() {
                warn!("Ignoring invalid channel count '{}' in dconf", value);
            }
            None
        }
    }
}

/// Overlay stored settings on `config`
pub fn apply_stored(config: &mut LooperConfig) {
    if let Some(dir) = get_recordings_dir() {
        debug!("dconf recordings dir: {}", dir.display());
        config.recordings_dir = dir;
    }
    if let Some(count) = get_channel_count() {
        debug!("dconf channel count: {}", count);
        config.channels = count;
    }
    if let Some(backend) = get_backend() {
        debug!("dconf backend: {}", backend);
        config.backend = backend;
    }
}

/// Persist the settings that dconf tracks
pub fn save(config: &LooperConfig) {
    set_recordings_dir(&config.recordings_dir);
    set_channel_count(config.channels);
    set_backend(config.backend);
}
