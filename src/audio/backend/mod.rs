//! Device backends and capability-probed backend selection
//!
//! A backend opens one input or output stream at a time on a thread it owns.
//! The returned [`DeviceStream`] stops the stream and joins that thread when
//! released, so device access never outlives the session that asked for it.

mod cpal_backend;
#[cfg(feature = "pipewire")]
mod pipewire_backend;
mod virtual_device;

pub use cpal_backend::CpalBackend;
#[cfg(feature = "pipewire")]
pub use pipewire_backend::PipeWireBackend;
pub use virtual_device::{VirtualBackend, VirtualInput};

use super::format::StreamFormat;
use crate::error::{LoopError, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Receives interleaved f32 samples in the stream's format
pub type InputCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Fills an interleaved f32 buffer in the stream's format
///
/// The callback must write every sample and return the length of the prefix
/// that carries real audio (the remainder is silence).
pub type OutputCallback = Box<dyn FnMut(&mut [f32]) -> usize + Send>;

/// Receives device failures raised after the stream started
pub type ErrorCallback = Box<dyn FnMut(LoopError) + Send>;

/// How long a backend may take to report that a stream is running
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Device threads that missed `OPEN_TIMEOUT`, joined once they exit
static STRAGGLERS: Mutex<Vec<(String, JoinHandle<()>)>> = Mutex::new(Vec::new());

pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open_input(&self, on_data: InputCallback, on_error: ErrorCallback) -> Result<DeviceStream>;

    fn open_output(&self, on_fill: OutputCallback, on_error: ErrorCallback)
        -> Result<DeviceStream>;
}

/// A running device stream owned by a dedicated thread
pub struct DeviceStream {
    format: StreamFormat,
    label: String,
    stopper: Option<Box<dyn FnOnce() + Send>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceStream {
    /// Negotiated layout of the samples exchanged with the callbacks
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Stop the device and wait for its thread. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(stopper) = self.stopper.take() {
            stopper();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("{} thread panicked while stopping", self.label);
            } else {
                debug!("{} stopped", self.label);
            }
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `body` on a named thread that owns a device stream.
///
/// `body` must report the negotiated format (or why the device could not be
/// opened) through `ready`, then block until `stopper` runs.
pub(crate) fn spawn_stream_thread<F>(
    label: &str,
    stopper: Box<dyn FnOnce() + Send>,
    body: F,
) -> Result<DeviceStream>
where
    F: FnOnce(Sender<Result<StreamFormat>>) + Send + 'static,
{
    spawn_stream_thread_within(label, stopper, body, OPEN_TIMEOUT)
}

fn spawn_stream_thread_within<F>(
    label: &str,
    stopper: Box<dyn FnOnce() + Send>,
    body: F,
    timeout: Duration,
) -> Result<DeviceStream>
where
    F: FnOnce(Sender<Result<StreamFormat>>) + Send + 'static,
{
    reap_stragglers();

    let (ready_tx, ready_rx) = bounded::<Result<StreamFormat>>(1);
    let thread = thread::Builder::new()
        .name(label.to_string())
        .spawn(move || body(ready_tx))
        .map_err(|e| LoopError::DeviceUnavailable(format!("cannot start {}: {}", label, e)))?;

    match ready_rx.recv_timeout(timeout) {
        Ok(Ok(format)) => {
            debug!(
                "{} running at {}Hz x{}",
                label, format.sample_rate, format.channels
            );
            Ok(DeviceStream {
                format,
                label: label.to_string(),
                stopper: Some(stopper),
                thread: Some(thread),
            })
        }
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(RecvTimeoutError::Disconnected) => {
            let _ = thread.join();
            Err(LoopError::DeviceUnavailable(format!(
                "{} exited before the stream started",
                label
            )))
        }
        Err(RecvTimeoutError::Timeout) => {
            // Stuck inside the driver. Keep the handle so the thread is
            // joined before a later open rather than forgotten.
            stopper();
            error!(
                "{} did not start within {:?}; it may still hold the device",
                label, timeout
            );
            STRAGGLERS
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((label.to_string(), thread));
            Err(LoopError::DeviceUnavailable(format!(
                "{} did not start within {:?}",
                label, timeout
            )))
        }
    }
}

/// Join timed-out device threads that have since exited
fn reap_stragglers() {
    let mut stragglers = STRAGGLERS.lock().unwrap_or_else(|e| e.into_inner());
    let mut running = Vec::new();
    for (label, thread) in stragglers.drain(..) {
        if thread.is_finished() {
            if thread.join().is_err() {
                warn!("{} thread panicked after timing out", label);
            } else {
                debug!("{} exited after timing out", label);
            }
        } else {
            warn!("{} is still stuck opening the device", label);
            running.push((label, thread));
        }
    }
    *stragglers = running;
}

/// Which backend to use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Probe the native API first, then fall back to the generic one
    #[default]
    Auto,
    /// PipeWire (Linux)
    #[value(name = "pipewire")]
    PipeWire,
    /// cpal over the host's audio APIs
    Cpal,
    /// Device-free tone generator and null sink
    Virtual,
}

impl BackendPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendPreference::Auto => "auto",
            BackendPreference::PipeWire => "pipewire",
            BackendPreference::Cpal => "cpal",
            BackendPreference::Virtual => "virtual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(BackendPreference::Auto),
            "pipewire" => Some(BackendPreference::PipeWire),
            "cpal" => Some(BackendPreference::Cpal),
            "virtual" => Some(BackendPreference::Virtual),
            _ => None,
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend candidate and the probe that checks the host supports it
struct Strategy {
    kind: BackendPreference,
    probe: fn() -> Result<Arc<dyn AudioBackend>>,
}

/// Candidates in the order `Auto` tries them
fn strategies() -> Vec<Strategy> {
    let mut list = Vec::new();
    #[cfg(feature = "pipewire")]
    list.push(Strategy {
        kind: BackendPreference::PipeWire,
        probe: PipeWireBackend::probe,
    });
    list.push(Strategy {
        kind: BackendPreference::Cpal,
        probe: CpalBackend::probe,
    });
    list
}

/// Pick the backend for this host
pub fn select_backend(preference: BackendPreference) -> Result<Arc<dyn AudioBackend>> {
    match preference {
        BackendPreference::Virtual => Ok(Arc::new(VirtualBackend::new())),
        BackendPreference::Auto => {
            let mut last_error = None;
            for strategy in strategies() {
                match (strategy.probe)() {
                    Ok(backend) => {
                        info!("Using {} audio backend", backend.name());
                        return Ok(backend);
                    }
                    Err(err) => {
                        debug!("{} backend rejected: {}", strategy.kind, err);
                        last_error = Some(err);
                    }
                }
            }
            Err(last_error.unwrap_or_else(|| {
                LoopError::DeviceUnavailable("no audio backend compiled in".to_string())
            }))
        }
        explicit => {
            let strategy = strategies()
                .into_iter()
                .find(|s| s.kind == explicit)
                .ok_or_else(|| {
                    LoopError::DeviceUnavailable(format!(
                        "{} support is not compiled into this build",
                        explicit
                    ))
                })?;
            let backend = (strategy.probe)()?;
            info!("Using {} audio backend", backend.name());
            Ok(backend)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_round_trips_through_strings() {
        for pref in [
            BackendPreference::Auto,
            BackendPreference::PipeWire,
            BackendPreference::Cpal,
            BackendPreference::Virtual,
        ] {
            assert_eq!(BackendPreference::parse(pref.as_str()), Some(pref));
        }
        assert_eq!(BackendPreference::parse(" CPAL "), Some(BackendPreference::Cpal));
        assert_eq!(BackendPreference::parse("wasapi"), None);
    }

    #[test]
    fn test_virtual_is_never_probed_automatically() {
        assert!(strategies()
            .iter()
            .all(|s| s.kind != BackendPreference::Virtual && s.kind != BackendPreference::Auto));
    }

    #[test]
    fn test_select_virtual_backend() {
        let backend = select_backend(BackendPreference::Virtual).unwrap();
        assert_eq!(backend.name(), "virtual");
    }

    #[test]
    fn test_failed_open_reports_error_and_joins() {
        let result = spawn_stream_thread("test-stream", Box::new(|| {}), |ready| {
            let _ = ready.send(Err(LoopError::DeviceUnavailable("busy".into())));
        });
        assert_eq!(
            result.err(),
            Some(LoopError::DeviceUnavailable("busy".into()))
        );
    }

    #[test]
    fn test_body_exiting_early_is_unavailable() {
        let result = spawn_stream_thread("test-stream", Box::new(|| {}), |_ready| {});
        assert!(matches!(result, Err(LoopError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_slow_open_times_out_and_is_joined_later() {
        let result = spawn_stream_thread_within(
            "slow-stream",
            Box::new(|| {}),
            |ready| {
                thread::sleep(Duration::from_millis(200));
                let _ = ready.send(Ok(StreamFormat::canonical()));
            },
            Duration::from_millis(20),
        );
        assert!(matches!(result, Err(LoopError::DeviceUnavailable(_))));

        // Other tests may be opening streams concurrently, so only wait for
        // the slow one to be gone
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            reap_stragglers();
            let pending = STRAGGLERS
                .lock()
                .unwrap()
                .iter()
                .any(|(label, _)| label == "slow-stream");
            if !pending {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "slow-stream never joined");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let mut stream = spawn_stream_thread(
            "test-stream",
            Box::new(move || {
                let _ = stop_tx.send(());
            }),
            move |ready| {
                let _ = ready.send(Ok(StreamFormat::canonical()));
                let _ = stop_rx.recv();
            },
        )
        .unwrap();

        assert_eq!(stream.format(), StreamFormat::canonical());
        stream.stop();
        stream.stop();
    }
}
