//! Device-free backend
//!
//! Input produces a sine tone and output discards whatever the session plays.
//! Test builds can script the input and capture the output. Streams run on
//! their own threads and are paced by a period timer, like a real driver
//! callback.

use super::{spawn_stream_thread, AudioBackend, DeviceStream, ErrorCallback, InputCallback, OutputCallback};
use crate::audio::format::StreamFormat;
use crate::error::{LoopError, Result};
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::f32::consts::PI;
#[cfg(test)]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the virtual microphone delivers
#[derive(Clone, Debug)]
pub enum VirtualInput {
    Tone { frequency: f32, amplitude: f32 },
    /// Interleaved samples delivered once, after which the device stays quiet
    #[cfg(test)]
    Script(Arc<Vec<f32>>),
}

pub struct VirtualBackend {
    format: StreamFormat,
    period_frames: usize,
    period: Duration,
    input: VirtualInput,
    available: bool,
    open_streams: Arc<AtomicUsize>,
    /// Output sink, only set by tests
    capture: Option<Arc<Mutex<Vec<f32>>>>,
    #[cfg(test)]
    script_done: Arc<AtomicBool>,
}

impl VirtualBackend {
    /// 48kHz stereo, 10ms periods, 440Hz tone
    pub fn new() -> Self {
        Self {
            format: StreamFormat::new(48_000, 2),
            period_frames: 480,
            period: Duration::from_millis(10),
            input: VirtualInput::Tone {
                frequency: 440.0,
                amplitude: 0.5,
            },
            available: true,
            open_streams: Arc::new(AtomicUsize::new(0)),
            capture: None,
            #[cfg(test)]
            script_done: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(LoopError::DeviceUnavailable(
                "virtual device is disabled".to_string(),
            ))
        }
    }
}

#[cfg(test)]
impl VirtualBackend {
    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = format;
        self
    }

    /// Frames per callback and the wall-clock wait between callbacks
    pub fn with_period(mut self, frames: usize, period: Duration) -> Self {
        self.period_frames = frames.max(1);
        self.period = period;
        self
    }

    pub fn with_input(mut self, input: VirtualInput) -> Self {
        self.input = input;
        self
    }

    /// Keep output from the first fully audible callback on, silence included
    pub fn with_capture(mut self) -> Self {
        self.capture = Some(Arc::new(Mutex::new(Vec::new())));
        self
    }

    /// Simulate a host without audio devices
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Streams currently open on this backend
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Whether a scripted input has been delivered in full
    pub fn script_delivered(&self) -> bool {
        self.script_done.load(Ordering::SeqCst)
    }

    /// Snapshot of captured output
    pub fn captured(&self) -> Vec<f32> {
        self.capture
            .as_ref()
            .map(|c| c.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for VirtualBackend {
    fn name(&self) -> &str {
        "virtual"
    }

    fn open_input(&self, mut on_data: InputCallback, _on_error: ErrorCallback) -> Result<DeviceStream> {
        self.check_available()?;

        let format = self.format;
        let period = self.period;
        let period_samples = format.samples_for_frames(self.period_frames);
        let input = self.input.clone();
        let open_streams = self.open_streams.clone();
        #[cfg(test)]
        let script_done = self.script_done.clone();
        let (stop_tx, stop_rx) = bounded::<()>(1);

        spawn_stream_thread(
            "virtual-input",
            Box::new(move || {
                let _ = stop_tx.send(());
            }),
            move |ready| {
                open_streams.fetch_add(1, Ordering::SeqCst);
                let _ = ready.send(Ok(format));

                let channels = usize::from(format.channels.max(1));
                let mut buffer = Vec::with_capacity(period_samples);
                let mut frame_index = 0u64;
                #[cfg(test)]
                let mut cursor = 0usize;

                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(period) {
                    match &input {
                        VirtualInput::Tone {
                            frequency,
                            amplitude,
                        } => {
                            buffer.clear();
                            for _ in 0..period_samples / channels {
                                let t = frame_index as f32 / format.sample_rate as f32;
                                let value = (2.0 * PI * frequency * t).sin() * amplitude;
                                buffer.extend(std::iter::repeat(value).take(channels));
                                frame_index += 1;
                            }
                            on_data(&buffer);
                        }
                        #[cfg(test)]
                        VirtualInput::Script(samples) => {
                            if cursor < samples.len() {
                                let end = (cursor + period_samples).min(samples.len());
                                on_data(&samples[cursor..end]);
                                cursor = end;
                                if cursor == samples.len() {
                                    script_done.store(true, Ordering::SeqCst);
                                }
                            }
                        }
                    }
                }

                open_streams.fetch_sub(1, Ordering::SeqCst);
            },
        )
    }

    fn open_output(&self, mut on_fill: OutputCallback, _on_error: ErrorCallback) -> Result<DeviceStream> {
        self.check_available()?;

        let format = self.format;
        let period = self.period;
        let period_samples = format.samples_for_frames(self.period_frames);
        let capture = self.capture.clone();
        let open_streams = self.open_streams.clone();
        let (stop_tx, stop_rx) = bounded::<()>(1);

        spawn_stream_thread(
            "virtual-output",
            Box::new(move || {
                let _ = stop_tx.send(());
            }),
            move |ready| {
                open_streams.fetch_add(1, Ordering::SeqCst);
                let _ = ready.send(Ok(format));

                let mut buffer = vec![0.0f32; period_samples];
                let mut heard = false;
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(period) {
                    let audible = on_fill(&mut buffer).min(buffer.len());
                    if let Some(capture) = &capture {
                        // Start-up is not kept; after it every short
                        // callback leaves its silence in the capture
                        heard |= audible == buffer.len();
                        if heard {
                            capture
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .extend_from_slice(&buffer);
                        }
                    }
                }

                open_streams.fetch_sub(1, Ordering::SeqCst);
            },
        )
    }
}
