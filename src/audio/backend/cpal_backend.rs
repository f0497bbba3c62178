//! cpal backend: the host's default audio API first, then any other host
//! cpal can reach (WASAPI/ASIO, ALSA/JACK, CoreAudio).

use super::{spawn_stream_thread, AudioBackend, DeviceStream, ErrorCallback, InputCallback, OutputCallback};
use crate::audio::format::StreamFormat;
use crate::error::{LoopError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, HostId, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::bounded;
use log::{debug, warn};
use std::sync::Arc;

pub struct CpalBackend {
    host_id: HostId,
    name: String,
}

impl CpalBackend {
    /// Find the first host exposing a default input or output device
    pub fn probe() -> Result<Arc<dyn AudioBackend>> {
        let default_id = cpal::default_host().id();
        let mut candidates = vec![default_id];
        candidates.extend(
            cpal::available_hosts()
                .into_iter()
                .filter(|id| *id != default_id),
        );

        for host_id in candidates {
            let host = match cpal::host_from_id(host_id) {
                Ok(host) => host,
                Err(e) => {
                    debug!("cpal host {} unavailable: {}", host_id.name(), e);
                    continue;
                }
            };
            let has_input = host.default_input_device().is_some();
            let has_output = host.default_output_device().is_some();
            debug!(
                "cpal host {}: input={} output={}",
                host_id.name(),
                has_input,
                has_output
            );
            if has_input || has_output {
                return Ok(Arc::new(Self {
                    host_id,
                    name: format!("cpal/{}", host_id.name().to_lowercase()),
                }));
            }
        }

        Err(LoopError::DeviceUnavailable(
            "no cpal host exposes an audio device".to_string(),
        ))
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_input(&self, on_data: InputCallback, on_error: ErrorCallback) -> Result<DeviceStream> {
        let host_id = self.host_id;
        let (stop_tx, stop_rx) = bounded::<()>(1);
        spawn_stream_thread(
            "cpal-input",
            Box::new(move || {
                let _ = stop_tx.send(());
            }),
            move |ready| {
                // cpal streams are not Send on every platform, so the stream
                // lives and dies on this thread
                let (stream, format) = match build_input(host_id, on_data, on_error) {
                    Ok(built) => built,
                    Err(err) => {
                        let _ = ready.send(Err(err));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready.send(Err(LoopError::DeviceUnavailable(format!(
                        "cannot start input stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready.send(Ok(format));
                let _ = stop_rx.recv();
                if let Err(e) = stream.pause() {
                    debug!("failed to pause input stream: {}", e);
                }
            },
        )
    }

    fn open_output(&self, on_fill: OutputCallback, on_error: ErrorCallback) -> Result<DeviceStream> {
        let host_id = self.host_id;
        let (stop_tx, stop_rx) = bounded::<()>(1);
        spawn_stream_thread(
            "cpal-output",
            Box::new(move || {
                let _ = stop_tx.send(());
            }),
            move |ready| {
                let (stream, format) = match build_output(host_id, on_fill, on_error) {
                    Ok(built) => built,
                    Err(err) => {
                        let _ = ready.send(Err(err));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready.send(Err(LoopError::DeviceUnavailable(format!(
                        "cannot start output stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready.send(Ok(format));
                let _ = stop_rx.recv();
                if let Err(e) = stream.pause() {
                    debug!("failed to pause output stream: {}", e);
                }
            },
        )
    }
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> LoopError {
    LoopError::DeviceUnavailable(format!("{}: {}", context, err))
}

fn build_input(
    host_id: HostId,
    on_data: InputCallback,
    mut on_error: ErrorCallback,
) -> Result<(cpal::Stream, StreamFormat)> {
    let host = cpal::host_from_id(host_id).map_err(|e| unavailable("audio host", e))?;
    let device = host.default_input_device().ok_or_else(|| {
        LoopError::DeviceUnavailable(format!("{} has no input device", host_id.name()))
    })?;
    let supported = device
        .default_input_config()
        .map_err(|e| unavailable("input config", e))?;

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let format = StreamFormat::new(config.sample_rate.0, config.channels);
    debug!(
        "Input device {:?}: {:?} {}Hz x{}",
        device.name().ok(),
        sample_format,
        format.sample_rate,
        format.channels
    );

    let err_fn = move |err: cpal::StreamError| {
        warn!("input stream error: {}", err);
        on_error(LoopError::DeviceUnavailable(err.to_string()));
    };

    let stream = match sample_format {
        SampleFormat::F32 => build_input_typed::<f32>(&device, &config, on_data, err_fn),
        SampleFormat::I16 => build_input_typed::<i16>(&device, &config, on_data, err_fn),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &config, on_data, err_fn),
        SampleFormat::I32 => build_input_typed::<i32>(&device, &config, on_data, err_fn),
        other => Err(LoopError::DeviceUnavailable(format!(
            "unsupported input sample format: {:?}",
            other
        ))),
    }?;

    Ok((stream, format))
}

fn build_input_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut on_data: InputCallback,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&sample| f32::from_sample(sample)));
                on_data(&scratch);
            },
            err_fn,
            None,
        )
        .map_err(|e| unavailable("cannot build input stream", e))
}

fn build_output(
    host_id: HostId,
    on_fill: OutputCallback,
    mut on_error: ErrorCallback,
) -> Result<(cpal::Stream, StreamFormat)> {
    let host = cpal::host_from_id(host_id).map_err(|e| unavailable("audio host", e))?;
    let device = host.default_output_device().ok_or_else(|| {
        LoopError::DeviceUnavailable(format!("{} has no output device", host_id.name()))
    })?;
    let supported = device
        .default_output_config()
        .map_err(|e| unavailable("output config", e))?;

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let format = StreamFormat::new(config.sample_rate.0, config.channels);
    debug!(
        "Output device {:?}: {:?} {}Hz x{}",
        device.name().ok(),
        sample_format,
        format.sample_rate,
        format.channels
    );

    let err_fn = move |err: cpal::StreamError| {
        warn!("output stream error: {}", err);
        on_error(LoopError::DeviceUnavailable(err.to_string()));
    };

    let stream = match sample_format {
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, on_fill, err_fn),
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, on_fill, err_fn),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, on_fill, err_fn),
        SampleFormat::I32 => build_output_typed::<i32>(&device, &config, on_fill, err_fn),
        other => Err(LoopError::DeviceUnavailable(format!(
            "unsupported output sample format: {:?}",
            other
        ))),
    }?;

    Ok((stream, format))
}

fn build_output_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut on_fill: OutputCallback,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                on_fill(&mut scratch);
                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(sample);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| unavailable("cannot build output stream", e))
}
