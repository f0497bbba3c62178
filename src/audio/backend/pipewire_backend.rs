//! PipeWire backend
//!
//! Each stream runs its own PipeWire main loop on the stream thread. We ask
//! for interleaved F32LE at a fixed rate and channel count and let the
//! PipeWire adapter convert to whatever the graph runs at.

use super::{spawn_stream_thread, AudioBackend, DeviceStream, ErrorCallback, InputCallback, OutputCallback};
use crate::audio::format::StreamFormat;
use crate::error::{LoopError, Result};
use crossbeam_channel::Sender;
use log::{debug, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::Arc;

const STREAM_RATE: u32 = 48_000;
const STREAM_CHANNELS: u16 = 2;
const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

pub struct PipeWireBackend;

enum StreamCommand {
    Stop,
}

enum Endpoint {
    Capture(InputCallback),
    Playback(OutputCallback),
}

impl Endpoint {
    fn label(&self) -> &'static str {
        match self {
            Endpoint::Capture(_) => "pipewire-input",
            Endpoint::Playback(_) => "pipewire-output",
        }
    }
}

impl PipeWireBackend {
    /// Check that a PipeWire daemon accepts connections
    pub fn probe() -> Result<Arc<dyn AudioBackend>> {
        pw::init();
        let mainloop = pw::main_loop::MainLoopRc::new(None)
            .map_err(|e| unavailable("Failed to create PipeWire main loop", e))?;
        let context = pw::context::ContextRc::new(&mainloop, None)
            .map_err(|e| unavailable("Failed to create PipeWire context", e))?;
        let _core = context
            .connect_rc(None)
            .map_err(|e| unavailable("Failed to connect to PipeWire", e))?;
        Ok(Arc::new(PipeWireBackend))
    }

    fn open(&self, endpoint: Endpoint, on_error: ErrorCallback) -> Result<DeviceStream> {
        let label = endpoint.label();
        let (sender, receiver) = pw::channel::channel::<StreamCommand>();
        spawn_stream_thread(
            label,
            Box::new(move || {
                let _ = sender.send(StreamCommand::Stop);
            }),
            move |ready| {
                if let Err(err) = run_stream_loop(endpoint, on_error, receiver, &ready) {
                    let _ = ready.send(Err(err));
                }
            },
        )
    }
}

impl AudioBackend for PipeWireBackend {
    fn name(&self) -> &str {
        "pipewire"
    }

    fn open_input(&self, on_data: InputCallback, on_error: ErrorCallback) -> Result<DeviceStream> {
        self.open(Endpoint::Capture(on_data), on_error)
    }

    fn open_output(&self, on_fill: OutputCallback, on_error: ErrorCallback) -> Result<DeviceStream> {
        self.open(Endpoint::Playback(on_fill), on_error)
    }
}

fn unavailable(context: &str, err: impl std::fmt::Debug) -> LoopError {
    LoopError::DeviceUnavailable(format!("{}: {:?}", context, err))
}

/// Run one PipeWire stream until a stop command arrives
fn run_stream_loop(
    endpoint: Endpoint,
    on_error: ErrorCallback,
    receiver: pw::channel::Receiver<StreamCommand>,
    ready: &Sender<Result<StreamFormat>>,
) -> Result<()> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| unavailable("Failed to create PipeWire main loop", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| unavailable("Failed to create PipeWire context", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| unavailable("Failed to connect to PipeWire", e))?;

    // Quit the loop when the session releases the stream
    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        StreamCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    let is_capture = matches!(endpoint, Endpoint::Capture(_));
    let label = endpoint.label();

    struct UserData {
        endpoint: Endpoint,
        on_error: ErrorCallback,
        scratch: Vec<f32>,
    }

    let user_data = UserData {
        endpoint,
        on_error,
        scratch: Vec::new(),
    };

    let props = if is_capture {
        pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Production",
            *pw::keys::APP_NAME => "Loopstation",
        }
    } else {
        pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_CATEGORY => "Playback",
            *pw::keys::MEDIA_ROLE => "Production",
            *pw::keys::APP_NAME => "Loopstation",
        }
    };

    let stream = pw::stream::StreamBox::new(&core, label, props)
        .map_err(|e| unavailable("Failed to create PipeWire stream", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .state_changed(|_, user_data, _old, new| {
            if let pw::stream::StreamState::Error(message) = new {
                warn!("PipeWire stream error: {}", message);
                (user_data.on_error)(LoopError::DeviceUnavailable(message));
            }
        })
        .param_changed(|_, _user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };

            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            let mut negotiated = spa::param::audio::AudioInfoRaw::new();
            if negotiated.parse(param).is_ok() {
                debug!(
                    "PipeWire negotiated {}Hz x{}",
                    negotiated.rate(),
                    negotiated.channels()
                );
            }
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let channels = usize::from(STREAM_CHANNELS);
            let stride = SAMPLE_BYTES * channels;

            match &mut user_data.endpoint {
                Endpoint::Capture(on_data) => {
                    let n_bytes = data.chunk().size() as usize;
                    if let Some(raw) = data.data() {
                        let n_bytes = n_bytes.min(raw.len());
                        user_data.scratch.clear();
                        user_data.scratch.extend(
                            raw[..n_bytes]
                                .chunks_exact(SAMPLE_BYTES)
                                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                        );
                        on_data(&user_data.scratch);
                    }
                }
                Endpoint::Playback(on_fill) => {
                    let Some(slice) = data.data() else {
                        return;
                    };
                    let n_frames = slice.len() / stride;
                    user_data.scratch.clear();
                    user_data.scratch.resize(n_frames * channels, 0.0);
                    on_fill(&mut user_data.scratch);

                    for (bytes, sample) in slice
                        .chunks_exact_mut(SAMPLE_BYTES)
                        .zip(user_data.scratch.iter())
                    {
                        bytes.copy_from_slice(&sample.to_le_bytes());
                    }

                    let chunk = data.chunk_mut();
                    *chunk.offset_mut() = 0;
                    *chunk.stride_mut() = stride as i32;
                    *chunk.size_mut() = (n_frames * stride) as u32;
                }
            }
        })
        .register()
        .map_err(|e| unavailable("Failed to register stream listener", e))?;

    // Interleaved F32LE at a fixed layout; the adapter resamples for us
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(STREAM_RATE);
    audio_info.set_channels(u32::from(STREAM_CHANNELS));

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| unavailable("Failed to serialize audio format", e))?
    .0
    .into_inner();

    let pod = Pod::from_bytes(&values)
        .ok_or_else(|| LoopError::DeviceUnavailable("invalid audio format pod".to_string()))?;
    let mut params = [pod];

    let direction = if is_capture {
        spa::utils::Direction::Input
    } else {
        spa::utils::Direction::Output
    };

    stream
        .connect(
            direction,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| unavailable("Failed to connect stream", e))?;

    let _ = ready.send(Ok(StreamFormat::new(STREAM_RATE, STREAM_CHANNELS)));

    // Run until stopped
    mainloop.run();

    Ok(())
}
