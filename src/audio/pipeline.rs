//! Per-channel capture and playback sessions
//!
//! A capture session moves device buffers through a bounded queue to a
//! writer thread that converts them to the canonical format and appends them
//! to the channel file. A playback session runs a decoder thread that loops
//! the channel file, converts it to the device format and keeps a bounded
//! queue of blocks ahead of the output callback.
//!
//! Neither device callback blocks or touches the filesystem. Failures after
//! start are reported to the controller's supervisor as [`SessionFault`]s.

use super::backend::{AudioBackend, DeviceStream, ErrorCallback, InputCallback, OutputCallback};
use super::convert::FormatConverter;
use super::format::StreamFormat;
use super::looping::LoopingSource;
use super::recorder::{ChannelFiles, ChannelWriter};
use crate::error::{LoopError, Result};
use crate::models::{ChannelEvent, ChannelEventKind, ChannelState, LooperConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a blocked decoder rechecks its stop flag
const QUEUE_POLL: Duration = Duration::from_millis(20);

/// Warn about a full capture queue once per this many dropped buffers
const DROP_WARN_EVERY: usize = 50;

/// Identifies one session on one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTag {
    pub channel: usize,
    pub generation: u64,
}

/// Messages handled by the controller's supervisor thread
#[derive(Debug)]
pub enum SupervisorMessage {
    Fault(SessionFault),
    Shutdown,
}

/// A running session failed and must be released
#[derive(Debug, Clone)]
pub struct SessionFault {
    pub tag: SessionTag,
    pub error: LoopError,
}

/// Where sessions send faults and events
#[derive(Clone)]
pub struct Notifier {
    faults: Sender<SupervisorMessage>,
    events: Sender<ChannelEvent>,
}

impl Notifier {
    pub fn new(faults: Sender<SupervisorMessage>, events: Sender<ChannelEvent>) -> Self {
        Self { faults, events }
    }

    pub fn fault(&self, tag: SessionTag, error: LoopError) {
        warn!(
            "Channel {} session {} failed: {}",
            tag.channel, tag.generation, error
        );
        let _ = self
            .faults
            .send(SupervisorMessage::Fault(SessionFault { tag, error }));
    }

    /// Queue an event without blocking; dropped with a warning when nobody drains them
    pub fn event(&self, channel: usize, kind: ChannelEventKind) {
        self.send_event(ChannelEvent::new(channel, kind));
    }

    pub fn send_event(&self, event: ChannelEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => warn!(
                "Event queue full, dropping {:?} for channel {}",
                event.kind, event.channel
            ),
        }
    }

    fn error_callback(&self, tag: SessionTag) -> ErrorCallback {
        let notifier = self.clone();
        Box::new(move |error: LoopError| notifier.fault(tag, error))
    }
}

/// Queue sizes and timing for sessions
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub capture_queue: usize,
    pub playback_block_frames: usize,
    pub playback_queue: usize,
    pub flush_interval: Duration,
}

impl From<&LooperConfig> for PipelineOptions {
    fn from(config: &LooperConfig) -> Self {
        Self {
            capture_queue: config.capture_queue.max(1),
            playback_block_frames: config.playback_block_frames.max(1),
            playback_queue: config.playback_queue.max(1),
            flush_interval: config.flush_interval(),
        }
    }
}

/// Starts sessions for one channel
pub struct AudioPipeline {
    channel: usize,
    path: PathBuf,
    backend: Arc<dyn AudioBackend>,
    options: PipelineOptions,
    notifier: Notifier,
}

impl AudioPipeline {
    pub fn new(
        channel: usize,
        path: PathBuf,
        backend: Arc<dyn AudioBackend>,
        options: PipelineOptions,
        notifier: Notifier,
    ) -> Self {
        Self {
            channel,
            path,
            backend,
            options,
            notifier,
        }
    }

    /// Open the input device and start writing the channel file.
    ///
    /// The device is opened before the file is touched, so a channel whose
    /// device is missing keeps its previous recording.
    pub fn start_capture(&self, generation: u64) -> Result<ResourceHandle> {
        let tag = SessionTag {
            channel: self.channel,
            generation,
        };
        let (tx, rx) = bounded::<Vec<f32>>(self.options.capture_queue);
        let dropped = Arc::new(AtomicUsize::new(0));

        let dropped_in_callback = dropped.clone();
        let channel = self.channel;
        let on_data: InputCallback = Box::new(move |data: &[f32]| {
            if data.is_empty() {
                return;
            }
            match tx.try_send(data.to_vec()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let count = dropped_in_callback.fetch_add(1, Ordering::Relaxed) + 1;
                    if count % DROP_WARN_EVERY == 1 {
                        warn!(
                            "Channel {} capture queue full, {} buffers dropped",
                            channel, count
                        );
                    }
                }
                // Writer already gone; its fault is on the way
                Err(TrySendError::Disconnected(_)) => {}
            }
        });

        let device = self
            .backend
            .open_input(on_data, self.notifier.error_callback(tag))?;

        let writer = ChannelFiles::create_writer(&self.path)?;
        let converter = FormatConverter::new(device.format(), StreamFormat::canonical())?;
        let flush_interval = self.options.flush_interval;
        let notifier = self.notifier.clone();

        let worker = thread::Builder::new()
            .name(format!("record-{}", self.channel))
            .spawn(move || run_writer(tag, rx, converter, writer, flush_interval, notifier))
            .map_err(|e| LoopError::Io(format!("cannot start writer thread: {}", e)))?;

        info!(
            "Channel {} recording {}Hz x{} into {}",
            self.channel,
            device.format().sample_rate,
            device.format().channels,
            self.path.display()
        );

        Ok(ResourceHandle::Capture(CaptureSession {
            tag,
            device: Some(device),
            worker: Some(worker),
            dropped,
        }))
    }

    /// Open the channel file and the output device and start looping.
    ///
    /// The output plays silence until the handle is activated.
    pub fn start_playback(&self, generation: u64) -> Result<ResourceHandle> {
        let tag = SessionTag {
            channel: self.channel,
            generation,
        };
        let source = LoopingSource::open(&self.path)?;

        let (tx, rx) = bounded::<Vec<f32>>(self.options.playback_queue);
        let underruns = Arc::new(AtomicUsize::new(0));
        let mut feeder = BlockFeeder::new(rx, underruns.clone());
        let on_fill: OutputCallback = Box::new(move |out: &mut [f32]| feeder.fill(out));

        let device = self
            .backend
            .open_output(on_fill, self.notifier.error_callback(tag))?;

        let converter = FormatConverter::new(source.format(), device.format())?;
        let frames = source.frames();
        let stop = Arc::new(AtomicBool::new(false));
        let (start_tx, start_rx) = bounded::<()>(1);
        let decoder = Decoder {
            tag,
            source,
            converter,
            queue: tx,
            start: start_rx,
            stop: stop.clone(),
            block_frames: self.options.playback_block_frames,
            notifier: self.notifier.clone(),
        };

        let worker = thread::Builder::new()
            .name(format!("play-{}", self.channel))
            .spawn(move || decoder.run())
            .map_err(|e| LoopError::Io(format!("cannot start decoder thread: {}", e)))?;

        info!(
            "Channel {} looping {} ({} frames) to {}Hz x{}",
            self.channel,
            self.path.display(),
            frames,
            device.format().sample_rate,
            device.format().channels
        );

        Ok(ResourceHandle::Playback(PlaybackSession {
            tag,
            device: Some(device),
            worker: Some(worker),
            start: Some(start_tx),
            stop,
            underruns,
        }))
    }
}

/// What a channel currently holds open
pub enum ResourceHandle {
    Capture(CaptureSession),
    Playback(PlaybackSession),
}

impl ResourceHandle {
    pub fn state(&self) -> ChannelState {
        match self {
            ResourceHandle::Capture(_) => ChannelState::Recording,
            ResourceHandle::Playback(_) => ChannelState::Playing,
        }
    }

    pub fn tag(&self) -> SessionTag {
        match self {
            ResourceHandle::Capture(session) => session.tag,
            ResourceHandle::Playback(session) => session.tag,
        }
    }

    /// Let the session's worker run. Playback holds its decoder until then so
    /// no loop event can precede the announcement of the session.
    pub fn activate(&mut self) {
        if let ResourceHandle::Playback(session) = self {
            session.start.take();
        }
    }

    /// Stop the device, then wait for the worker thread. Safe to call repeatedly.
    ///
    /// Returns the error the worker ended with, such as a failed final write
    /// of the channel file. Only the first call reports it.
    pub fn release(&mut self) -> Result<()> {
        match self {
            ResourceHandle::Capture(session) => session.release(),
            ResourceHandle::Playback(session) => session.release(),
        }
    }
}

pub struct CaptureSession {
    tag: SessionTag,
    device: Option<DeviceStream>,
    worker: Option<JoinHandle<CaptureReport>>,
    dropped: Arc<AtomicUsize>,
}

impl CaptureSession {
    fn release(&mut self) -> Result<()> {
        // Stopping the device drops the queue sender, which lets the writer
        // drain what is left and finalize the file
        if let Some(mut device) = self.device.take() {
            device.stop();
        }
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let report = worker.join().map_err(|_| {
            error!("Channel {} writer thread panicked", self.tag.channel);
            LoopError::Io("writer thread panicked".to_string())
        })?;

        match &report.result {
            Ok(()) => info!(
                "Channel {} recorded {} frames ({:.2}s), {} buffers dropped",
                self.tag.channel,
                report.frames,
                StreamFormat::canonical().duration_seconds(report.frames),
                self.dropped.load(Ordering::Relaxed)
            ),
            Err(err) => error!(
                "Channel {} recording ended after {} frames: {}",
                self.tag.channel, report.frames, err
            ),
        }
        report.result
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

pub struct PlaybackSession {
    tag: SessionTag,
    device: Option<DeviceStream>,
    worker: Option<JoinHandle<PlaybackReport>>,
    /// Dropped to let the decoder start
    start: Option<Sender<()>>,
    stop: Arc<AtomicBool>,
    underruns: Arc<AtomicUsize>,
}

impl PlaybackSession {
    /// Output callbacks that ran short once playback was under way
    pub fn underruns(&self) -> usize {
        self.underruns.load(Ordering::Relaxed)
    }

    fn release(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.start.take();
        if let Some(mut device) = self.device.take() {
            device.stop();
        }
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let report = worker.join().map_err(|_| {
            error!("Channel {} decoder thread panicked", self.tag.channel);
            LoopError::Io("decoder thread panicked".to_string())
        })?;

        match &report.result {
            Ok(()) => info!(
                "Channel {} playback stopped after {} loops, {} underruns",
                self.tag.channel,
                report.cycles,
                self.underruns()
            ),
            Err(err) => error!(
                "Channel {} playback ended after {} loops: {}",
                self.tag.channel, report.cycles, err
            ),
        }
        report.result
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

struct CaptureReport {
    frames: u64,
    result: Result<()>,
}

struct PlaybackReport {
    cycles: u64,
    result: Result<()>,
}

/// Writer thread body: drain the capture queue into the channel file
fn run_writer(
    tag: SessionTag,
    queue: Receiver<Vec<f32>>,
    mut converter: FormatConverter,
    mut writer: ChannelWriter,
    flush_interval: Duration,
    notifier: Notifier,
) -> CaptureReport {
    let source = converter.source_format();
    debug!(
        "Channel {} writer converting {}Hz x{} to canonical",
        tag.channel, source.sample_rate, source.channels
    );
    let channels = usize::from(converter.target_format().channels);
    let mut converted = Vec::new();
    let mut frames = 0u64;
    let mut last_flush = Instant::now();

    let outcome = loop {
        converted.clear();
        let written = match queue.recv_timeout(flush_interval) {
            Ok(buffer) => converter
                .process(&buffer, &mut converted)
                .and_then(|()| write_samples(&mut writer, &converted)),
            Err(RecvTimeoutError::Timeout) => Ok(()),
            // Device stopped: write what the resampler still holds
            Err(RecvTimeoutError::Disconnected) => {
                let tail = converter
                    .finish(&mut converted)
                    .and_then(|()| write_samples(&mut writer, &converted));
                frames += (converted.len() / channels) as u64;
                break tail;
            }
        };
        if let Err(err) = written {
            break Err(err);
        }
        frames += (converted.len() / channels) as u64;

        // Keep the header current so the file is readable mid-recording
        if last_flush.elapsed() >= flush_interval {
            if let Err(e) = writer.flush() {
                break Err(LoopError::from_write(e));
            }
            last_flush = Instant::now();
        }
    };

    let finalized = writer.finalize().map_err(LoopError::from_write);
    let result = outcome.and(finalized);
    if let Err(err) = &result {
        notifier.fault(tag, err.clone());
    } else {
        debug!("Channel {} writer finished", tag.channel);
    }

    CaptureReport { frames, result }
}

fn write_samples(writer: &mut ChannelWriter, samples: &[f32]) -> Result<()> {
    for &sample in samples {
        writer
            .write_sample(super::format::f32_to_i16(sample))
            .map_err(LoopError::from_write)?;
    }
    Ok(())
}

/// Decoder thread state
struct Decoder {
    tag: SessionTag,
    source: LoopingSource,
    converter: FormatConverter,
    queue: Sender<Vec<f32>>,
    start: Receiver<()>,
    stop: Arc<AtomicBool>,
    block_frames: usize,
    notifier: Notifier,
}

impl Decoder {
    fn run(mut self) -> PlaybackReport {
        // Returns once the session is activated or released
        let _ = self.start.recv();

        let mut raw = Vec::new();
        let mut reported_cycles = 0u64;

        let result = 'decode: loop {
            if self.stop.load(Ordering::SeqCst) {
                break Ok(());
            }

            raw.clear();
            if let Err(err) = self.source.read_frames(self.block_frames, &mut raw) {
                break Err(err);
            }

            if self.source.cycles() > reported_cycles {
                reported_cycles = self.source.cycles();
                debug!("Channel {} loop {} complete", self.tag.channel, reported_cycles);
                self.notifier.event(
                    self.tag.channel,
                    ChannelEventKind::LoopCompleted {
                        cycles: reported_cycles,
                    },
                );
            }

            let mut block = Vec::with_capacity(raw.len());
            if let Err(err) = self.converter.process(&raw, &mut block) {
                break Err(err);
            }
            if block.is_empty() {
                continue;
            }

            // Wait for room without losing track of the stop flag
            let mut pending = block;
            loop {
                match self.queue.send_timeout(pending, QUEUE_POLL) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Timeout(block)) => {
                        if self.stop.load(Ordering::SeqCst) {
                            break 'decode Ok(());
                        }
                        pending = block;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => break 'decode Ok(()),
                }
            }
        };

        if let Err(err) = &result {
            self.notifier.fault(self.tag, err.clone());
        }

        PlaybackReport {
            cycles: self.source.cycles(),
            result,
        }
    }
}

/// Output-callback side of the playback queue
///
/// Copies queued blocks into device buffers and pads with silence when the
/// decoder falls behind. Never blocks.
struct BlockFeeder {
    queue: Receiver<Vec<f32>>,
    pending: Vec<f32>,
    offset: usize,
    started: bool,
    underruns: Arc<AtomicUsize>,
}

impl BlockFeeder {
    fn new(queue: Receiver<Vec<f32>>, underruns: Arc<AtomicUsize>) -> Self {
        Self {
            queue,
            pending: Vec::new(),
            offset: 0,
            started: false,
            underruns,
        }
    }

    /// Fill `out` and return how many leading samples are real audio
    fn fill(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            if self.offset >= self.pending.len() {
                match self.queue.try_recv() {
                    Ok(block) => {
                        self.pending = block;
                        self.offset = 0;
                        continue;
                    }
                    Err(_) => break,
                }
            }
            let n = (out.len() - written).min(self.pending.len() - self.offset);
            out[written..written + n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
            written += n;
            self.offset += n;
        }

        // Short callbacks count once playback has filled one completely
        if written < out.len() {
            out[written..].fill(0.0);
            if self.started {
                self.underruns.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.started = true;
        }
        written
    }
}
