//! Channel controller
//!
//! Owns one slot per channel. Every command locks only the slot it targets,
//! so channels start and stop independently while a channel never holds more
//! than one session. A supervisor thread releases sessions that fail after
//! they started and turns the failure into a [`ChannelEvent`].

use crate::audio::{
    AudioBackend, AudioPipeline, ChannelFiles, Notifier, PipelineOptions, ResourceHandle,
    SupervisorMessage,
};
use crate::error::{LoopError, Result};
use crate::models::{ChannelEvent, ChannelEventKind, ChannelState, ChannelStatus, LooperConfig};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Events buffered for a consumer that is not keeping up
const EVENT_QUEUE: usize = 256;

struct ChannelSlot {
    pipeline: AudioPipeline,
    handle: Option<ResourceHandle>,
    /// Bumped for every start, so faults from replaced sessions are ignored
    generation: u64,
}

impl ChannelSlot {
    fn state(&self) -> ChannelState {
        self.handle
            .as_ref()
            .map(ResourceHandle::state)
            .unwrap_or_default()
    }

    /// Release whatever is running and return what it was, with the error
    /// it ended on
    fn release(&mut self) -> (ChannelState, Result<()>) {
        match self.handle.take() {
            Some(mut handle) => {
                let state = handle.state();
                (state, handle.release())
            }
            None => (ChannelState::Idle, Ok(())),
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

type Slots = Arc<[Mutex<ChannelSlot>]>;

fn lock(slot: &Mutex<ChannelSlot>) -> MutexGuard<'_, ChannelSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ChannelController {
    slots: Slots,
    files: ChannelFiles,
    backend_name: String,
    notifier: Notifier,
    faults: Sender<SupervisorMessage>,
    events: Receiver<ChannelEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelController {
    /// Create the recordings directory and one idle slot per channel
    pub fn new(config: &LooperConfig, backend: Arc<dyn AudioBackend>) -> Result<Self> {
        let files = ChannelFiles::new(&config.recordings_dir);
        files.ensure_dir()?;

        let count = config.channels.max(1);
        let options = PipelineOptions::from(config);
        let (fault_tx, fault_rx) = unbounded();
        let (event_tx, event_rx) = bounded(EVENT_QUEUE);
        let notifier = Notifier::new(fault_tx.clone(), event_tx);

        let slots: Vec<Mutex<ChannelSlot>> = (0..count)
            .map(|channel| {
                Mutex::new(ChannelSlot {
                    pipeline: AudioPipeline::new(
                        channel,
                        files.channel_file(channel),
                        backend.clone(),
                        options,
                        notifier.clone(),
                    ),
                    handle: None,
                    generation: 0,
                })
            })
            .collect();
        let slots: Slots = Arc::from(slots);

        let supervisor_slots = slots.clone();
        let supervisor_notifier = notifier.clone();
        let supervisor = thread::Builder::new()
            .name("channel-supervisor".to_string())
            .spawn(move || supervise(supervisor_slots, fault_rx, supervisor_notifier))?;

        info!(
            "{} channels in {} on {}",
            count,
            files.recordings_dir().display(),
            backend.name()
        );

        Ok(Self {
            slots,
            files,
            backend_name: backend.name().to_string(),
            notifier,
            faults: fault_tx,
            events: event_rx,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.slots.len()
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Path of the file backing `channel`
    pub fn channel_file(&self, channel: usize) -> Result<PathBuf> {
        self.check(channel)?;
        Ok(self.files.channel_file(channel))
    }

    /// Receiver for channel notifications
    ///
    /// The queue holds the most recent backlog only; events are dropped with
    /// a warning while it is full.
    pub fn events(&self) -> Receiver<ChannelEvent> {
        self.events.clone()
    }

    fn check(&self, channel: usize) -> Result<()> {
        if channel < self.slots.len() {
            Ok(())
        } else {
            Err(LoopError::InvalidChannel {
                channel,
                count: self.slots.len(),
            })
        }
    }

    fn slot(&self, channel: usize) -> Result<MutexGuard<'_, ChannelSlot>> {
        self.check(channel)?;
        Ok(lock(&self.slots[channel]))
    }

    /// Replace whatever `channel` is doing with a fresh recording
    pub fn record(&self, channel: usize) -> Result<()> {
        self.start(channel, ChannelState::Recording)
    }

    /// Replace whatever `channel` is doing with looped playback of its file
    pub fn play(&self, channel: usize) -> Result<()> {
        self.start(channel, ChannelState::Playing)
    }

    fn start(&self, channel: usize, target: ChannelState) -> Result<()> {
        let mut slot = self.slot(channel)?;
        let (previous, released) = slot.release();
        // Events are sent while the slot is held so they arrive in command order
        let previous_failed = match released {
            Ok(()) => {
                if previous != ChannelState::Idle {
                    debug!("Channel {} released {:?} session", channel, previous);
                }
                false
            }
            Err(err) => {
                error!("Channel {} {:?} session ended badly: {}", channel, previous, err);
                self.notifier.send_event(ChannelEvent::failed(channel, &err));
                true
            }
        };

        let generation = slot.next_generation();
        let started = match target {
            ChannelState::Recording => slot.pipeline.start_capture(generation),
            _ => slot.pipeline.start_playback(generation),
        };

        match started {
            Ok(mut handle) => {
                let kind = match target {
                    ChannelState::Recording => ChannelEventKind::Recording,
                    _ => ChannelEventKind::Playing,
                };
                self.notifier.event(channel, kind);
                handle.activate();
                slot.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                warn!("Channel {} cannot start {:?}: {}", channel, target, err);
                if previous != ChannelState::Idle && !previous_failed {
                    self.notifier.event(channel, ChannelEventKind::Stopped);
                }
                Err(err)
            }
        }
    }

    /// Stop whatever `channel` is doing. Stopping an idle channel does nothing.
    ///
    /// Fails when the session could not finish cleanly, for example when the
    /// end of a recording could not be written. The channel is Idle either way.
    pub fn stop(&self, channel: usize) -> Result<()> {
        let mut slot = self.slot(channel)?;
        match slot.release() {
            (ChannelState::Idle, _) => Ok(()),
            (previous, Ok(())) => {
                info!("Channel {} stopped {:?}", channel, previous);
                self.notifier.event(channel, ChannelEventKind::Stopped);
                Ok(())
            }
            (previous, Err(err)) => {
                error!("Channel {} {:?} session ended badly: {}", channel, previous, err);
                self.notifier.send_event(ChannelEvent::failed(channel, &err));
                Err(err)
            }
        }
    }

    pub fn state(&self, channel: usize) -> Result<ChannelState> {
        Ok(self.slot(channel)?.state())
    }

    /// Snapshot of every channel
    pub fn status(&self) -> Vec<ChannelStatus> {
        (0..self.slots.len())
            .map(|channel| {
                let state = lock(&self.slots[channel]).state();
                let file = self.files.channel_file(channel);
                let info = ChannelFiles::inspect(&file).ok();
                ChannelStatus {
                    channel,
                    state,
                    recorded: info.is_some(),
                    duration_seconds: info.map(|i| i.duration_seconds()),
                    file,
                }
            })
            .collect()
    }

    /// Release every channel and stop the supervisor. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(supervisor) = supervisor else {
            return;
        };

        for (channel, slot) in self.slots.iter().enumerate() {
            match lock(slot).release() {
                (ChannelState::Idle, _) => {}
                (previous, Ok(())) => {
                    debug!("Channel {} released {:?} on shutdown", channel, previous);
                }
                (previous, Err(err)) => {
                    error!("Channel {} {:?} session ended badly: {}", channel, previous, err);
                    self.notifier.send_event(ChannelEvent::failed(channel, &err));
                }
            }
        }

        let _ = self.faults.send(SupervisorMessage::Shutdown);
        if supervisor.join().is_err() {
            error!("Channel supervisor panicked");
        }
        info!("All channels released");
    }
}

impl Drop for ChannelController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Release sessions that fail after they started
fn supervise(slots: Slots, faults: Receiver<SupervisorMessage>, notifier: Notifier) {
    for message in faults.iter() {
        let fault = match message {
            SupervisorMessage::Shutdown => break,
            SupervisorMessage::Fault(fault) => fault,
        };
        let Some(slot) = slots.get(fault.tag.channel) else {
            continue;
        };

        let mut slot = lock(slot);
        let current = slot.handle.as_ref().map(ResourceHandle::tag);
        if current != Some(fault.tag) {
            debug!(
                "Ignoring fault from finished session {} on channel {}: {}",
                fault.tag.generation, fault.tag.channel, fault.error
            );
            continue;
        }
        // The session's own error is the fault being handled here
        let _ = slot.release();
        error!("Channel {} stopped: {}", fault.tag.channel, fault.error);
        notifier.send_event(ChannelEvent::failed(fault.tag.channel, &fault.error));
    }
    debug!("Channel supervisor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::{VirtualBackend, VirtualInput};
    use crate::audio::format::{canonical_spec, i16_to_f32, StreamFormat};
    use crate::audio::recorder::tests::{scratch_dir, write_canonical};
    use crate::error::ErrorKind;
    use std::f32::consts::PI;
    use std::time::{Duration, Instant};

    fn config(label: &str) -> LooperConfig {
        LooperConfig {
            channels: 4,
            recordings_dir: scratch_dir(label),
            capture_queue: 4096,
            playback_block_frames: 64,
            playback_queue: 64,
            flush_interval_ms: 20,
            ..LooperConfig::default()
        }
    }

    fn controller(label: &str, backend: VirtualBackend) -> (ChannelController, Arc<VirtualBackend>) {
        let backend = Arc::new(backend);
        let controller = ChannelController::new(&config(label), backend.clone()).unwrap();
        (controller, backend)
    }

    fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn drain(events: &Receiver<ChannelEvent>) -> Vec<ChannelEventKind> {
        events.try_iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_invalid_channel_is_rejected() {
        let (controller, _backend) = controller("ctl-invalid", VirtualBackend::new());
        assert_eq!(controller.channel_count(), 4);
        assert_eq!(
            controller.record(4).err(),
            Some(LoopError::InvalidChannel {
                channel: 4,
                count: 4
            })
        );
        assert_eq!(controller.play(9).err().map(|e| e.kind()), Some(ErrorKind::InvalidChannel));
        assert!(controller.stop(4).is_err());
        assert!(controller.state(4).is_err());
        assert!(controller.channel_file(4).is_err());
    }

    #[test]
    fn test_play_without_recording_is_file_not_found() {
        let (controller, backend) = controller("ctl-missing", VirtualBackend::new());
        let err = controller.play(2).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
        assert_eq!(controller.state(2).unwrap(), ChannelState::Idle);
        assert_eq!(backend.open_streams(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (controller, backend) = controller(
            "ctl-stop",
            VirtualBackend::new().with_period(48, Duration::from_millis(1)),
        );
        let events = controller.events();

        controller.stop(0).unwrap();
        controller.record(0).unwrap();
        assert_eq!(controller.state(0).unwrap(), ChannelState::Recording);
        controller.stop(0).unwrap();
        controller.stop(0).unwrap();

        assert_eq!(controller.state(0).unwrap(), ChannelState::Idle);
        assert_eq!(backend.open_streams(), 0);
        assert_eq!(
            drain(&events),
            vec![ChannelEventKind::Recording, ChannelEventKind::Stopped]
        );
    }

    #[test]
    fn test_record_twice_keeps_one_session() {
        let (controller, backend) = controller(
            "ctl-record-twice",
            VirtualBackend::new().with_period(48, Duration::from_millis(1)),
        );
        controller.record(1).unwrap();
        controller.record(1).unwrap();
        assert_eq!(backend.open_streams(), 1);
        assert_eq!(controller.state(1).unwrap(), ChannelState::Recording);

        controller.stop(1).unwrap();
        assert_eq!(backend.open_streams(), 0);
        let info = ChannelFiles::inspect(&controller.channel_file(1).unwrap()).unwrap();
        assert_eq!(info.spec, canonical_spec());
    }

    #[test]
    fn test_tone_is_recorded_in_canonical_format() {
        // Two seconds of a 440Hz tone captured at 48kHz stereo
        let rate = 48_000usize;
        let script: Vec<f32> = (0..rate * 2)
            .flat_map(|i| {
                let v = (2.0 * PI * 440.0 * i as f32 / rate as f32).sin() * 0.5;
                [v, v]
            })
            .collect();
        let (controller, backend) = controller(
            "ctl-tone",
            VirtualBackend::new()
                .with_period(4_800, Duration::from_millis(1))
                .with_input(VirtualInput::Script(Arc::new(script))),
        );

        controller.record(0).unwrap();
        wait_for("script delivery", || backend.script_delivered());
        controller.stop(0).unwrap();

        let status = &controller.status()[0];
        assert!(status.recorded);
        let info = ChannelFiles::inspect(&status.file).unwrap();
        assert_eq!(info.spec.channels, 2);
        assert_eq!(info.spec.sample_rate, 8_000);
        assert_eq!(info.spec.bits_per_sample, 16);
        assert!((i64::from(info.frames) - 16_000).abs() <= 2, "frames = {}", info.frames);
        let duration = status.duration_seconds.unwrap();
        assert!((duration - 2.0).abs() < 0.01, "duration = {duration}");
    }

    #[test]
    fn test_recording_loops_back_exactly() {
        // Device runs at the canonical format, so nothing is resampled
        let pass: Vec<f32> = (0..400)
            .flat_map(|i| {
                let v = i16_to_f32((i as i16 + 1) * 50);
                [v, -v]
            })
            .collect();
        let (controller, backend) = controller(
            "ctl-roundtrip",
            VirtualBackend::new()
                .with_format(StreamFormat::canonical())
                .with_period(80, Duration::from_millis(1))
                .with_input(VirtualInput::Script(Arc::new(pass.clone())))
                .with_capture(),
        );
        let events = controller.events();

        controller.record(3).unwrap();
        wait_for("script delivery", || backend.script_delivered());
        controller.play(3).unwrap();
        assert_eq!(controller.state(3).unwrap(), ChannelState::Playing);
        assert_eq!(backend.open_streams(), 1);

        wait_for("three loops", || backend.captured().len() >= pass.len() * 3);
        controller.stop(3).unwrap();

        // Output is continuous from the first sample until stop
        let captured = backend.captured();
        let audible = captured.iter().position(|&s| s == 0.0).unwrap_or(captured.len());
        assert!(audible >= pass.len() * 3, "gap after {audible} samples");
        // Samples are unique within a pass, so the first one gives the phase
        let offset = pass.iter().position(|&s| s == captured[0]).unwrap();
        for (i, sample) in captured[..audible].iter().enumerate() {
            assert_eq!(*sample, pass[(offset + i) % pass.len()], "sample {i}");
        }

        // Nothing reaches the device after stop returns
        thread::sleep(Duration::from_millis(20));
        assert_eq!(backend.captured().len(), captured.len());

        let kinds = drain(&events);
        assert_eq!(kinds[0], ChannelEventKind::Recording);
        assert_eq!(kinds[1], ChannelEventKind::Playing);
        assert!(kinds.contains(&ChannelEventKind::LoopCompleted { cycles: 2 }));
        assert_eq!(kinds.last(), Some(&ChannelEventKind::Stopped));
    }

    #[test]
    fn test_playing_is_announced_before_loops() {
        let (controller, _backend) = controller(
            "ctl-event-order",
            VirtualBackend::new().with_period(48, Duration::from_millis(1)),
        );
        let events = controller.events();
        // Three frames wrap on the first decoded block
        write_canonical(&controller.channel_file(0).unwrap(), &[0.25; 6]);

        controller.play(0).unwrap();
        let first = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.kind, ChannelEventKind::Playing);
        let next = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(next.kind, ChannelEventKind::LoopCompleted { .. }));
        controller.stop(0).unwrap();
    }

    #[test]
    fn test_unread_events_do_not_pile_up() {
        let (controller, _backend) = controller(
            "ctl-event-backlog",
            VirtualBackend::new().with_period(48, Duration::from_millis(1)),
        );
        let events = controller.events();
        write_canonical(&controller.channel_file(0).unwrap(), &[0.25; 6]);

        // Every 64-frame block wraps the file many times over
        controller.play(0).unwrap();
        wait_for("a full event queue", || events.len() >= EVENT_QUEUE);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(events.len(), EVENT_QUEUE);
        controller.stop(0).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_failed_final_write_is_reported_by_stop() {
        let backend = Arc::new(VirtualBackend::new().with_period(48, Duration::from_millis(1)));
        let config = LooperConfig {
            flush_interval_ms: 60_000,
            ..config("ctl-full-on-stop")
        };
        let controller = ChannelController::new(&config, backend.clone()).unwrap();
        let events = controller.events();
        std::os::unix::fs::symlink("/dev/full", controller.channel_file(0).unwrap()).unwrap();

        controller.record(0).unwrap();
        thread::sleep(Duration::from_millis(30));
        let err = controller.stop(0).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert_eq!(controller.state(0).unwrap(), ChannelState::Idle);
        assert_eq!(backend.open_streams(), 0);

        let kinds = drain(&events);
        assert_eq!(kinds.len(), 2, "{kinds:?}");
        assert_eq!(kinds[0], ChannelEventKind::Recording);
        assert!(matches!(
            kinds[1],
            ChannelEventKind::Failed {
                kind: ErrorKind::IoFailure,
                ..
            }
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_write_failure_while_recording_idles_channel() {
        let (controller, backend) = controller(
            "ctl-full-while-recording",
            VirtualBackend::new().with_period(48, Duration::from_millis(1)),
        );
        let events = controller.events();
        std::os::unix::fs::symlink("/dev/full", controller.channel_file(1).unwrap()).unwrap();

        controller.record(1).unwrap();
        let failed = loop {
            let event = events
                .recv_timeout(Duration::from_secs(5))
                .expect("recording should fail");
            if let ChannelEventKind::Failed { kind, .. } = event.kind {
                break kind;
            }
        };
        assert_eq!(failed, ErrorKind::IoFailure);
        assert_eq!(controller.state(1).unwrap(), ChannelState::Idle);
        assert_eq!(backend.open_streams(), 0);

        // The channel takes commands again
        controller.stop(1).unwrap();
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn test_channels_run_independently() {
        let (controller, backend) = controller(
            "ctl-concurrent",
            VirtualBackend::new()
                .with_period(48, Duration::from_millis(1))
                .with_capture(),
        );
        write_canonical(&controller.channel_file(1).unwrap(), &[0.25; 400]);

        controller.record(0).unwrap();
        controller.play(1).unwrap();
        assert_eq!(controller.state(0).unwrap(), ChannelState::Recording);
        assert_eq!(controller.state(1).unwrap(), ChannelState::Playing);
        assert_eq!(backend.open_streams(), 2);

        wait_for("playback output", || !backend.captured().is_empty());
        controller.stop(1).unwrap();
        assert_eq!(controller.state(0).unwrap(), ChannelState::Recording);
        assert_eq!(backend.open_streams(), 1);
        controller.stop(0).unwrap();
        assert_eq!(backend.open_streams(), 0);
    }

    #[test]
    fn test_corrupt_file_fails_during_playback() {
        let (controller, backend) = controller(
            "ctl-corrupt",
            VirtualBackend::new().with_period(48, Duration::from_millis(1)),
        );
        let events = controller.events();
        let path = controller.channel_file(2).unwrap();
        write_canonical(&path, &vec![0.1; 4_000]);

        // Cut the data chunk short while the header still promises 2000 frames
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        controller.play(2).unwrap();
        let failed = loop {
            let event = events
                .recv_timeout(Duration::from_secs(5))
                .expect("playback should fail");
            if let ChannelEventKind::Failed { kind, .. } = event.kind {
                break kind;
            }
        };
        assert_eq!(failed, ErrorKind::DecodeError);
        assert_eq!(controller.state(2).unwrap(), ChannelState::Idle);
        assert_eq!(backend.open_streams(), 0);
    }

    #[test]
    fn test_unavailable_device_leaves_channel_idle() {
        let (controller, _backend) = controller("ctl-no-device", VirtualBackend::new().unavailable());
        let path = controller.channel_file(0).unwrap();
        write_canonical(&path, &[0.5; 100]);

        let err = controller.record(0).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
        assert_eq!(controller.state(0).unwrap(), ChannelState::Idle);
        assert_eq!(ChannelFiles::inspect(&path).unwrap().frames, 50);

        assert_eq!(controller.play(0).err().map(|e| e.kind()), Some(ErrorKind::DeviceUnavailable));
        assert_eq!(controller.state(0).unwrap(), ChannelState::Idle);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (controller, backend) = controller(
            "ctl-shutdown",
            VirtualBackend::new().with_period(48, Duration::from_millis(1)),
        );
        write_canonical(&controller.channel_file(1).unwrap(), &[0.25; 400]);
        controller.record(0).unwrap();
        controller.play(1).unwrap();

        controller.shutdown();
        controller.shutdown();
        assert_eq!(backend.open_streams(), 0);
        assert!(controller
            .status()
            .iter()
            .all(|s| s.state == ChannelState::Idle));
    }
}
