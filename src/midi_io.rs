//! Concrete device types held by the [`crate::device_pool::DevicePool`]:
//! [`Synthesizer`] (a FluidLite GM synth) and [`Sequencer`] (a CPAL output
//! stream plus a wall-clock scheduler thread that walks a [`Sequence`]).
//!
//! Grounded directly in the teacher's playback loop: SoundFont load and
//! synth configuration, the CPAL stream pulling `Synth::write`, and the
//! conductor thread sleeping against `Instant::now()` all come from there,
//! generalized from "play one fixed SMF" into "play an arbitrary, swappable
//! `Sequence`".

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use fluidlite::Settings;

use crate::dispatch::PlayingDevice;
use crate::error::PlaybackError;
use crate::sequence::{EventKind, Sequence};

/// A General MIDI software synthesizer. Slow to open (SoundFont load), so it
/// lives in a [`crate::device_pool::DevicePool`] rather than being created
/// per playback.
pub struct Synthesizer {
    inner: fluidlite::Synth,
}

impl Synthesizer {
    /// Open a synth and load `soundfont_path`, configured the way the
    /// teacher's player configures one: master gain, reverb, chorus.
    pub fn open(soundfont_path: &str) -> Result<Self, PlaybackError> {
        let settings = Settings::new()
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("fluidlite settings: {e}")))?;
        let synth = fluidlite::Synth::new(settings)
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("fluidlite synth: {e}")))?;
        synth
            .sfload(soundfont_path, true)
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("loading soundfont: {e}")))?;

        synth.set_gain(0.7);
        synth.set_reverb_on(true);
        synth.set_reverb_params(0.7, 0.2, 0.9, 0.5);
        synth.set_chorus_on(true);
        synth.set_chorus_params(3, 1.2, 0.25, 8.0, Default::default());

        Ok(Self { inner: synth })
    }

    pub fn set_sample_rate(&self, sample_rate: f32) {
        self.inner.set_sample_rate(sample_rate);
    }

    /// Dispatch one sequence event to the synth. Unrecognized channel/value
    /// combinations can't occur here: [`crate::sequence`] already clamped
    /// everything to MIDI's valid ranges.
    pub fn dispatch(&self, kind: EventKind) -> Result<(), PlaybackError> {
        let result = match kind {
            EventKind::NoteOn { channel, note, velocity } => {
                self.inner.note_on(channel as u32, note as u32, velocity as u32)
            }
            EventKind::NoteOff { channel, note, .. } => {
                self.inner.note_off(channel as u32, note as u32)
            }
            EventKind::ProgramChange { channel, program } => {
                self.inner.program_change(channel as u32, program as u32)
            }
            EventKind::ControlChange { channel, controller, value } => {
                self.inner.cc(channel as u32, controller as u32, value as u32)
            }
            // Tempo changes only move the scheduler's tick cursor; the synth
            // has no notion of tempo.
            EventKind::SetTempo { .. } => Ok(()),
        };
        result.map_err(|e| PlaybackError::DeviceUnavailable(format!("synth dispatch: {e}")))
    }

    /// MIDI "All Notes Off" (CC 123) on one channel.
    pub fn all_notes_off(&self, channel: u8) -> Result<(), PlaybackError> {
        self.inner
            .cc(channel as u32, 123, 0)
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("all notes off: {e}")))
    }

    /// MIDI "All Sound Off" (CC 120) on one channel.
    pub fn all_sound_off(&self, channel: u8) -> Result<(), PlaybackError> {
        self.inner
            .cc(channel as u32, 120, 0)
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("all sound off: {e}")))
    }

    pub fn write_f32(&self, buffer: &mut [f32]) -> Result<(), PlaybackError> {
        self.inner
            .write(buffer)
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("fluid write f32: {e}")))
    }

    pub fn write_i16(&self, buffer: &mut [i16]) -> Result<(), PlaybackError> {
        self.inner
            .write(buffer)
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("fluid write i16: {e}")))
    }
}

/// Stop every channel's notes, in parallel, and wait for all of them: the
/// dual all-notes-off/all-sound-off sweep the component design calls for
/// when playback is interrupted mid-score.
pub fn silence_all_channels(synth: &Synthesizer) {
    thread::scope(|scope| {
        for channel in 0u8..16 {
            scope.spawn(move || {
                if let Err(err) = synth.all_notes_off(channel) {
                    log::warn!("all notes off on channel {channel} failed: {err}");
                }
                if let Err(err) = synth.all_sound_off(channel) {
                    log::warn!("all sound off on channel {channel} failed: {err}");
                }
            });
        }
    });
}

/// A live audio output stream, opened against the host's default device.
/// Slow to open (device negotiation), so it lives in a device pool just like
/// [`Synthesizer`] — opened and started before any particular score knows it
/// will use it, then [`Self::connect`]ed to whichever synthesizer the audio
/// context has acquired (§4.5's "connect the sequencer's transmitter to the
/// synthesizer's receiver" wiring step).
pub struct Sequencer {
    stream: cpal::Stream,
    sample_rate: f32,
    route: Arc<Mutex<Option<Arc<Mutex<Synthesizer>>>>>,
}

// SAFETY-relevant note: cpal's `Stream` is not `Sync` on every backend, but
// this type is only ever shared behind the single-writer discipline the
// audio context enforces (§5) — one thread opens and plays it, after which
// it is read-only for the life of the process. We don't need `Sync` for
// that; `Send` (which `cpal::Stream` provides) is enough to hand the
// opened stream from the pool's background thread to the caller.

/// Open an output stream against the host's default device, with no
/// synthesizer wired in yet. The audio callback reads through
/// [`Sequencer::route`]'s slot and renders silence until [`Sequencer::connect`]
/// populates it — this is what lets the pool pre-warm sequencers without
/// knowing ahead of time which synthesizer they'll end up paired with.
pub fn open_sequencer() -> Result<Sequencer, PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlaybackError::DeviceUnavailable("no default audio output device".to_string()))?;
    let config = device
        .default_output_config()
        .map_err(|e| PlaybackError::DeviceUnavailable(format!("default output config: {e}")))?;

    let sample_rate = config.sample_rate().0 as f32;
    let route: Arc<Mutex<Option<Arc<Mutex<Synthesizer>>>>> = Arc::new(Mutex::new(None));

    let sample_format = config.sample_format();
    let stream_config = config.config();
    let err_fn = |err| log::error!("audio stream error: {err}");

    let stream = match sample_format {
        cpal::SampleFormat::I16 => {
            let route = Arc::clone(&route);
            device.build_output_stream(
                &stream_config,
                move |out: &mut [i16], _| match route.lock().unwrap().as_ref() {
                    Some(synth) => {
                        if let Err(err) = synth.lock().unwrap().write_i16(out) {
                            log::error!("{err}");
                        }
                    }
                    None => out.fill(0),
                },
                err_fn,
                None,
            )
        }
        _ => {
            let route = Arc::clone(&route);
            device.build_output_stream(
                &stream_config,
                move |out: &mut [f32], _| match route.lock().unwrap().as_ref() {
                    Some(synth) => {
                        if let Err(err) = synth.lock().unwrap().write_f32(out) {
                            log::error!("{err}");
                        }
                    }
                    None => out.fill(0.0),
                },
                err_fn,
                None,
            )
        }
    }
    .map_err(|e| PlaybackError::DeviceUnavailable(format!("build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| PlaybackError::DeviceUnavailable(format!("start output stream: {e}")))?;

    Ok(Sequencer { stream, sample_rate, route })
}

impl Sequencer {
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Wire this sequencer's audio callback to read from `synth`, closing
    /// any previous connection (§4.5: "close any pre-existing transmitters/
    /// receivers on both devices" before rewiring a reused default device).
    /// Resets the synth's sample rate and silences every channel first,
    /// since a pooled synth may carry state from a prior score.
    pub fn connect(&self, synth: Arc<Mutex<Synthesizer>>) {
        {
            let locked = synth.lock().unwrap();
            locked.set_sample_rate(self.sample_rate);
            for channel in 0..16 {
                let _ = locked.all_sound_off(channel);
            }
        }
        *self.route.lock().unwrap() = Some(synth);
    }

    /// Detach whatever synthesizer this sequencer is routed to; the audio
    /// callback renders silence until the next [`Self::connect`].
    pub fn disconnect(&self) {
        *self.route.lock().unwrap() = None;
    }

    pub fn pause(&self) -> Result<(), PlaybackError> {
        self.stream
            .pause()
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("pause stream: {e}")))
    }

    pub fn resume(&self) -> Result<(), PlaybackError> {
        self.stream
            .play()
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("resume stream: {e}")))
    }
}

/// A running playback: the scheduler thread walking `sequence` against
/// wall-clock time, plus the handles to stop it early or wait for it to
/// finish on its own.
pub struct PlaybackHandle {
    stop_tx: Sender<()>,
    completion_rx: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl PlaybackHandle {
    /// Signal the scheduler thread to stop dispatching further events.
    /// Already-sounding notes are not silenced here — callers that want
    /// that call [`silence_all_channels`] themselves (the dispatch layer
    /// does, on `stop_playback`).
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Block until the scheduler thread exits, either because it reached
    /// the end of the sequence or because [`Self::stop`] was called.
    pub fn wait(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Non-blocking check for whether playback has already finished.
    pub fn is_finished(&self) -> bool {
        self.completion_rx.try_recv().is_ok()
    }

    /// A clone of the completion signal, fulfilled once whether playback
    /// ran to the end of the sequence or was cut short by [`Self::stop`].
    /// `crossbeam_channel::Receiver` is cheaply `Clone`, which lets a
    /// background watcher (the Playback Controller's one-off/async teardown
    /// task, §4.6) observe completion without taking over the join handle.
    pub fn completion_receiver(&self) -> Receiver<()> {
        self.completion_rx.clone()
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.wait();
    }
}

impl PlayingDevice for PlaybackHandle {
    fn stop(&self) {
        PlaybackHandle::stop(self)
    }

    fn wait(&mut self) {
        PlaybackHandle::wait(self)
    }

    fn completion_receiver(&self) -> Receiver<()> {
        PlaybackHandle::completion_receiver(self)
    }
}

/// Start walking `sequence` against wall-clock time, dispatching each event
/// to `synth` as its tick comes due. One tick's worth of events all fire
/// together; the scheduler then sleeps briefly before checking again,
/// mirroring the teacher's 1ms conductor-thread poll.
pub fn play_sequence(sequence: Sequence, synth: Arc<Mutex<Synthesizer>>) -> PlaybackHandle {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let (completion_tx, completion_rx) = bounded::<()>(1);

    let join = thread::spawn(move || {
        let start = Instant::now();
        let mut index = 0usize;
        let events = sequence.events;

        while index < events.len() {
            if stop_rx.try_recv().is_ok() {
                // A stop cuts playback short, but it is still a completion:
                // the single-shot signal fires exactly once either way.
                let _ = completion_tx.send(());
                return;
            }
            let now_ms = start.elapsed().as_secs_f64() * 1000.0;
            while index < events.len() && events[index].at_ms <= now_ms {
                let synth = synth.lock().unwrap();
                if let Err(err) = synth.dispatch(events[index].kind) {
                    log::warn!("event dispatch failed: {err}");
                }
                index += 1;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _ = completion_tx.send(());
    });

    PlaybackHandle { stop_tx, completion_rx, join: Some(join) }
}
