//! Audio-Type Dispatch (§4.7): routes the three lifecycle operations
//! (`set_up`, `tear_down`, `stop_playback`) to whichever back-end an
//! instrument's `audio_type` tag names. MIDI is the only built-in
//! implementation; unknown tags are logged and skipped rather than failing
//! the whole score (§7).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::context::AudioContext;
use crate::device_pool::DevicePool;
use crate::error::PlaybackError;
use crate::midi_io::{silence_all_channels, Sequencer, Synthesizer};
use crate::score::{Score, AUDIO_TYPE_MIDI};
use crate::sequence::Sequence;

/// A running playback started by [`AudioTypeDispatch::play_sequence`]: the
/// minimal surface the Playback Controller needs to stop or await one,
/// without caring whether it's wired to real audio hardware or a stub
/// (§9: tests inject a stub registry rather than opening real audio).
pub trait PlayingDevice: Send {
    fn stop(&self);
    fn wait(&mut self);
    fn completion_receiver(&self) -> crossbeam_channel::Receiver<()>;
}

/// One audio back-end's lifecycle hooks. Implementors own whatever live
/// device state their back-end needs; the dispatcher only ever calls these
/// three methods, in this order, across a score's lifetime, plus
/// `play_sequence` when the Playback Controller's `play` is driving this
/// audio type in real time.
pub trait AudioTypeDispatch: Send + Sync {
    fn set_up(&self, score: &Score, context: &mut AudioContext) -> Result<(), PlaybackError>;
    fn tear_down(&self, context: &mut AudioContext);
    fn stop_playback(&self, context: &AudioContext);
    fn play_sequence(&self, context: &AudioContext, sequence: Sequence) -> Result<Box<dyn PlayingDevice>, PlaybackError>;
}

/// The built-in MIDI back-end: a [`Synthesizer`] and [`Sequencer`] wired
/// through an [`AudioContext`], each pooled independently (§4.1 — pooling
/// hides both devices' "hundreds of ms" open cost, not just the synth's).
pub struct MidiDispatch {
    synths: DevicePool<Mutex<Synthesizer>>,
    sequencers: DevicePool<Sequencer>,
}

impl MidiDispatch {
    pub fn new(soundfont_path: String) -> Self {
        Self {
            synths: crate::context::synth_pool(soundfont_path),
            sequencers: crate::context::sequencer_pool(),
        }
    }
}

impl AudioTypeDispatch for MidiDispatch {
    fn set_up(&self, score: &Score, context: &mut AudioContext) -> Result<(), PlaybackError> {
        context.set_up(score, &self.synths, &self.sequencers)
    }

    fn tear_down(&self, context: &mut AudioContext) {
        context.tear_down();
    }

    /// Stop the sequencer, then sweep all-notes-off/all-sound-off on the
    /// synthesizer (§4.5: "this dual-call is load-bearing: some
    /// synthesizers honor one but not the other").
    fn stop_playback(&self, context: &AudioContext) {
        if let Some(sequencer) = context.sequencer() {
            if let Err(err) = sequencer.pause() {
                log::warn!("pausing sequencer on stop: {err}");
            }
        }
        if let Some(synth) = context.synth() {
            let synth = synth.lock().unwrap();
            silence_all_channels(&synth);
        }
    }

    /// Resume the sequencer's output stream before starting the scheduler
    /// thread: a context reused after `stop_playback` (vs. `tear_down`) has
    /// its stream paused (§4.5), and a fresh one from the pool is already
    /// playing — resuming either way is harmless.
    fn play_sequence(&self, context: &AudioContext, sequence: Sequence) -> Result<Box<dyn PlayingDevice>, PlaybackError> {
        let synth = context
            .synth()
            .cloned()
            .ok_or_else(|| PlaybackError::DeviceUnavailable("no synthesizer attached".to_string()))?;
        if let Some(sequencer) = context.sequencer() {
            if let Err(err) = sequencer.resume() {
                log::warn!("resuming sequencer before play: {err}");
            }
        }
        Ok(Box::new(crate::midi_io::play_sequence(sequence, synth)))
    }
}

/// Maps audio-type tags to their dispatch implementation. Built-in MIDI is
/// registered under [`AUDIO_TYPE_MIDI`]; embedders add others via
/// [`Self::register`].
pub struct DispatchRegistry {
    implementations: HashMap<String, Box<dyn AudioTypeDispatch>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self { implementations: HashMap::new() }
    }

    pub fn with_midi(soundfont_path: String) -> Self {
        let mut registry = Self::new();
        registry.register(AUDIO_TYPE_MIDI, MidiDispatch::new(soundfont_path));
        registry
    }

    pub fn register(&mut self, audio_type: &str, implementation: impl AudioTypeDispatch + 'static) {
        self.implementations.insert(audio_type.to_string(), Box::new(implementation));
    }

    pub fn get(&self, audio_type: &str) -> Option<&dyn AudioTypeDispatch> {
        self.implementations.get(audio_type).map(|b| b.as_ref())
    }

    /// Run `f` for every audio type `score` uses that has a registered
    /// implementation. Unregistered types are logged at `error!` and
    /// skipped — they never fail the call (§7).
    pub fn for_each_registered<'a>(
        &'a self,
        score: &Score,
        mut f: impl FnMut(&'a dyn AudioTypeDispatch),
    ) {
        for audio_type in score.audio_types() {
            match self.get(&audio_type) {
                Some(implementation) => f(implementation),
                None => log::error!("no audio-type implementation registered for {audio_type:?}"),
            }
        }
    }

    /// Like [`Self::for_each_registered`], but stops and propagates on the
    /// first registered implementation's failure. Used where a registered
    /// back-end's own error (e.g. `DeviceUnavailable`) is fatal, unlike an
    /// unregistered tag, which is never an error.
    pub fn try_for_each_registered<'a>(
        &'a self,
        score: &Score,
        mut f: impl FnMut(&'a dyn AudioTypeDispatch) -> Result<(), crate::error::PlaybackError>,
    ) -> Result<(), crate::error::PlaybackError> {
        for audio_type in score.audio_types() {
            match self.get(&audio_type) {
                Some(implementation) => f(implementation)?,
                None => log::error!("no audio-type implementation registered for {audio_type:?}"),
            }
        }
        Ok(())
    }
}

impl Default for DispatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingDispatch {
        set_up_calls: Arc<AtomicUsize>,
    }

    impl AudioTypeDispatch for CountingDispatch {
        fn set_up(&self, _score: &Score, _context: &mut AudioContext) -> Result<(), crate::error::PlaybackError> {
            self.set_up_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn tear_down(&self, _context: &mut AudioContext) {}
        fn stop_playback(&self, _context: &AudioContext) {}
        fn play_sequence(
            &self,
            _context: &AudioContext,
            _sequence: crate::sequence::Sequence,
        ) -> Result<Box<dyn PlayingDevice>, crate::error::PlaybackError> {
            Err(crate::error::PlaybackError::DeviceUnavailable("CountingDispatch cannot play".to_string()))
        }
    }

    #[test]
    fn unregistered_audio_type_is_skipped_not_errored() {
        let mut score = Score::new();
        score.instruments.insert(
            "synth-pad".to_string(),
            crate::score::Instrument {
                config: crate::score::InstrumentConfig {
                    audio_type: "wavetable".to_string(),
                    patch: None,
                    percussion: false,
                },
            },
        );
        let registry = DispatchRegistry::new();
        let mut calls = 0;
        registry.for_each_registered(&score, |_| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn registered_audio_type_is_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = DispatchRegistry::new();
        registry.register("midi", CountingDispatch { set_up_calls: Arc::clone(&calls) });

        let mut score = Score::new();
        score.instruments.insert(
            "lead".to_string(),
            crate::score::Instrument { config: crate::score::InstrumentConfig::midi(Some(1), false) },
        );

        let mut context = AudioContext::new();
        registry.for_each_registered(&score, |impl_| {
            let _ = impl_.set_up(&score, &mut context);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
