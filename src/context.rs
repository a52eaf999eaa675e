//! Audio Context (§4.5): the live device handles a score's MIDI audio-type
//! accumulates while it is set up, and the single place that orders their
//! setup and teardown.

use std::sync::{Arc, Mutex};

use crate::channel::{allocate_channels, ChannelAssignment};
use crate::device_pool::DevicePool;
use crate::error::PlaybackError;
use crate::midi_io::{open_sequencer, Sequencer, Synthesizer};
use crate::score::Score;

/// Shared handle to a synthesizer. `Mutex` is for `Sync`, not mutation:
/// every [`Synthesizer`] method already takes `&self`, matching FluidLite's
/// own thread-safe-via-external-lock contract (the teacher's player makes
/// the same choice, wrapping its `Synth` in `Arc<Mutex<_>>`).
pub type SynthHandle = Arc<Mutex<Synthesizer>>;

/// A pool of pre-opened synthesizers sharing one SoundFont path.
pub fn synth_pool(soundfont_path: String) -> DevicePool<Mutex<Synthesizer>> {
    DevicePool::new(move || Synthesizer::open(&soundfont_path).map(Mutex::new))
}

/// A pool of pre-opened, unconnected output streams, wired to a particular
/// synthesizer only once [`AudioContext::set_up`] acquires one (§4.1: both
/// device kinds are pooled, not just the synth).
pub fn sequencer_pool() -> DevicePool<Sequencer> {
    DevicePool::new(open_sequencer)
}

/// The live MIDI device handles and derived state for one score's MIDI
/// audio-type (§4.5). `set_up` establishes them in order — synthesizer
/// before sequencer, since the sequencer's output stream is wired to read
/// from the synthesizer — and `tear_down` reverses it.
pub struct AudioContext {
    synth: Option<SynthHandle>,
    sequencer: Option<Arc<Sequencer>>,
    assignment: Option<ChannelAssignment>,
}

impl AudioContext {
    pub fn new() -> Self {
        Self { synth: None, sequencer: None, assignment: None }
    }

    pub fn channel_assignment(&self) -> Option<&ChannelAssignment> {
        self.assignment.as_ref()
    }

    pub fn synth(&self) -> Option<&SynthHandle> {
        self.synth.as_ref()
    }

    pub fn sequencer(&self) -> Option<&Sequencer> {
        self.sequencer.as_deref()
    }

    pub fn is_set_up(&self) -> bool {
        self.synth.is_some() && self.sequencer.is_some()
    }

    /// Acquire a synthesizer (from `synths`) and a sequencer (from
    /// `sequencers`), connect the sequencer to the synthesizer, then
    /// allocate channels for `score`. A sequencer is never acquired before
    /// its synthesizer: [`PlaybackError::SequencerBeforeSynth`] covers the
    /// case where a caller somehow reaches this with a sequencer but no
    /// synth, which a fresh or torn-down context cannot.
    pub fn set_up(
        &mut self,
        score: &Score,
        synths: &DevicePool<Mutex<Synthesizer>>,
        sequencers: &DevicePool<Sequencer>,
    ) -> Result<(), PlaybackError> {
        if self.sequencer.is_some() && self.synth.is_none() {
            return Err(PlaybackError::SequencerBeforeSynth);
        }

        if self.synth.is_none() {
            self.synth = Some(synths.acquire()?);
        }

        if self.sequencer.is_none() {
            let sequencer = sequencers.acquire()?;
            let synth = self.synth.as_ref().expect("synth set above");
            sequencer.connect(Arc::clone(synth));
            self.sequencer = Some(sequencer);
        }

        self.assignment = Some(allocate_channels(score)?);
        Ok(())
    }

    /// Directly install a channel assignment, bypassing device acquisition.
    /// Non-MIDI back-ends that don't need a live synthesizer/sequencer, and
    /// test doubles standing in for one, use this instead of [`Self::set_up`]
    /// (§9: tests inject a stub registry rather than opening real audio).
    pub fn set_assignment(&mut self, assignment: ChannelAssignment) {
        self.assignment = Some(assignment);
    }

    /// Close the sequencer then the synthesizer (§4.5 reverse order) and
    /// drop the channel assignment.
    pub fn tear_down(&mut self) {
        self.sequencer = None;
        self.synth = None;
        self.assignment = None;
    }
}

impl Default for AudioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_not_set_up() {
        let ctx = AudioContext::new();
        assert!(!ctx.is_set_up());
        assert!(ctx.channel_assignment().is_none());
    }

    #[test]
    fn tear_down_on_fresh_context_is_a_no_op() {
        let mut ctx = AudioContext::new();
        ctx.tear_down();
        assert!(!ctx.is_set_up());
    }
}
