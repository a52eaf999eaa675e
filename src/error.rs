//! The error taxonomy for the playback/export core.
//!
//! Channel allocation, tick conversion, and sequence building fail fast and
//! propagate. Dispatch-layer unknown audio types are logged and swallowed
//! instead (see [`crate::dispatch`]) — `UnknownAudioType` exists here so that
//! behavior is unit-testable, not so that callers see it bubble out of
//! `play`/`export`.

use std::fmt;

/// Errors surfaced by the playback and export core.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    /// More MIDI instruments were requested than channels are available
    /// once the percussion reservation is honored.
    #[error("out of MIDI channels: requested {requested}, {available} available")]
    OutOfChannels { requested: usize, available: usize },

    /// A tempo is too slow to encode as a 3-byte microseconds-per-quarter
    /// value (roughly below 3.58 BPM).
    #[error("tempo {bpm} BPM cannot be encoded in a 3-byte MIDI tempo event")]
    TempoOutOfRange { bpm: f64 },

    /// Dispatch was asked to operate on an audio-type tag with no
    /// registered implementation. The dispatcher itself logs and no-ops on
    /// this; it is returned from lower-level lookups for testability.
    #[error("no audio-type implementation registered for {0:?}")]
    UnknownAudioType(String),

    /// `set_up` attempted to wire a sequencer before a synthesizer was
    /// present in the audio context.
    #[error("sequencer setup requires a synthesizer already attached")]
    SequencerBeforeSynth,

    /// A `from`/`to` playback option referenced a marker not present in the
    /// score.
    #[error("marker not found: {0:?}")]
    MarkerNotFound(String),

    /// The underlying MIDI subsystem refused to produce a synthesizer or
    /// sequencer (e.g. no SoundFont, no default audio output device).
    #[error("MIDI device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Writing the Standard MIDI File failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A [`crate::tempo::Division::Smpte`] frame rate that doesn't
    /// correspond to a valid SMPTE timecode rate (24/25/29/30 fps).
    #[error("unsupported SMPTE frame rate: {0} fps")]
    UnsupportedDivision(u8),
}

impl PlaybackError {
    /// `true` for the subset of variants that the component design treats
    /// as fatal for the current score (everything except the dispatch-layer
    /// unknown-type case, which the dispatcher itself absorbs).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PlaybackError::UnknownAudioType(_))
    }
}

/// A marker or numeric offset, as accepted by the `from`/`to` playback
/// options (§6, Configuration options).
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackBound {
    Marker(String),
    OffsetMs(u64),
}

impl fmt::Display for PlaybackBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackBound::Marker(name) => write!(f, "marker {name:?}"),
            PlaybackBound::OffsetMs(ms) => write!(f, "{ms}ms"),
        }
    }
}
