//! `scoreplay`: the playback and Standard MIDI File export core for a
//! realized score (§1 of the design spec). Given a [`Score`] — instruments,
//! a tempo map, timed note events, and named markers — produced by an
//! external parser, this crate:
//!
//! - assigns a bounded pool of MIDI channels to the score's instruments,
//!   reserving channel 9 for percussion ([`channel`]);
//! - builds a tempo itinerary and converts absolute millisecond offsets to
//!   integer MIDI tick positions under a time-varying tempo ([`tempo`]);
//! - materializes note-on/off, program-change, control-change, and
//!   set-tempo events into a single ordered MIDI track ([`sequence`]);
//! - manages the lifecycle of pooled synthesizer/sequencer devices
//!   ([`device_pool`], [`midi_io`]) wired together by a mutable audio
//!   context ([`context`]);
//! - and exposes `play`/`export`/`stop_playback`/`tear_down`/`set_up` over
//!   that machinery, with `audio_type`-tagged dispatch so non-MIDI
//!   back-ends can be registered without touching the controller
//!   ([`dispatch`], [`controller`]).
//!
//! No logger is installed by this crate; it emits [`log`] records at the
//! seams described in each module and leaves subscriber setup to the
//! embedding application.

pub mod channel;
pub mod context;
pub mod controller;
pub mod device_pool;
pub mod dispatch;
pub mod error;
pub mod midi_io;
pub mod score;
pub mod sequence;
pub mod tempo;

pub use channel::{ChannelAssignment, ChannelEntry};
pub use controller::{Completion, Controller, PlaybackOptions, PlaybackSession, PlayHandle};
pub use dispatch::{AudioTypeDispatch, DispatchRegistry, MidiDispatch};
pub use error::{PlaybackBound, PlaybackError};
pub use score::{Instrument, InstrumentConfig, InstrumentTable, NoteEvent, Score, AUDIO_TYPE_MIDI};
pub use sequence::{EventKind, Sequence, TimedEvent};
pub use tempo::{Division, TempoItinerary, TempoPoint};
