//! Sequence Builder (§4.4): materializes a filtered, offset-shifted event
//! list into a single ordered MIDI track plus a set-tempo/program-change
//! preamble, ready either to hand to a live [`crate::midi_io::Sequencer`] or
//! to serialize as a Standard MIDI File.

use std::collections::BTreeSet;

use crate::channel::ChannelAssignment;
use crate::error::PlaybackError;
use crate::score::NoteEvent;
use crate::tempo::{microseconds_per_quarter, Division, TempoItinerary};

/// One MIDI channel-voice or meta event, positioned both on the tick
/// timeline (what gets written to the track / handed to the sequencer's
/// tick cursor) and on the wall-clock timeline (what the live scheduler
/// actually sleeps against — see [`crate::midi_io::Sequencer`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedEvent {
    pub tick: i64,
    pub at_ms: f64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    ProgramChange { channel: u8, program: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    SetTempo { microseconds_per_quarter: u32 },
}

impl EventKind {
    /// Ordering group for same-tick ties (§5: program-change/set-tempo
    /// first, then controller changes, then note-on; note-offs occur at
    /// their own tick but are sorted last among same-tick siblings for
    /// determinism).
    fn tie_break_priority(&self) -> u8 {
        match self {
            EventKind::ProgramChange { .. } | EventKind::SetTempo { .. } => 0,
            EventKind::ControlChange { .. } => 1,
            EventKind::NoteOn { .. } => 2,
            EventKind::NoteOff { .. } => 3,
        }
    }
}

/// A fully populated single-track MIDI sequence.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub division: Division,
    pub events: Vec<TimedEvent>,
}

fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn to_midi_byte(unit_value: f64) -> u8 {
    (clamp_unit(unit_value) * 127.0).round() as u8
}

/// Build the sequence for a filtered, offset-shifted event list (§4.6
/// produces this input by windowing and shifting the score's raw events).
pub fn build_sequence(
    events: &[NoteEvent],
    assignment: &ChannelAssignment,
    itinerary: &TempoItinerary,
) -> Result<Sequence, PlaybackError> {
    let mut timed = Vec::new();

    // Step 2: one program-change at tick 0 per unique (channel, patch).
    let mut seen_programs = BTreeSet::new();
    for (_, entry) in assignment.iter() {
        if let Some(patch) = entry.patch {
            if seen_programs.insert((entry.channel, patch)) {
                timed.push(TimedEvent {
                    tick: 0,
                    at_ms: 0.0,
                    kind: EventKind::ProgramChange {
                        channel: entry.channel,
                        program: patch - 1,
                    },
                });
            }
        }
    }

    // Step 3: a set-tempo meta event per itinerary entry.
    for point in itinerary.points() {
        let usq = microseconds_per_quarter(point.bpm)?;
        timed.push(TimedEvent {
            tick: point.ticks.round() as i64,
            at_ms: point.ms as f64,
            kind: EventKind::SetTempo { microseconds_per_quarter: usq },
        });
    }

    // Step 4: per-note control-changes, note-on, note-off. Events carrying
    // a `function` marker are score-side callbacks, elided from MIDI output.
    for event in events {
        if event.function.is_some() {
            continue;
        }
        let Some(entry) = assignment.get(&event.instrument_id) else {
            continue;
        };
        let channel = entry.channel;
        let on_ms = event.offset_ms.max(0) as u64;
        let off_ms = on_ms + event.duration_ms;
        let on_tick = itinerary.ticks_at(on_ms);
        let off_tick = itinerary.ticks_at(off_ms);

        timed.push(TimedEvent {
            tick: on_tick,
            at_ms: on_ms as f64,
            kind: EventKind::ControlChange {
                channel,
                controller: 7,
                value: to_midi_byte(event.track_volume),
            },
        });
        timed.push(TimedEvent {
            tick: on_tick,
            at_ms: on_ms as f64,
            kind: EventKind::ControlChange {
                channel,
                controller: 10,
                value: to_midi_byte(event.panning),
            },
        });
        let velocity = to_midi_byte(event.volume);
        timed.push(TimedEvent {
            tick: on_tick,
            at_ms: on_ms as f64,
            kind: EventKind::NoteOn { channel, note: event.midi_note, velocity },
        });
        timed.push(TimedEvent {
            tick: off_tick,
            at_ms: off_ms as f64,
            kind: EventKind::NoteOff { channel, note: event.midi_note, velocity },
        });
    }

    timed.sort_by_key(|e| (e.tick, e.kind.tie_break_priority()));

    Ok(Sequence { division: itinerary.division(), events: timed })
}

/// Serialize a sequence to Standard MIDI File bytes: Type-0, single track,
/// with a trailing end-of-track meta event (§6). The header's division is
/// `Timing::Metrical` for [`Division::Ppq`] or `Timing::Timecode` for
/// [`Division::Smpte`] — whichever the sequence was built under.
pub fn write_smf(sequence: &Sequence) -> Result<Vec<u8>, PlaybackError> {
    use midly::{
        num::{u24, u28, u4, u7},
        Fps, Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    };

    let mut track = Track::new();
    let mut last_tick: i64 = 0;
    for event in &sequence.events {
        let delta = (event.tick - last_tick).max(0) as u32;
        last_tick = event.tick.max(last_tick);
        let kind = match event.kind {
            EventKind::ProgramChange { channel, program } => TrackEventKind::Midi {
                channel: u4::new(channel),
                message: MidiMessage::ProgramChange { program: u7::new(program) },
            },
            EventKind::ControlChange { channel, controller, value } => TrackEventKind::Midi {
                channel: u4::new(channel),
                message: MidiMessage::Controller {
                    controller: u7::new(controller),
                    value: u7::new(value),
                },
            },
            EventKind::NoteOn { channel, note, velocity } => TrackEventKind::Midi {
                channel: u4::new(channel),
                message: MidiMessage::NoteOn { key: u7::new(note), vel: u7::new(velocity) },
            },
            EventKind::NoteOff { channel, note, velocity } => TrackEventKind::Midi {
                channel: u4::new(channel),
                message: MidiMessage::NoteOff { key: u7::new(note), vel: u7::new(velocity) },
            },
            EventKind::SetTempo { microseconds_per_quarter } => {
                TrackEventKind::Meta(MetaMessage::Tempo(u24::new(microseconds_per_quarter)))
            }
        };
        track.push(TrackEvent { delta: u28::new(delta), kind });
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let timing = match sequence.division {
        Division::Ppq(resolution) => Timing::Metrical(resolution.into()),
        Division::Smpte { frames_per_second, ticks_per_frame } => {
            let fps = Fps::from_int(frames_per_second).ok_or(PlaybackError::UnsupportedDivision(frames_per_second))?;
            Timing::Timecode(fps, ticks_per_frame)
        }
    };

    let smf = Smf {
        header: Header::new(Format::SingleTrack, timing),
        tracks: vec![track],
    };

    let mut buf = Vec::new();
    smf.write_std(&mut buf)?;
    Ok(buf)
}
