//! Tempo Itinerary & Tick Converter (§4.3): builds a timeline of
//! tempo-change points and converts absolute millisecond offsets into
//! integer MIDI tick positions.

use std::collections::BTreeMap;

use crate::error::PlaybackError;
use crate::score::Score;

/// MIDI division mode. PPQ is the default; SMPTE is tempo-agnostic and kept
/// as the secondary path the spec's Open Questions call out (§9) — it is
/// not exercised by the default configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Division {
    /// Pulses (ticks) per quarter note.
    Ppq(u16),
    /// SMPTE: a fixed number of ticks per real-time frame.
    Smpte { frames_per_second: u8, ticks_per_frame: u8 },
}

impl Division {
    /// The crate's default resolution: 128 ticks per quarter note.
    pub const DEFAULT_PPQ: Division = Division::Ppq(128);

    fn resolution(&self) -> u16 {
        match self {
            Division::Ppq(r) => *r,
            Division::Smpte { ticks_per_frame, .. } => *ticks_per_frame as u16,
        }
    }
}

impl Default for Division {
    fn default() -> Self {
        Division::DEFAULT_PPQ
    }
}

/// One entry in a tempo itinerary: a tempo-change point and its cumulative
/// tick position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoPoint {
    pub ms: u64,
    pub bpm: f64,
    pub ticks: f64,
}

/// An immutable, ms-ascending timeline of tempo-change points for a given
/// score and [`Division`]. `ms = 0` is always the first entry.
#[derive(Debug, Clone)]
pub struct TempoItinerary {
    division: Division,
    points: Vec<TempoPoint>,
}

fn ms_per_tick(bpm: f64, resolution: u16) -> f64 {
    60_000.0 / (bpm * resolution as f64)
}

impl TempoItinerary {
    /// Build the itinerary by folding `score.tempo_values` (sorted by ms
    /// ascending) left-to-right: each entry's `ticks` is the previous
    /// entry's `ticks` plus the ticks elapsed since the previous entry, at
    /// the previous entry's tempo.
    pub fn build(score: &Score, division: Division) -> Result<Self, PlaybackError> {
        Self::build_from_values(&score.tempo_values, division)
    }

    /// As [`Self::build`], but over a bare offset-ms → BPM map rather than a
    /// whole [`Score`]. The Playback Controller uses this to build an
    /// itinerary re-based to a windowed playback start (§4.6): the map it
    /// passes has already been shifted and re-seeded at `ms = 0`.
    pub fn build_from_values(tempo_values: &BTreeMap<u64, f64>, division: Division) -> Result<Self, PlaybackError> {
        let mut sorted: Vec<(u64, f64)> = tempo_values.iter().map(|(&ms, &bpm)| (ms, bpm)).collect();
        sorted.sort_by_key(|(ms, _)| *ms);

        let mut points = Vec::with_capacity(sorted.len().max(1));
        if sorted.first().map(|(ms, _)| *ms) != Some(0) {
            // No explicit entry at 0: the contract (§3) requires one.
            // Synthesize one at the first known tempo (or the GM-standard
            // default of 120 BPM if the score supplied no tempo at all) so
            // construction doesn't fail outright, but log it — a well-formed
            // score should never hit this branch.
            let bpm = sorted.first().map(|(_, bpm)| *bpm).unwrap_or(120.0);
            log::warn!(
                "tempo map has no entry at ms = 0 (first entry at {:?}); synthesizing one at {bpm} BPM",
                sorted.first().map(|(ms, _)| *ms)
            );
            check_tempo_encodable(bpm)?;
            points.push(TempoPoint { ms: 0, bpm, ticks: 0.0 });
        }

        let resolution = division.resolution();
        for (ms, bpm) in sorted {
            check_tempo_encodable(bpm)?;
            match points.last().copied() {
                Some(prev) => {
                    let delta_ms = (ms - prev.ms) as f64;
                    let delta_ticks = delta_ms / ms_per_tick(prev.bpm, resolution);
                    points.push(TempoPoint {
                        ms,
                        bpm,
                        ticks: prev.ticks + delta_ticks,
                    });
                }
                None => points.push(TempoPoint { ms, bpm, ticks: 0.0 }),
            }
        }

        Ok(Self { division, points })
    }

    pub fn division(&self) -> Division {
        self.division
    }

    pub fn points(&self) -> &[TempoPoint] {
        &self.points
    }

    /// Convert an absolute millisecond offset to an integer tick position.
    pub fn ticks_at(&self, offset_ms: u64) -> i64 {
        match self.division {
            Division::Ppq(resolution) => ppq_ticks_at(&self.points, offset_ms, resolution),
            Division::Smpte { frames_per_second, ticks_per_frame } => {
                smpte_ticks_at(offset_ms, frames_per_second, ticks_per_frame)
            }
        }
    }
}

fn ppq_ticks_at(points: &[TempoPoint], offset_ms: u64, resolution: u16) -> i64 {
    if offset_ms == 0 || points.is_empty() {
        return 0;
    }
    // Last entry with ms <= offset_ms.
    let entry = points
        .iter()
        .rev()
        .find(|p| p.ms <= offset_ms)
        .copied()
        .unwrap_or(points[0]);
    let delta_ms = (offset_ms - entry.ms) as f64;
    let ticks = entry.ticks + delta_ms / ms_per_tick(entry.bpm, resolution);
    ticks.round() as i64
}

/// SMPTE division is tempo-agnostic: ticks scale linearly with wall-clock
/// time regardless of any tempo map (§4.3).
fn smpte_ticks_at(offset_ms: u64, frames_per_second: u8, ticks_per_frame: u8) -> i64 {
    let ticks_per_second = frames_per_second as f64 * ticks_per_frame as f64;
    ((offset_ms as f64 / 1000.0) * ticks_per_second).round() as i64
}

/// The largest encodable microseconds-per-quarter-note value is `2^24 - 1`
/// (three bytes). Tempos slower than ~3.58 BPM overflow it (§4.4, S5).
fn check_tempo_encodable(bpm: f64) -> Result<u32, PlaybackError> {
    let usq = 60_000_000.0 / bpm;
    if usq > ((1u32 << 24) - 1) as f64 {
        Err(PlaybackError::TempoOutOfRange { bpm })
    } else {
        Ok(usq.floor() as u32)
    }
}

/// Microseconds-per-quarter-note for a tempo, for use building a set-tempo
/// meta event. Returns [`PlaybackError::TempoOutOfRange`] for tempos that
/// can't be encoded in 3 bytes.
pub fn microseconds_per_quarter(bpm: f64) -> Result<u32, PlaybackError> {
    check_tempo_encodable(bpm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn score_with_tempos(entries: &[(u64, f64)]) -> Score {
        let mut score = Score::new();
        score.tempo_values = entries.iter().copied().collect::<BTreeMap<_, _>>();
        score
    }

    #[test]
    fn constant_tempo_matches_closed_form() {
        let score = score_with_tempos(&[(0, 120.0)]);
        let itinerary = TempoItinerary::build(&score, Division::Ppq(128)).unwrap();
        for ms in [0u64, 250, 500, 1000, 3333] {
            let expected = (ms as f64 * 120.0 * 128.0 / 60_000.0).round() as i64;
            assert_eq!(itinerary.ticks_at(ms), expected, "ms={ms}");
        }
    }

    #[test]
    fn ticks_at_is_monotone_and_nondecreasing() {
        let score = score_with_tempos(&[(0, 60.0), (1000, 120.0), (2500, 90.0)]);
        let itinerary = TempoItinerary::build(&score, Division::Ppq(128)).unwrap();
        let mut last = itinerary.ticks_at(0);
        for ms in (0..5000).step_by(37) {
            let t = itinerary.ticks_at(ms);
            assert!(t >= last, "ticks went backwards at ms={ms}");
            last = t;
        }
        let points = itinerary.points();
        for w in points.windows(2) {
            assert!(w[1].ticks >= w[0].ticks);
        }
    }

    #[test]
    fn s4_tempo_change_scenario() {
        let score = score_with_tempos(&[(0, 60.0), (1000, 120.0)]);
        let itinerary = TempoItinerary::build(&score, Division::Ppq(128)).unwrap();
        assert_eq!(itinerary.ticks_at(0), 0);
        assert_eq!(itinerary.ticks_at(1000), 128);
        assert_eq!(itinerary.ticks_at(1500), 256);
    }

    #[test]
    fn s5_slow_tempo_limit() {
        assert!(matches!(
            microseconds_per_quarter(3.0),
            Err(PlaybackError::TempoOutOfRange { .. })
        ));
        // 3.58 BPM or faster still encodes.
        assert!(microseconds_per_quarter(4.0).is_ok());
    }

    #[test]
    fn missing_zero_entry_is_synthesized() {
        let score = score_with_tempos(&[(500, 100.0)]);
        let itinerary = TempoItinerary::build(&score, Division::Ppq(128)).unwrap();
        assert_eq!(itinerary.points()[0].ms, 0);
    }
}
