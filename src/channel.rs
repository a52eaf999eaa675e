//! Channel Allocator (§4.2): assigns one of MIDI's 16 channels to each MIDI
//! instrument in a score, reserving channel 9 for percussion.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::PlaybackError;
use crate::score::Score;

/// The percussion channel, fixed by the General MIDI spec.
pub const PERCUSSION_CHANNEL: u8 = 9;

/// One instrument's resolved channel assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEntry {
    pub channel: u8,
    pub patch: Option<u8>,
    pub percussion: bool,
}

/// Instrument-id → channel assignment, for every MIDI instrument in a score.
#[derive(Debug, Clone, Default)]
pub struct ChannelAssignment(BTreeMap<String, ChannelEntry>);

impl ChannelAssignment {
    pub fn get(&self, instrument_id: &str) -> Option<&ChannelEntry> {
        self.0.get(instrument_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelEntry)> {
        self.0.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Assign channels to every MIDI instrument in `score`, in score iteration
/// order (§4.2). The smallest eligible channel wins each time, which makes
/// the assignment deterministic for a given instrument order.
///
/// Fails with [`PlaybackError::OutOfChannels`] once no channel satisfying an
/// instrument's percussion requirement remains.
pub fn allocate_channels(score: &Score) -> Result<ChannelAssignment, PlaybackError> {
    let mut available: BTreeSet<u8> = (0..16u8).collect();
    let mut assignment = BTreeMap::new();

    let instruments: Vec<_> = score.midi_instruments().collect();
    let requested = instruments.len();

    for (id, instrument) in instruments {
        let cfg = &instrument.config;
        let channel = if cfg.percussion {
            available
                .take(&PERCUSSION_CHANNEL)
                .ok_or(PlaybackError::OutOfChannels {
                    requested,
                    available: available.len(),
                })?
        } else {
            let candidate = available
                .iter()
                .find(|&&c| c != PERCUSSION_CHANNEL)
                .copied()
                .ok_or(PlaybackError::OutOfChannels {
                    requested,
                    available: available.len(),
                })?;
            available.remove(&candidate);
            candidate
        };

        assignment.insert(
            id.to_string(),
            ChannelEntry {
                channel,
                patch: cfg.patch,
                percussion: cfg.percussion,
            },
        );
    }

    Ok(ChannelAssignment(assignment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::{Instrument, InstrumentConfig};

    fn score_with(instruments: Vec<(&str, InstrumentConfig)>) -> Score {
        let mut score = Score::new();
        for (id, config) in instruments {
            score
                .instruments
                .insert(id.to_string(), Instrument { config });
        }
        score
    }

    #[test]
    fn percussion_gets_channel_nine_and_nothing_else_does() {
        let score = score_with(vec![
            ("perc", InstrumentConfig::midi(None, true)),
            ("piano", InstrumentConfig::midi(Some(1), false)),
        ]);
        let assignment = allocate_channels(&score).unwrap();
        assert_eq!(assignment.get("perc").unwrap().channel, 9);
        assert_eq!(assignment.get("piano").unwrap().channel, 0);
        for (id, entry) in assignment.iter() {
            assert_eq!(entry.channel == 9, id == "perc");
        }
    }

    #[test]
    fn every_instrument_gets_a_unique_channel() {
        let instruments: Vec<_> = (0..16)
            .map(|i| {
                let id: &'static str = Box::leak(format!("inst{i}").into_boxed_str());
                (id, InstrumentConfig::midi(Some(1), false))
            })
            .collect();
        let score = score_with(instruments);
        let assignment = allocate_channels(&score).unwrap();
        let mut channels: Vec<u8> = assignment.iter().map(|(_, e)| e.channel).collect();
        channels.sort();
        channels.dedup();
        assert_eq!(channels.len(), 15);
        assert!(!channels.contains(&PERCUSSION_CHANNEL));
    }

    #[test]
    fn seventeen_non_percussion_instruments_exhaust_channels() {
        let instruments: Vec<_> = (0..17)
            .map(|i| {
                let id: &'static str = Box::leak(format!("inst{i}").into_boxed_str());
                (id, InstrumentConfig::midi(Some(1), false))
            })
            .collect();
        let score = score_with(instruments);
        let err = allocate_channels(&score).unwrap_err();
        assert!(matches!(err, PlaybackError::OutOfChannels { .. }));
    }

    #[test]
    fn tie_break_is_smallest_channel_first() {
        let score = score_with(vec![
            ("a", InstrumentConfig::midi(Some(1), false)),
            ("b", InstrumentConfig::midi(Some(2), false)),
        ]);
        let assignment = allocate_channels(&score).unwrap();
        assert_eq!(assignment.get("a").unwrap().channel, 0);
        assert_eq!(assignment.get("b").unwrap().channel, 1);
    }
}
