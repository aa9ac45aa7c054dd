//! Signal analysis: loudness, onset detection, tempo and beat tracking, and
//! spectral decomposition with chord inference.
//!
//! Every analyser here is synchronous and owns its scratch state; the
//! [`pipeline`](crate::pipeline) module runs them on separate threads and
//! merges their results into a shared [`AudioState`].

pub mod beat;
pub mod filter;
pub mod loudness;
pub mod onset;
pub mod spectral;
pub mod tempo;

use serde::Serialize;

pub use beat::{BeatConfirmer, BeatOutcome, BeatTracker};
pub use filter::{BandPass, Biquad};
pub use loudness::{rms_i16, LoudnessEstimator, LoudnessReading, MAX_AMPLITUDE};
pub use onset::{onset_strength, peak_pick, Stft};
pub use spectral::{BandAssignment, SpectralAnalysis, SpectralDecomposer};
pub use tempo::{publish_bpm, TempoEstimator};

/// Consolidated snapshot of everything the analysis tasks publish.
///
/// Each field group has exactly one writer: loudness owns `rms`/`db`, tempo
/// owns `bpm`, beat-phase owns `beat_on_off`, spectral owns `freqs`/`chord`.
/// A snapshot may therefore mix results of different ages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AudioState {
    pub rms: f32,
    pub db: f32,
    /// Latest stable tempo, 0 while unknown.
    pub bpm: u32,
    pub beat_on_off: bool,
    /// Three most prominent pitch classes, ascending.
    pub freqs: [u8; 3],
    pub chord: ChordQuality,
}

impl Default for AudioState {
    fn default() -> Self {
        Self {
            rms: 0.0,
            db: f32::NEG_INFINITY,
            bpm: 0,
            beat_on_off: false,
            freqs: [0; 3],
            chord: ChordQuality::Unknown,
        }
    }
}

/// Triad quality inferred from three pitch classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChordQuality {
    #[default]
    Unknown,
    Major,
    Minor,
    Diminished,
    Sus2,
    Sus4,
    Augmented,
    MajorFlat5,
    Sus2Sharp5,
    Quartal,
}

impl ChordQuality {
    /// Interval patterns in code order, root first.
    const PATTERNS: [(ChordQuality, [u8; 3]); 9] = [
        (ChordQuality::Major, [0, 4, 7]),
        (ChordQuality::Minor, [0, 3, 7]),
        (ChordQuality::Diminished, [0, 3, 6]),
        (ChordQuality::Sus2, [0, 2, 7]),
        (ChordQuality::Sus4, [0, 5, 7]),
        (ChordQuality::Augmented, [0, 4, 8]),
        (ChordQuality::MajorFlat5, [0, 4, 6]),
        (ChordQuality::Sus2Sharp5, [0, 2, 8]),
        (ChordQuality::Quartal, [0, 5, 10]),
    ];

    /// Numeric chord code, 0 for unknown.
    pub fn code(self) -> u8 {
        match self {
            ChordQuality::Unknown => 0,
            ChordQuality::Major => 1,
            ChordQuality::Minor => 2,
            ChordQuality::Diminished => 3,
            ChordQuality::Sus2 => 4,
            ChordQuality::Sus4 => 5,
            ChordQuality::Augmented => 6,
            ChordQuality::MajorFlat5 => 7,
            ChordQuality::Sus2Sharp5 => 8,
            ChordQuality::Quartal => 9,
        }
    }

    /// Classifies three pitch classes. The lowest class is taken as the root
    /// and the other two are measured as intervals above it.
    pub fn from_pitch_classes(classes: [u8; 3]) -> Self {
        let mut sorted = classes;
        sorted.sort_unstable();
        let root = sorted[0];
        let mut intervals = sorted.map(|class| (class + 12 - root) % 12);
        intervals.sort_unstable();

        Self::PATTERNS
            .iter()
            .find(|(_, pattern)| *pattern == intervals)
            .map(|(quality, _)| *quality)
            .unwrap_or(ChordQuality::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_intervals_from_every_root() {
        // The lowest class is the root, so the triad must fit above it.
        for root in 0..5u8 {
            assert_eq!(
                ChordQuality::from_pitch_classes([root, root + 4, root + 7]),
                ChordQuality::Major,
                "root {root}"
            );
        }
    }

    #[test]
    fn order_of_input_does_not_matter() {
        assert_eq!(
            ChordQuality::from_pitch_classes([7, 0, 4]),
            ChordQuality::Major
        );
        assert_eq!(
            ChordQuality::from_pitch_classes([7, 3, 0]),
            ChordQuality::Minor
        );
    }

    #[test]
    fn full_table() {
        let cases = [
            ([0, 3, 6], 3),
            ([0, 2, 7], 4),
            ([0, 5, 7], 5),
            ([0, 4, 8], 6),
            ([0, 4, 6], 7),
            ([0, 2, 8], 8),
            ([0, 5, 10], 9),
        ];
        for (classes, code) in cases {
            assert_eq!(ChordQuality::from_pitch_classes(classes).code(), code);
        }
    }

    #[test]
    fn unmatched_triples_are_unknown() {
        assert_eq!(ChordQuality::from_pitch_classes([0, 1, 2]).code(), 0);
        assert_eq!(ChordQuality::from_pitch_classes([2, 3, 11]).code(), 0);
    }

    #[test]
    fn default_state_is_silent() {
        let state = AudioState::default();
        assert_eq!(state.bpm, 0);
        assert!(state.db.is_infinite() && state.db < 0.0);
        assert!(!state.beat_on_off);
    }
}
