use crate::{config::BeatConfig, Result};

use super::{
    filter::BandPass,
    loudness::rms_i16,
    onset::{onset_strength, peak_pick, Stft},
};

/// Decides whether a buffer contains a low-frequency transient.
#[derive(Debug)]
pub struct BeatConfirmer {
    config: BeatConfig,
    band: BandPass,
    stft: Stft,
}

impl BeatConfirmer {
    pub fn new(config: BeatConfig, sample_rate: u32) -> Result<Self> {
        let band = BandPass::new(sample_rate, config.band_low_hz, config.band_high_hz)?;
        let stft = Stft::new(config.n_fft, config.hop)?;
        Ok(Self { config, band, stft })
    }

    /// Returns `true` when the band-limited onset envelope of `samples` has at
    /// least one peak. Quiet buffers and buffers that filter to non-finite
    /// values never confirm.
    pub fn confirm(&mut self, samples: &[i16]) -> Result<bool> {
        let rms = rms_i16(samples);
        if !rms.is_finite() || rms < self.config.min_rms {
            return Ok(false);
        }

        let signal: Vec<f32> = samples.iter().map(|&s| s as f32 / 32_768.0).collect();
        let mut filtered = self.band.apply(&signal);
        if filtered.iter().any(|value| !value.is_finite()) {
            tracing::trace!("band-passed buffer contained non-finite samples");
            return Ok(false);
        }

        let peak = filtered.iter().fold(0.0_f32, |acc, value| acc.max(value.abs()));
        if peak <= f32::EPSILON {
            return Ok(false);
        }
        filtered.iter_mut().for_each(|value| *value /= peak);

        let envelope = onset_strength(&self.stft.magnitudes(&filtered)?);
        Ok(!peak_pick(&envelope, &self.config.peak).is_empty())
    }
}

/// Result of one beat-phase step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatOutcome {
    /// Time recorded as the latest beat.
    pub beat_time: f64,
    /// The observed onset replaced the predicted time.
    pub relocked: bool,
    /// Grid points skipped because the loop fell behind.
    pub skipped: u32,
}

/// Flywheel beat-phase tracker.
///
/// Beats are predicted one interval after the last recorded beat. A confirmed
/// onset close enough to the prediction snaps the phase to the observation;
/// otherwise the prediction stands. Recorded beat times only ever increase.
#[derive(Debug, Clone)]
pub struct BeatTracker {
    last_beat: f64,
    bpm: u32,
    tolerance: f64,
}

impl BeatTracker {
    pub fn new(start: f64, tolerance: f64) -> Self {
        Self {
            last_beat: start,
            bpm: 0,
            tolerance,
        }
    }

    pub fn set_bpm(&mut self, bpm: u32) {
        self.bpm = bpm;
    }

    pub fn bpm(&self) -> u32 {
        self.bpm
    }

    pub fn last_beat(&self) -> f64 {
        self.last_beat
    }

    /// Seconds between beats, `None` while the tempo is unknown.
    pub fn interval(&self) -> Option<f64> {
        (self.bpm > 0).then(|| 60.0 / f64::from(self.bpm))
    }

    pub fn next_beat_time(&self) -> Option<f64> {
        self.interval().map(|interval| self.last_beat + interval)
    }

    /// Records the beat for the `predicted` grid point given the clock reading
    /// `actual` at which the loop woke and whether the buffer confirmed a kick.
    pub fn advance(&mut self, predicted: f64, actual: f64, confirmed: bool) -> BeatOutcome {
        let within_tolerance = (actual - predicted).abs() <= self.tolerance;
        if confirmed && within_tolerance && actual > self.last_beat {
            self.last_beat = actual;
            return BeatOutcome {
                beat_time: actual,
                relocked: true,
                skipped: 0,
            };
        }

        let mut beat_time = predicted;
        let mut skipped = 0;
        if let Some(interval) = self.interval() {
            while actual - beat_time > interval {
                beat_time += interval;
                skipped += 1;
            }
        }

        if beat_time <= self.last_beat {
            beat_time = self.last_beat + self.interval().unwrap_or(f64::EPSILON);
        }

        self.last_beat = beat_time;
        BeatOutcome {
            beat_time,
            relocked: false,
            skipped,
        }
    }
}
