use crate::{config::TempoConfig, Result};

use super::onset::{onset_strength, Stft};

/// Onset envelopes whose peak stays below this are treated as beatless.
const ONSET_FLOOR: f32 = 1.0;

/// Global tempo estimator over a window of recent audio.
///
/// The onset envelope is autocorrelated over every lag that maps into the
/// configured BPM range, and each lag is weighted by a log-normal prior
/// centred on [`TempoConfig::prior_bpm`].
#[derive(Debug)]
pub struct TempoEstimator {
    config: TempoConfig,
    sample_rate: u32,
    stft: Stft,
}

impl TempoEstimator {
    pub fn new(config: TempoConfig, sample_rate: u32) -> Result<Self> {
        let stft = Stft::new(config.n_fft, config.hop)?;
        Ok(Self {
            config,
            sample_rate,
            stft,
        })
    }

    pub fn config(&self) -> &TempoConfig {
        &self.config
    }

    /// Samples needed before an estimate is attempted.
    pub fn window_len(&self) -> usize {
        (self.config.window_secs * self.sample_rate as f32).round() as usize
    }

    /// Returns the raw tempo in BPM, or `None` when the signal carries no
    /// usable periodicity.
    pub fn estimate(&mut self, signal: &[f32]) -> Result<Option<f32>> {
        let magnitudes = self.stft.magnitudes(signal)?;
        let mut envelope = onset_strength(&magnitudes);

        let peak = envelope.iter().copied().fold(0.0_f32, f32::max);
        if envelope.len() < 4 || peak < ONSET_FLOOR {
            return Ok(None);
        }

        let mean = envelope.iter().sum::<f32>() / envelope.len() as f32;
        envelope.iter_mut().for_each(|value| *value -= mean);

        let frame_rate = self.sample_rate as f32 / self.config.hop as f32;
        let min_lag = ((60.0 * frame_rate / self.config.max_bpm).floor() as usize).max(1);
        let max_lag = ((60.0 * frame_rate / self.config.min_bpm).ceil() as usize)
            .min(envelope.len() - 1);

        let mut best: Option<(f32, f32)> = None;
        for lag in min_lag..=max_lag {
            let bpm = 60.0 * frame_rate / lag as f32;
            if bpm < self.config.min_bpm || bpm > self.config.max_bpm {
                continue;
            }

            let score = autocorrelation(&envelope, lag) * self.prior(bpm);
            if best.map_or(true, |(best_score, _)| score > best_score) {
                best = Some((score, bpm));
            }
        }

        Ok(best
            .filter(|(score, _)| *score > 0.0)
            .map(|(_, bpm)| bpm))
    }

    fn prior(&self, bpm: f32) -> f32 {
        let octaves = (bpm / self.config.prior_bpm).log2();
        (-0.5 * octaves * octaves).exp()
    }
}

fn autocorrelation(envelope: &[f32], lag: usize) -> f32 {
    let count = envelope.len() - lag;
    let sum: f32 = envelope[..count]
        .iter()
        .zip(&envelope[lag..])
        .map(|(a, b)| a * b)
        .sum();
    sum / count as f32
}

/// Converts a raw estimate into the published integer tempo. Estimates above
/// `halve_above` are treated as double-time and halved.
pub fn publish_bpm(raw: f32, halve_above: f32) -> u32 {
    let adjusted = if raw > halve_above { raw / 2.0 } else { raw };
    adjusted.round().max(0.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click_track(bpm: f32, sample_rate: u32, secs: f32) -> Vec<f32> {
        let len = (secs * sample_rate as f32) as usize;
        let interval = (60.0 / bpm * sample_rate as f32) as usize;
        let mut signal = vec![0.0; len];
        for start in (0..len).step_by(interval) {
            for i in 0..200.min(len - start) {
                let phase = 2.0 * std::f32::consts::PI * 1_000.0 * i as f32 / sample_rate as f32;
                signal[start + i] = 0.9 * phase.sin();
            }
        }
        signal
    }

    #[test]
    fn finds_tempo_of_a_click_track() {
        let mut estimator = TempoEstimator::new(TempoConfig::default(), 44_100).unwrap();
        let raw = estimator
            .estimate(&click_track(120.0, 44_100, 4.0))
            .unwrap()
            .expect("clicks have a tempo");

        assert!((raw - 120.0).abs() < 4.0, "raw tempo {raw}");
        assert_eq!(publish_bpm(raw, 100.0), 60);
    }

    #[test]
    fn silence_has_no_tempo() {
        let mut estimator = TempoEstimator::new(TempoConfig::default(), 44_100).unwrap();
        assert_eq!(estimator.estimate(&vec![0.0; 44_100 * 4]).unwrap(), None);
    }

    #[test]
    fn halving_only_above_threshold() {
        assert_eq!(publish_bpm(172.0, 100.0), 86);
        assert_eq!(publish_bpm(100.0, 100.0), 100);
        assert_eq!(publish_bpm(95.4, 100.0), 95);
        assert_eq!(publish_bpm(172.0, 200.0), 172);
    }

    #[test]
    fn published_tempo_never_exceeds_raw() {
        for raw in [31.0, 99.9, 100.1, 150.0, 299.0] {
            assert!(publish_bpm(raw, 100.0) as f32 <= raw.round());
        }
    }
}
