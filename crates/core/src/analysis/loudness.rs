/// Full-scale amplitude of 16-bit PCM.
pub const MAX_AMPLITUDE: f32 = 32_767.0;

/// One loudness publication.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessReading {
    pub rms: f32,
    /// Level relative to full scale, `-inf` for digital silence.
    pub db: f32,
}

impl LoudnessReading {
    pub fn from_rms(rms: f32) -> Self {
        let db = if rms > 0.0 {
            20.0 * (rms / MAX_AMPLITUDE).log10()
        } else {
            f32::NEG_INFINITY
        };
        Self { rms, db }
    }
}

/// Accumulates samples and emits an RMS/dB reading for every second of audio
/// received, independent of the incoming buffer size.
#[derive(Debug)]
pub struct LoudnessEstimator {
    window: usize,
    scratch: Vec<i16>,
}

impl LoudnessEstimator {
    pub fn new(sample_rate: u32) -> Self {
        let window = sample_rate.max(1) as usize;
        Self {
            window,
            scratch: Vec::with_capacity(window * 2),
        }
    }

    /// Adds a buffer. Returns a reading once at least one second of samples
    /// has accumulated; the reading covers the most recent second and the
    /// scratch window starts over.
    pub fn push(&mut self, samples: &[i16]) -> Option<LoudnessReading> {
        self.scratch.extend_from_slice(samples);
        if self.scratch.len() < self.window {
            return None;
        }

        let recent = &self.scratch[self.scratch.len() - self.window..];
        let reading = LoudnessReading::from_rms(rms_i16(recent));
        self.scratch.clear();
        Some(reading)
    }

    pub fn pending(&self) -> usize {
        self.scratch.len()
    }
}

/// Root mean square of 16-bit samples, in sample units.
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&sample| {
            let value = sample as f64;
            value * value
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_once_per_second_of_audio() {
        let mut estimator = LoudnessEstimator::new(100);

        assert!(estimator.push(&[1000; 40]).is_none());
        assert!(estimator.push(&[1000; 40]).is_none());
        let reading = estimator.push(&[1000; 40]).expect("120 samples cover a second");
        assert!((reading.rms - 1000.0).abs() < 1e-3);
        assert_eq!(estimator.pending(), 0);
    }

    #[test]
    fn only_the_latest_second_counts() {
        let mut estimator = LoudnessEstimator::new(10);
        let mut block = vec![30_000; 5];
        block.extend_from_slice(&[100; 10]);

        let reading = estimator.push(&block).unwrap();
        assert!((reading.rms - 100.0).abs() < 1e-3);
    }

    #[test]
    fn silence_is_negative_infinity() {
        let mut estimator = LoudnessEstimator::new(8);
        let reading = estimator.push(&[0; 8]).unwrap();
        assert_eq!(reading.rms, 0.0);
        assert_eq!(reading.db, f32::NEG_INFINITY);
    }

    #[test]
    fn rms_is_non_negative_and_db_finite_when_audible() {
        let mut estimator = LoudnessEstimator::new(64);
        for amplitude in [-32_768i16, -5, 1, 12_000] {
            let samples: Vec<i16> = (0..64)
                .map(|i| if i % 2 == 0 { amplitude } else { 0 })
                .collect();
            let reading = estimator.push(&samples).unwrap();
            assert!(reading.rms >= 0.0);
            assert!(reading.db.is_finite());
        }
    }

    #[test]
    fn full_scale_square_is_zero_db() {
        let reading = LoudnessReading::from_rms(MAX_AMPLITUDE);
        assert!(reading.db.abs() < 1e-4);
    }
}
