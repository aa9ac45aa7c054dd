use std::f64::consts::PI;

use crate::{Result, StageError};

/// Q factors of the two second-order sections of a 4th order Butterworth.
const BUTTERWORTH_Q: [f64; 2] = [0.541_196_1, 1.306_563];

/// Samples of odd reflection added to both ends before zero-phase filtering.
const PAD_LEN: usize = 27;

/// Second-order IIR section in transposed direct form II.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    pub fn low_pass(sample_rate: f64, cutoff: f64, q: f64) -> Self {
        let (cos, alpha) = Self::prewarp(sample_rate, cutoff, q);
        let b = (1.0 - cos) / 2.0;
        Self::normalized([b, 1.0 - cos, b], [1.0 + alpha, -2.0 * cos, 1.0 - alpha])
    }

    pub fn high_pass(sample_rate: f64, cutoff: f64, q: f64) -> Self {
        let (cos, alpha) = Self::prewarp(sample_rate, cutoff, q);
        let b = (1.0 + cos) / 2.0;
        Self::normalized([b, -(1.0 + cos), b], [1.0 + alpha, -2.0 * cos, 1.0 - alpha])
    }

    fn prewarp(sample_rate: f64, cutoff: f64, q: f64) -> (f64, f64) {
        let w0 = 2.0 * PI * cutoff / sample_rate;
        (w0.cos(), w0.sin() / (2.0 * q))
    }

    fn normalized(b: [f64; 3], a: [f64; 3]) -> Self {
        Self {
            b0: b[0] / a[0],
            b1: b[1] / a[0],
            b2: b[2] / a[0],
            a1: a[1] / a[0],
            a2: a[2] / a[0],
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Gain at DC.
    pub fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    /// Loads the state the section would settle into after a constant input
    /// of `input`, and returns the matching steady output.
    pub fn prime(&mut self, input: f64) -> f64 {
        let output = input * self.dc_gain();
        self.z1 = output - self.b0 * input;
        self.z2 = self.b2 * input - self.a2 * output;
        output
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    pub fn process(&mut self, input: f64) -> f64 {
        let output = self.b0 * input + self.z1;
        self.z1 = self.b1 * input - self.a1 * output + self.z2;
        self.z2 = self.b2 * input - self.a2 * output;
        output
    }
}

/// Zero-phase Butterworth band-pass: a 4th order high-pass at `low` followed
/// by a 4th order low-pass at `high`, run forward and backward.
#[derive(Debug, Clone)]
pub struct BandPass {
    sections: Vec<Biquad>,
}

impl BandPass {
    pub fn new(sample_rate: u32, low: f32, high: f32) -> Result<Self> {
        let nyquist = sample_rate as f32 / 2.0;
        if !(low > 0.0 && low < high && high < nyquist) {
            return Err(StageError::InvalidInput(
                "band-pass edges must satisfy 0 < low < high < nyquist",
            ));
        }

        let sample_rate = f64::from(sample_rate);
        let mut sections = Vec::with_capacity(4);
        for q in BUTTERWORTH_Q {
            sections.push(Biquad::high_pass(sample_rate, f64::from(low), q));
        }
        for q in BUTTERWORTH_Q {
            sections.push(Biquad::low_pass(sample_rate, f64::from(high), q));
        }

        Ok(Self { sections })
    }

    /// Filters `signal` without phase shift. The output has the input length.
    pub fn apply(&self, signal: &[f32]) -> Vec<f32> {
        if signal.len() < 2 {
            return signal.to_vec();
        }

        let pad = PAD_LEN.min(signal.len() - 1);
        let mut work = odd_extend(signal, pad);

        self.run(&mut work);
        work.reverse();
        self.run(&mut work);
        work.reverse();

        work[pad..pad + signal.len()]
            .iter()
            .map(|&value| value as f32)
            .collect()
    }

    fn run(&self, work: &mut [f64]) {
        let Some(&first) = work.first() else {
            return;
        };

        let mut sections = self.sections.clone();
        let mut steady = first;
        for section in &mut sections {
            steady = section.prime(steady);
        }

        for sample in work.iter_mut() {
            let mut value = *sample;
            for section in &mut sections {
                value = section.process(value);
            }
            *sample = value;
        }
    }
}

fn odd_extend(signal: &[f32], pad: usize) -> Vec<f64> {
    let first = f64::from(signal[0]);
    let last = f64::from(signal[signal.len() - 1]);
    let mut out = Vec::with_capacity(signal.len() + 2 * pad);

    out.extend((1..=pad).rev().map(|i| 2.0 * first - f64::from(signal[i])));
    out.extend(signal.iter().map(|&sample| f64::from(sample)));
    out.extend((1..=pad).map(|i| 2.0 * last - f64::from(signal[signal.len() - 1 - i])));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    fn rms(signal: &[f32]) -> f32 {
        (signal.iter().map(|s| s * s).sum::<f32>() / signal.len() as f32).sqrt()
    }

    #[test]
    fn passes_bass_and_rejects_treble() {
        let filter = BandPass::new(44_100, 20.0, 200.0).unwrap();

        let bass = tone(80.0, 44_100, 8_820);
        let treble = tone(3_000.0, 44_100, 8_820);

        // Ignore the edges where the reflection padding still matters.
        let middle = 2_000..6_820;
        let kept = rms(&filter.apply(&bass)[middle.clone()]) / rms(&bass[middle.clone()]);
        let rejected = rms(&filter.apply(&treble)[middle.clone()]) / rms(&treble[middle]);

        assert!(kept > 0.8, "passband gain {kept}");
        assert!(rejected < 0.01, "stopband gain {rejected}");
    }

    #[test]
    fn output_length_matches_input() {
        let filter = BandPass::new(8_000, 50.0, 500.0).unwrap();
        for len in [0, 1, 2, 10, 1_000] {
            assert_eq!(filter.apply(&vec![0.25; len]).len(), len);
        }
    }

    #[test]
    fn rejects_invalid_edges() {
        assert!(BandPass::new(44_100, 0.0, 200.0).is_err());
        assert!(BandPass::new(44_100, 300.0, 200.0).is_err());
        assert!(BandPass::new(44_100, 20.0, 30_000.0).is_err());
    }

    #[test]
    fn low_pass_keeps_dc_and_high_pass_removes_it() {
        let low = Biquad::low_pass(44_100.0, 200.0, BUTTERWORTH_Q[0]);
        let high = Biquad::high_pass(44_100.0, 20.0, BUTTERWORTH_Q[0]);
        assert!((low.dc_gain() - 1.0).abs() < 1e-9);
        assert!(high.dc_gain().abs() < 1e-9);
    }
}
