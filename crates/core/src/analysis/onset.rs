use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{config::PeakPickConfig, Result, StageError};

/// Hann-windowed short-time Fourier transform with a cached FFT plan.
pub struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize) -> Result<Self> {
        if n_fft < 2 {
            return Err(StageError::InvalidInput("stft needs at least two points"));
        }
        if hop == 0 {
            return Err(StageError::InvalidInput("stft hop must be positive"));
        }

        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(n_fft);
        let input = plan.make_input_vec();
        let spectrum = plan.make_output_vec();
        let scratch = plan.make_scratch_vec();
        let window = (0..n_fft).map(|i| hann_value(i, n_fft)).collect();

        Ok(Self {
            n_fft,
            hop,
            window,
            plan,
            input,
            spectrum,
            scratch,
        })
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Number of frames produced for a signal of `len` samples. Signals
    /// shorter than one window are zero padded to a single frame.
    pub fn frame_count(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else if len <= self.n_fft {
            1
        } else {
            (len - self.n_fft) / self.hop + 1
        }
    }

    /// Centre frequency of `bin` in Hz.
    pub fn bin_frequency(&self, bin: usize, sample_rate: u32) -> f32 {
        bin as f32 * sample_rate as f32 / self.n_fft as f32
    }

    /// Magnitude-only transform.
    pub fn magnitudes(&mut self, signal: &[f32]) -> Result<Vec<Vec<f32>>> {
        let mut frames = Vec::with_capacity(self.frame_count(signal.len()));
        for index in 0..self.frame_count(signal.len()) {
            self.transform_frame(signal, index)?;
            frames.push(self.spectrum.iter().map(|bin| bin.norm()).collect());
        }
        Ok(frames)
    }

    fn transform_frame(&mut self, signal: &[f32], index: usize) -> Result<()> {
        let start = index * self.hop;
        for (i, slot) in self.input.iter_mut().enumerate() {
            let sample = signal.get(start + i).copied().unwrap_or(0.0);
            *slot = sample * self.window[i];
        }
        self.plan
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)?;
        Ok(())
    }
}

impl fmt::Debug for Stft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stft")
            .field("n_fft", &self.n_fft)
            .field("hop", &self.hop)
            .finish()
    }
}

/// Onset strength envelope: half-wave rectified flux of the log-compressed
/// magnitude spectrum, summed over bins. The first frame is always 0.
pub fn onset_strength(magnitudes: &[Vec<f32>]) -> Vec<f32> {
    let mut envelope = Vec::with_capacity(magnitudes.len());
    let mut previous: Option<Vec<f32>> = None;

    for frame in magnitudes {
        let compressed: Vec<f32> = frame.iter().map(|m| m.ln_1p()).collect();
        let flux = match &previous {
            Some(prev) => compressed
                .iter()
                .zip(prev)
                .map(|(now, before)| (now - before).max(0.0))
                .sum(),
            None => 0.0,
        };
        envelope.push(flux);
        previous = Some(compressed);
    }

    envelope
}

/// Picks onset peaks. A frame is a peak when it is the maximum of its
/// `[n - pre_max, n + post_max]` neighbourhood, exceeds the mean of
/// `[n - pre_avg, n + post_avg]` by `delta`, and lies more than `wait` frames
/// after the previous peak. Neighbourhoods are clipped at the edges.
pub fn peak_pick(envelope: &[f32], params: &PeakPickConfig) -> Vec<usize> {
    let mut peaks = Vec::new();
    let mut last_peak: Option<usize> = None;

    for (n, &value) in envelope.iter().enumerate() {
        let max_window = neighbourhood(envelope, n, params.pre_max, params.post_max);
        let local_max = max_window.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if value < local_max {
            continue;
        }

        let avg_window = neighbourhood(envelope, n, params.pre_avg, params.post_avg);
        let local_mean = avg_window.iter().sum::<f32>() / avg_window.len() as f32;
        if value < local_mean + params.delta {
            continue;
        }

        if let Some(last) = last_peak {
            if n <= last + params.wait {
                continue;
            }
        }

        peaks.push(n);
        last_peak = Some(n);
    }

    peaks
}

fn neighbourhood(envelope: &[f32], n: usize, before: usize, after: usize) -> &[f32] {
    &envelope[n.saturating_sub(before)..(n + after + 1).min(envelope.len())]
}

pub(crate) fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn frame_count_matches_hop_layout() {
        let stft = Stft::new(8, 4).unwrap();
        assert_eq!(stft.frame_count(0), 0);
        assert_eq!(stft.frame_count(5), 1);
        assert_eq!(stft.frame_count(8), 1);
        assert_eq!(stft.frame_count(16), 3);
        assert_eq!(stft.bins(), 5);
    }

    #[test]
    fn sine_peaks_in_expected_bin() {
        let sample_rate = 8_000.0;
        let mut stft = Stft::new(256, 128).unwrap();
        // 1 kHz falls exactly on bin 32.
        let frames = stft.magnitudes(&sine(1_000.0, sample_rate, 1024)).unwrap();
        let first = &frames[0];
        let loudest = first
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(bin, _)| bin)
            .unwrap();
        assert_eq!(loudest, 32);
        assert_eq!(stft.bin_frequency(loudest, 8_000), 1_000.0);
    }

    #[test]
    fn onset_strength_fires_on_energy_increase_only() {
        let quiet = vec![0.0; 4];
        let loud = vec![10.0; 4];
        let envelope = onset_strength(&[quiet.clone(), loud.clone(), loud, quiet]);

        assert_eq!(envelope[0], 0.0);
        assert!(envelope[1] > 0.0);
        assert_eq!(envelope[2], 0.0);
        assert_eq!(envelope[3], 0.0);
    }

    #[test]
    fn peak_pick_respects_threshold_and_wait() {
        let params = PeakPickConfig {
            pre_max: 1,
            post_max: 1,
            pre_avg: 1,
            post_avg: 1,
            delta: 0.5,
            wait: 2,
        };
        let envelope = [0.0, 3.0, 0.0, 2.5, 0.0, 0.0, 4.0, 0.0, 0.1];
        assert_eq!(peak_pick(&envelope, &params), vec![1, 6]);
    }

    #[test]
    fn flat_envelope_has_no_peaks() {
        assert!(peak_pick(&[0.0; 32], &PeakPickConfig::default()).is_empty());
    }
}
