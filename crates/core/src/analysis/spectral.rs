use ndarray::{Array2, Zip};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{config::SpectralConfig, Result};

use super::{onset::Stft, ChordQuality};

/// Octave band edges in Hz used to classify component frequencies.
pub const OCTAVE_EDGES: [f32; 8] = [50.0, 110.0, 220.0, 440.0, 880.0, 1760.0, 3520.0, 7040.0];

const BAND_COUNT: usize = OCTAVE_EDGES.len() - 1;
const EPS: f32 = 1e-10;
const TOP_BINS: usize = 3;

/// A component bound to the octave band it voted for most.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandAssignment {
    pub component: usize,
    pub band: usize,
    pub low_hz: f32,
    pub high_hz: f32,
}

/// Result of one decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralAnalysis {
    /// Three most common pitch classes, ascending.
    pub freqs: [u8; 3],
    pub chord: ChordQuality,
    /// Frequencies of the strongest bins of each basis, strongest first.
    pub top_frequencies: Vec<[f32; 3]>,
    pub assignments: Vec<BandAssignment>,
}

/// Factorizes short spectra into a few spectral templates and reads the
/// dominant pitch classes off them.
#[derive(Debug)]
pub struct SpectralDecomposer {
    config: SpectralConfig,
    sample_rate: u32,
    stft: Stft,
}

impl SpectralDecomposer {
    pub fn new(config: SpectralConfig, sample_rate: u32) -> Result<Self> {
        let stft = Stft::new(config.n_fft, config.hop)?;
        Ok(Self {
            config,
            sample_rate,
            stft,
        })
    }

    /// Samples fed to each analysis.
    pub fn window_len(&self) -> usize {
        (self.config.period_secs * self.sample_rate as f32).round() as usize
    }

    /// Analyses one slice of audio. Returns `None` for silence and when the
    /// components do not name at least three distinct pitch classes.
    pub fn analyze(&mut self, samples: &[i16]) -> Result<Option<SpectralAnalysis>> {
        let signal: Vec<f32> = samples.iter().map(|&s| s as f32 / 32_768.0).collect();
        let frames = self.stft.magnitudes(&signal)?;
        if frames.is_empty() {
            return Ok(None);
        }

        let bins = self.stft.bins();
        let v = spectrogram_matrix(&frames, bins);
        if v.iter().all(|&value| value <= EPS) {
            return Ok(None);
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let components = self.config.components.max(1);
        let (bases, _activations) = nmf_is(&v, components, self.config.max_iter, &mut rng);

        let top_frequencies: Vec<[f32; 3]> = bases
            .columns()
            .into_iter()
            .map(|column| {
                let mut top = [0.0; TOP_BINS];
                for (slot, bin) in top.iter_mut().zip(top_bins(&column.to_vec())) {
                    *slot = self.stft.bin_frequency(bin, self.sample_rate);
                }
                top
            })
            .collect();

        let assignments = assign_bands(&band_votes(&top_frequencies));

        let classes: Vec<u8> = top_frequencies
            .iter()
            .flatten()
            .filter_map(|&hz| pitch_class(hz, self.config.tuning_offset))
            .collect();

        let Some(freqs) = most_common_three(&classes) else {
            tracing::trace!(?classes, "fewer than three distinct pitch classes");
            return Ok(None);
        };

        Ok(Some(SpectralAnalysis {
            freqs,
            chord: ChordQuality::from_pitch_classes(freqs),
            top_frequencies,
            assignments,
        }))
    }
}

/// Bins x frames, with `EPS` added so every entry is positive.
fn spectrogram_matrix(frames: &[Vec<f32>], bins: usize) -> Array2<f32> {
    Array2::from_shape_fn((bins, frames.len()), |(f, t)| {
        frames[t].get(f).copied().unwrap_or(0.0) + EPS
    })
}

fn random_matrix(shape: (usize, usize), scale: f32, rng: &mut StdRng) -> Array2<f32> {
    Array2::from_shape_simple_fn(shape, || scale * (0.1 + 0.9 * rng.gen::<f32>()))
}

/// Itakura-Saito NMF by multiplicative updates: `v ≈ w · h` with `w` of
/// shape bins x components and `h` of shape components x frames.
fn nmf_is(
    v: &Array2<f32>,
    components: usize,
    max_iter: usize,
    rng: &mut StdRng,
) -> (Array2<f32>, Array2<f32>) {
    let (bins, frames) = v.dim();
    let mean = v.mean().unwrap_or(0.0);
    let scale = (mean / components as f32).sqrt();
    let mut w = random_matrix((bins, components), scale, rng);
    let mut h = random_matrix((components, frames), scale, rng);

    for _ in 0..max_iter {
        let (weighted, inverse) = is_ratios(v, &w.dot(&h));
        let numerator = w.t().dot(&weighted);
        let denominator = w.t().dot(&inverse);
        apply_update(&mut h, &numerator, &denominator);

        let (weighted, inverse) = is_ratios(v, &w.dot(&h));
        let numerator = weighted.dot(&h.t());
        let denominator = inverse.dot(&h.t());
        apply_update(&mut w, &numerator, &denominator);
    }

    (w, h)
}

/// Returns `v / wh²` and `1 / wh`.
fn is_ratios(v: &Array2<f32>, wh: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
    let model = wh.mapv(|value| value.max(EPS));
    let weighted = v / &(&model * &model);
    let inverse = model.mapv(f32::recip);
    (weighted, inverse)
}

fn apply_update(factor: &mut Array2<f32>, numerator: &Array2<f32>, denominator: &Array2<f32>) {
    Zip::from(factor)
        .and(numerator)
        .and(denominator)
        .for_each(|value, &num, &den| *value *= num / den.max(EPS));
}

/// Indices of the three largest values, largest first. Equal values keep
/// ascending index order.
fn top_bins(values: &[f32]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    indices.truncate(TOP_BINS);
    indices
}

fn band_of(hz: f32) -> Option<usize> {
    OCTAVE_EDGES
        .windows(2)
        .position(|edge| edge[0] <= hz && hz < edge[1])
}

fn band_votes(top_frequencies: &[[f32; 3]]) -> Vec<[u32; BAND_COUNT]> {
    top_frequencies
        .iter()
        .map(|freqs| {
            let mut votes = [0; BAND_COUNT];
            for band in freqs.iter().filter_map(|&hz| band_of(hz)) {
                votes[band] += 1;
            }
            votes
        })
        .collect()
}

/// Greedy one-to-one matching of components to bands by vote count. Ties go
/// to the lowest component, then the lowest band. Components left over once
/// every band had a chance take the first unclaimed band, if any.
fn assign_bands(votes: &[[u32; BAND_COUNT]]) -> Vec<BandAssignment> {
    let mut component_taken = vec![false; votes.len()];
    let mut band_taken = [false; BAND_COUNT];
    let mut pairs = Vec::new();

    while pairs.len() < votes.len().min(BAND_COUNT) {
        let mut best: Option<(u32, usize, usize)> = None;
        for (component, row) in votes.iter().enumerate() {
            if component_taken[component] {
                continue;
            }
            for (band, &count) in row.iter().enumerate() {
                if band_taken[band] {
                    continue;
                }
                if best.map_or(true, |(most, _, _)| count > most) {
                    best = Some((count, component, band));
                }
            }
        }

        let Some((_, component, band)) = best else {
            break;
        };
        component_taken[component] = true;
        band_taken[band] = true;
        pairs.push((component, band));
    }

    for component in 0..votes.len() {
        if component_taken[component] {
            continue;
        }
        if let Some(band) = band_taken.iter().position(|taken| !taken) {
            component_taken[component] = true;
            band_taken[band] = true;
            pairs.push((component, band));
        }
    }

    pairs.sort_unstable();
    pairs
        .into_iter()
        .map(|(component, band)| BandAssignment {
            component,
            band,
            low_hz: OCTAVE_EDGES[band],
            high_hz: OCTAVE_EDGES[band + 1],
        })
        .collect()
}

/// Pitch class 0..=11 of `hz`, shifted by `offset` semitones.
fn pitch_class(hz: f32, offset: i32) -> Option<u8> {
    if !hz.is_finite() {
        return None;
    }
    let midi = 69.0 + 12.0 * (hz.max(1e-6) / 440.0).log2();
    if !midi.is_finite() {
        return None;
    }
    let class = (midi.round() as i32 + offset).rem_euclid(12);
    u8::try_from(class).ok()
}

/// The three most frequent values in ascending order, or `None` when fewer
/// than three distinct values occur. Equal counts rank by first appearance.
fn most_common_three(classes: &[u8]) -> Option<[u8; 3]> {
    let mut counts: Vec<(u8, usize)> = Vec::new();
    for &class in classes {
        match counts.iter_mut().find(|(seen, _)| *seen == class) {
            Some((_, count)) => *count += 1,
            None => counts.push((class, 1)),
        }
    }
    if counts.len() < 3 {
        return None;
    }

    // Stable sort keeps first-appearance order among equal counts.
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    let mut top = [counts[0].0, counts[1].0, counts[2].0];
    top.sort_unstable();
    Some(top)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_classes_follow_equal_temperament() {
        assert_eq!(pitch_class(440.0, 0), Some(9));
        assert_eq!(pitch_class(261.63, 0), Some(0));
        assert_eq!(pitch_class(440.0, 1), Some(10));
        assert_eq!(pitch_class(493.88, 1), Some(0));
        assert_eq!(pitch_class(f32::NAN, 0), None);
    }

    #[test]
    fn zero_hz_is_clamped_instead_of_dropped() {
        assert!(pitch_class(0.0, 0).is_some());
    }

    #[test]
    fn most_common_breaks_ties_by_first_appearance() {
        assert_eq!(most_common_three(&[5, 5, 2, 9, 2, 7, 11]), Some([2, 5, 9]));
        assert_eq!(most_common_three(&[4, 4, 4, 1]), None);
        assert_eq!(most_common_three(&[]), None);
    }

    #[test]
    fn bands_are_half_open() {
        assert_eq!(band_of(49.9), None);
        assert_eq!(band_of(50.0), Some(0));
        assert_eq!(band_of(110.0), Some(1));
        assert_eq!(band_of(7039.0), Some(6));
        assert_eq!(band_of(7040.0), None);
    }

    #[test]
    fn greedy_assignment_is_one_to_one() {
        let votes = vec![
            [3, 0, 0, 0, 0, 0, 0],
            [2, 1, 0, 0, 0, 0, 0],
            [0, 0, 0, 3, 0, 0, 0],
            [0, 0, 0, 0, 0, 0, 0],
            [0, 0, 0, 2, 1, 0, 0],
        ];
        let bands: Vec<(usize, usize)> = assign_bands(&votes)
            .iter()
            .map(|a| (a.component, a.band))
            .collect();

        assert_eq!(bands, vec![(0, 0), (1, 1), (2, 3), (3, 2), (4, 4)]);
    }

    #[test]
    fn more_components_than_bands_leaves_extras_unassigned() {
        let votes = vec![[0; BAND_COUNT]; 9];
        let assignments = assign_bands(&votes);
        assert_eq!(assignments.len(), BAND_COUNT);
        assert!(assignments.iter().all(|a| a.component < BAND_COUNT));
        assert_eq!(assignments[0].low_hz, 50.0);
    }

    #[test]
    fn top_bins_prefers_lower_index_on_ties() {
        assert_eq!(top_bins(&[1.0, 5.0, 5.0, 3.0, 0.0]), vec![1, 2, 3]);
    }

    #[test]
    fn nmf_updates_improve_on_random_init() {
        let frames: Vec<Vec<f32>> = (0..6)
            .map(|t| (0..16).map(|f| 1.0 + ((f * (t + 1)) % 5) as f32).collect())
            .collect();
        let v = spectrogram_matrix(&frames, 16);
        assert_eq!(v.dim(), (16, 6));

        let divergence = |iterations: usize| {
            let mut rng = StdRng::seed_from_u64(7);
            let (w, h) = nmf_is(&v, 2, iterations, &mut rng);
            assert_eq!((w.dim(), h.dim()), ((16, 2), (2, 6)));
            let wh = w.dot(&h);
            v.iter()
                .zip(wh.iter())
                .map(|(&a, &b)| a / b - (a / b).ln() - 1.0)
                .sum::<f32>()
        };

        assert!(divergence(30) < divergence(0));
    }

    #[test]
    fn silence_yields_nothing() {
        let config = SpectralConfig {
            max_iter: 5,
            ..SpectralConfig::default()
        };
        let mut decomposer = SpectralDecomposer::new(config, 44_100).unwrap();
        assert_eq!(decomposer.analyze(&vec![0; 44_100]).unwrap(), None);
    }

    #[test]
    fn a_triad_produces_three_classes() {
        let config = SpectralConfig {
            max_iter: 20,
            components: 3,
            ..SpectralConfig::default()
        };
        let mut decomposer = SpectralDecomposer::new(config, 44_100).unwrap();
        let samples: Vec<i16> = (0..44_100)
            .map(|i| {
                let t = i as f32 / 44_100.0;
                let value: f32 = [261.63f32, 329.63, 392.0]
                    .iter()
                    .map(|hz| (2.0 * std::f32::consts::PI * hz * t).sin())
                    .sum();
                (value * 8_000.0) as i16
            })
            .collect();

        let analysis = decomposer.analyze(&samples).unwrap().expect("three tones");
        assert_eq!(analysis.top_frequencies.len(), 3);
        assert_eq!(analysis.assignments.len(), 3);
        assert!(analysis.freqs.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(analysis.freqs.iter().all(|&class| class < 12));
    }
}
