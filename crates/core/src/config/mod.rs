use std::{collections::BTreeMap, fs, ops::Range, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub tempo: TempoConfig,
    pub beat: BeatConfig,
    pub spectral: SpectralConfig,
    pub dmx: DmxConfig,
    pub groups: GroupConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections fall back to their
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Like [`AppConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(?path, "no config file, using defaults");
            Ok(Self::default())
        }
    }
}

/// Configuration specific to the audio input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Samples per buffer handed to the analysis tasks.
    pub buffer_size: usize,
    /// Cursor advance between file windows. Equal to `buffer_size` for
    /// non-overlapping reads.
    pub hop_size: usize,
    /// Pace file playback to wall-clock time.
    pub realtime: bool,
    /// Capacity of each bounded queue between the input task and its consumers.
    pub queue_capacity: usize,
    /// Length of the rolling signal history in seconds.
    pub history_secs: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            buffer_size: 44_100 / 5,
            hop_size: 44_100 / 5,
            realtime: true,
            queue_capacity: 16,
            history_secs: 4.0,
        }
    }
}

/// Tempo estimation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    /// Amount of recent signal the estimator looks at.
    pub window_secs: f32,
    /// Interval between estimations.
    pub period_secs: f32,
    /// Raw estimates above this value are halved before publication.
    pub halve_above_bpm: f32,
    pub min_bpm: f32,
    pub max_bpm: f32,
    /// Center of the log-normal tempo prior.
    pub prior_bpm: f32,
    pub n_fft: usize,
    pub hop: usize,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            window_secs: 4.0,
            period_secs: 2.0,
            halve_above_bpm: 100.0,
            min_bpm: 30.0,
            max_bpm: 300.0,
            prior_bpm: 120.0,
            n_fft: 2048,
            hop: 512,
        }
    }
}

/// Beat-phase prediction and confirmation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatConfig {
    /// A confirmed kick within this distance of the predicted beat re-locks the phase.
    pub tolerance_secs: f64,
    pub pulse_ms: u64,
    pub idle_poll_ms: u64,
    /// Confirmation buffers quieter than this RMS never confirm.
    pub min_rms: f32,
    pub band_low_hz: f32,
    pub band_high_hz: f32,
    pub n_fft: usize,
    pub hop: usize,
    pub peak: PeakPickConfig,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            tolerance_secs: 0.2,
            pulse_ms: 50,
            idle_poll_ms: 10,
            min_rms: 1.0,
            band_low_hz: 20.0,
            band_high_hz: 200.0,
            n_fft: 2048,
            hop: 512,
            peak: PeakPickConfig::default(),
        }
    }
}

impl BeatConfig {
    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Parameters of the onset peak picker, in onset frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakPickConfig {
    pub pre_max: usize,
    pub post_max: usize,
    pub pre_avg: usize,
    pub post_avg: usize,
    pub delta: f32,
    pub wait: usize,
}

impl Default for PeakPickConfig {
    fn default() -> Self {
        Self {
            pre_max: 3,
            post_max: 3,
            pre_avg: 3,
            post_avg: 5,
            delta: 0.5,
            wait: 10,
        }
    }
}

/// Spectral decomposition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralConfig {
    pub period_secs: f32,
    pub n_fft: usize,
    pub hop: usize,
    pub components: usize,
    pub max_iter: usize,
    /// Semitones added to the MIDI note before folding to a pitch class.
    pub tuning_offset: i32,
    pub seed: u64,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            period_secs: 1.0,
            n_fft: 4096,
            hop: 2048,
            components: 5,
            max_iter: 200,
            tuning_offset: 1,
            seed: 0,
        }
    }
}

/// DMX output and fade timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DmxConfig {
    /// Frames per second sent to hardware.
    pub frame_rate: f32,
    /// Frames per second logged by the simulator.
    pub simulator_rate: f32,
    pub fade_ms: u64,
    pub fade_step_ms: u64,
    pub baud_rate: u32,
}

impl Default for DmxConfig {
    fn default() -> Self {
        Self {
            frame_rate: 40.0,
            simulator_rate: 2.0,
            fade_ms: 500,
            fade_step_ms: 50,
            baud_rate: 250_000,
        }
    }
}

impl DmxConfig {
    pub fn fade(&self) -> Duration {
        Duration::from_millis(self.fade_ms)
    }

    pub fn fade_step(&self) -> Duration {
        Duration::from_millis(self.fade_step_ms.max(1))
    }
}

/// Named DMX address ranges, `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupConfig(pub BTreeMap<String, [u16; 2]>);

impl Default for GroupConfig {
    fn default() -> Self {
        let ranges = [
            ("bass", [0, 61]),
            ("midA", [61, 81]),
            ("midB", [81, 121]),
            ("midC", [121, 161]),
            ("highA", [161, 196]),
            ("highB", [196, 231]),
            ("mid", [61, 161]),
            ("high", [161, 231]),
            ("special", [231, 512]),
        ];
        Self(
            ranges
                .into_iter()
                .map(|(name, range)| (name.to_string(), range))
                .collect(),
        )
    }
}

impl GroupConfig {
    pub fn range(&self, group: &str) -> Option<Range<u16>> {
        self.0.get(group).map(|[start, end]| *start..*end)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}
