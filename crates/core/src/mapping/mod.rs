use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    analysis::{AudioState, ChordQuality},
    fixture::Color,
    pipeline::BeatListener,
    scene::{Pulse, SceneManager},
    Result, StageError,
};

/// Groups receiving one tone color each, in `freqs` order.
const TONE_GROUPS: [&str; 3] = ["midA", "midB", "midC"];
const CHORD_GROUP: &str = "high";
const BEAT_GROUP: &str = "bass";

/// Colors used by one lighting mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingMode {
    /// Group name to color applied when the mode starts.
    #[serde(default)]
    pub default_colors: BTreeMap<String, [u8; 3]>,
    /// Pitch class (0-11) to color.
    #[serde(default)]
    pub tone_colors: BTreeMap<u8, [u8; 3]>,
}

impl Default for LightingMode {
    fn default() -> Self {
        let default_colors = [
            ("bass", [255, 255, 255]),
            ("midA", [255, 0, 0]),
            ("midB", [0, 255, 0]),
            ("midC", [0, 0, 255]),
        ]
        .into_iter()
        .map(|(group, color)| (group.to_string(), color))
        .collect();

        let tone_colors = [
            [255, 255, 255],
            [255, 0, 0],
            [255, 127, 0],
            [255, 255, 0],
            [0, 255, 0],
            [0, 255, 255],
            [0, 127, 255],
            [0, 0, 255],
            [127, 0, 255],
            [255, 0, 255],
            [255, 0, 127],
            [127, 127, 127],
        ]
        .into_iter()
        .zip(0u8..)
        .map(|(color, pitch)| (pitch, color))
        .collect();

        Self {
            default_colors,
            tone_colors,
        }
    }
}

impl LightingMode {
    /// Color for a pitch class, if the mode defines one.
    pub fn tone_color(&self, pitch_class: u8) -> Option<Color> {
        self.tone_colors.get(&pitch_class).copied().map(Color::from)
    }
}

/// Named lighting modes loaded from a JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LightingModes(pub BTreeMap<String, LightingMode>);

impl Default for LightingModes {
    fn default() -> Self {
        Self(BTreeMap::from([("default".to_string(), LightingMode::default())]))
    }
}

impl LightingModes {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Like [`LightingModes::load`], but a missing file yields the default mode.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!(?path, "no lighting modes file, using the default mode");
            Ok(Self::default())
        }
    }

    pub fn mode(&self, name: &str) -> Result<&LightingMode> {
        self.0
            .get(name)
            .ok_or_else(|| StageError::UnknownMode(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct Applied {
    freqs: Option<[u8; 3]>,
    chord: Option<ChordQuality>,
}

/// Turns analysis snapshots and beat pulses into scene commands.
pub struct AudioReactor {
    scenes: Arc<SceneManager>,
    mode: LightingMode,
    pulse: Pulse,
    applied: Mutex<Applied>,
}

impl AudioReactor {
    pub fn new(scenes: Arc<SceneManager>, mode: LightingMode) -> Self {
        Self {
            scenes,
            mode,
            pulse: Pulse::default(),
            applied: Mutex::new(Applied::default()),
        }
    }

    pub fn with_pulse(mut self, pulse: Pulse) -> Self {
        self.pulse = pulse;
        self
    }

    pub fn mode(&self) -> &LightingMode {
        &self.mode
    }

    /// Applies the mode's default group colors.
    pub fn apply_defaults(&self) -> Result<()> {
        let fade = self.scenes.default_fade();
        for (group, color) in &self.mode.default_colors {
            self.scenes.set_color(group, Color::from(*color), fade)?;
        }
        Ok(())
    }

    /// Reacts to a new analysis snapshot. Only changed pitch classes or chords
    /// produce writes.
    pub fn process_state(&self, state: &AudioState) -> Result<()> {
        let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
        let fade = self.scenes.default_fade();
        let freqs_changed = applied.freqs != Some(state.freqs);
        let chord_changed = applied.chord != Some(state.chord);
        applied.freqs = Some(state.freqs);
        applied.chord = Some(state.chord);

        if freqs_changed {
            debug!(freqs = ?state.freqs, "pitch classes changed");
            for (group, pitch) in TONE_GROUPS.iter().zip(state.freqs) {
                if let Some(color) = self.mode.tone_color(pitch) {
                    self.scenes.set_color(group, color, fade)?;
                }
            }
        }

        if (freqs_changed || chord_changed) && state.chord != ChordQuality::Unknown {
            let colors: Vec<Color> = state
                .freqs
                .iter()
                .filter_map(|&pitch| self.mode.tone_color(pitch))
                .collect();
            debug!(chord = ?state.chord, "chord gradient");
            self.scenes.gradient_across_group(CHORD_GROUP, &colors, fade)?;
        }
        Ok(())
    }
}

impl BeatListener for AudioReactor {
    fn on_beat(&self, _beat_time: f64, _confirmed: bool) {
        if let Err(err) = self.scenes.pulse_on_beat(BEAT_GROUP, self.pulse) {
            warn!(error = %err, "beat pulse failed");
        }
    }
}

impl std::fmt::Debug for AudioReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioReactor")
            .field("mode", &self.mode)
            .field("pulse", &self.pulse)
            .finish()
    }
}
