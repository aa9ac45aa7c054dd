//! Group-level lighting operations.
//!
//! A group is a static `[start, end)` address range from the configuration;
//! a fixture belongs to it when its base address falls inside. Operations are
//! dispatched to every member that has the needed capability and silently
//! skip the rest.

use std::{
    f32::consts::TAU,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{
    config::GroupConfig,
    fixture::{Color, Fader, Fixture, LightPlot},
    Result, StageError,
};

/// Intensity flash fired on a beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pulse {
    pub intensity: u8,
    /// Time at full intensity before the restore starts.
    pub hold: Duration,
    /// Level restored after the hold.
    pub baseline: u8,
}

impl Default for Pulse {
    fn default() -> Self {
        Self {
            intensity: 255,
            hold: Duration::from_millis(200),
            baseline: 128,
        }
    }
}

/// Tilt wave rolled across the moving heads of a group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wave {
    pub pan: u8,
    pub amplitude: f32,
    pub steps: u32,
    /// Time between steps.
    pub delay: Duration,
    pub fade: Duration,
}

impl Default for Wave {
    fn default() -> Self {
        Self {
            pan: 127,
            amplitude: 40.0,
            steps: 6,
            delay: Duration::from_millis(400),
            fade: Duration::from_secs(1),
        }
    }
}

/// Resolves groups against the shared plot.
#[derive(Debug, Clone)]
struct Members {
    plot: Arc<Mutex<LightPlot>>,
    groups: Arc<GroupConfig>,
}

impl Members {
    fn plot(&self) -> Result<MutexGuard<'_, LightPlot>> {
        self.plot.lock().map_err(|_| StageError::Poisoned("light plot"))
    }

    fn of(&self, group: &str) -> Result<Vec<Fixture>> {
        let Some(range) = self.groups.range(group) else {
            debug!(group, "unknown group, treating as empty");
            return Ok(Vec::new());
        };
        Ok(self
            .plot()?
            .fixtures()
            .iter()
            .filter(|fixture| range.contains(&fixture.address()))
            .cloned()
            .collect())
    }

    fn grouped(&self) -> Result<Vec<Fixture>> {
        let ranges: Vec<_> = self
            .groups
            .names()
            .filter_map(|name| self.groups.range(name))
            .collect();
        Ok(self
            .plot()?
            .fixtures()
            .iter()
            .filter(|fixture| ranges.iter().any(|range| range.contains(&fixture.address())))
            .cloned()
            .collect())
    }
}

/// Applies `op` to every fixture, returning the first failure after all
/// fixtures have been tried.
fn dispatch<F>(fixtures: &[Fixture], mut op: F) -> Result<()>
where
    F: FnMut(&Fixture) -> Result<()>,
{
    let mut first_error = None;
    for fixture in fixtures {
        if let Err(err) = op(fixture) {
            warn!(fixture = fixture.name(), error = %err, "fixture write failed");
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn set_dim(fixtures: &[Fixture], fader: &Fader, value: u8, fade: Duration) -> Result<()> {
    dispatch(fixtures, |fixture| match fixture.as_dimmable() {
        Some(dimmable) => dimmable.set_dim(fader, value, fade),
        None => Ok(()),
    })
}

fn set_haze(fixtures: &[Fixture], fader: &Fader, value: u8, fade: Duration) -> Result<()> {
    dispatch(fixtures, |fixture| match fixture.as_hazeable() {
        Some(hazer) => hazer.set_haze(fader, value, fade),
        None => Ok(()),
    })
}

/// High-level lighting commands over named groups.
pub struct SceneManager {
    members: Members,
    fader: Arc<Fader>,
}

impl SceneManager {
    pub fn new(plot: Arc<Mutex<LightPlot>>, groups: GroupConfig, fader: Arc<Fader>) -> Self {
        Self {
            members: Members {
                plot,
                groups: Arc::new(groups),
            },
            fader,
        }
    }

    pub fn fader(&self) -> &Arc<Fader> {
        &self.fader
    }

    pub fn default_fade(&self) -> Duration {
        self.fader.default_fade()
    }

    /// Removes the fixture at the 0-based `index` from the plot and stops any
    /// fade still running on its channels.
    pub fn remove_fixture(&self, index: usize) -> Result<Option<Fixture>> {
        let removed = self.members.plot()?.remove(index)?;
        if let Some(fixture) = &removed {
            self.fader.cancel_addresses(&fixture.addresses());
        }
        Ok(removed)
    }

    /// Fixtures whose base address falls in `group`. Unknown groups are empty.
    pub fn group_fixtures(&self, group: &str) -> Result<Vec<Fixture>> {
        self.members.of(group)
    }

    pub fn set_color(&self, group: &str, color: Color, fade: Duration) -> Result<()> {
        let fixtures = self.members.of(group)?;
        trace!(group, ?color, members = fixtures.len(), "set color");
        dispatch(&fixtures, |fixture| match fixture.as_color() {
            Some(colored) => colored.set_color(&self.fader, color, fade),
            None => Ok(()),
        })
    }

    pub fn set_strobe(&self, group: &str, value: u8) -> Result<()> {
        let fixtures = self.members.of(group)?;
        dispatch(&fixtures, |fixture| match fixture.as_color() {
            Some(colored) => colored.set_strobe(&self.fader, value, Duration::ZERO),
            None => Ok(()),
        })
    }

    pub fn set_dim(&self, group: &str, value: u8, fade: Duration) -> Result<()> {
        set_dim(&self.members.of(group)?, &self.fader, value, fade)
    }

    /// Dims every fixture that belongs to at least one configured group.
    pub fn set_dim_all(&self, value: u8, fade: Duration) -> Result<()> {
        set_dim(&self.members.grouped()?, &self.fader, value, fade)
    }

    pub fn set_position(&self, group: &str, pan: u8, tilt: u8, fade: Duration) -> Result<()> {
        let fixtures = self.members.of(group)?;
        dispatch(&fixtures, |fixture| match fixture.as_positionable() {
            Some(head) => head.set_position(&self.fader, pan, tilt, fade),
            None => Ok(()),
        })
    }

    /// Moves every head relative to its base position, clamped to 0..=255.
    pub fn offset_position(
        &self,
        group: &str,
        pan_offset: i16,
        tilt_offset: i16,
        fade: Duration,
    ) -> Result<()> {
        let shift = |base: u8, offset: i16| (i16::from(base) + offset).clamp(0, 255) as u8;
        let fixtures = self.members.of(group)?;
        dispatch(&fixtures, |fixture| match fixture.as_positionable() {
            Some(head) => {
                let (pan, tilt) = head.base_position();
                head.set_position(
                    &self.fader,
                    shift(pan, pan_offset),
                    shift(tilt, tilt_offset),
                    fade,
                )
            }
            None => Ok(()),
        })
    }

    pub fn set_speed(&self, group: &str, value: u8) -> Result<()> {
        let fixtures = self.members.of(group)?;
        dispatch(&fixtures, |fixture| match fixture.as_positionable() {
            Some(head) => head.set_speed(&self.fader, value, Duration::ZERO),
            None => Ok(()),
        })
    }

    pub fn set_zoom(&self, group: &str, value: u8) -> Result<()> {
        let fixtures = self.members.of(group)?;
        dispatch(&fixtures, |fixture| match fixture.as_positionable() {
            Some(head) => head.set_zoom(&self.fader, value, Duration::ZERO),
            None => Ok(()),
        })
    }

    pub fn set_haze(&self, group: &str, value: u8, fade: Duration) -> Result<()> {
        set_haze(&self.members.of(group)?, &self.fader, value, fade)
    }

    pub fn set_fan(&self, group: &str, value: u8) -> Result<()> {
        let fixtures = self.members.of(group)?;
        dispatch(&fixtures, |fixture| match fixture.as_hazeable() {
            Some(hazer) => hazer.set_fan(&self.fader, value, Duration::ZERO),
            None => Ok(()),
        })
    }

    /// Flashes the group to the pulse intensity and schedules the restore,
    /// returning without waiting for it.
    pub fn pulse_on_beat(&self, group: &str, pulse: Pulse) -> Result<()> {
        let fixtures = self.members.of(group)?;
        if fixtures.is_empty() {
            return Ok(());
        }
        let flashed = set_dim(&fixtures, &self.fader, pulse.intensity, Duration::ZERO);

        let members = self.members.clone();
        let group = group.to_string();
        self.schedule(pulse.hold, move |fader| {
            // Membership is resolved again in case the plot changed meanwhile.
            let outcome = members
                .of(&group)
                .and_then(|fixtures| {
                    set_dim(&fixtures, fader, pulse.baseline, fader.default_fade())
                });
            if let Err(err) = outcome {
                warn!(group, error = %err, "pulse restore failed");
            }
        });
        flashed
    }

    /// Runs the hazers of `group` at full output for `duration`.
    pub fn haze_pulse(&self, group: &str, duration: Duration) -> Result<()> {
        let fixtures = self.members.of(group)?;
        let started = set_haze(&fixtures, &self.fader, 255, Duration::ZERO);

        let members = self.members.clone();
        let group = group.to_string();
        self.schedule(duration, move |fader| {
            let outcome = members
                .of(&group)
                .and_then(|fixtures| set_haze(&fixtures, fader, 0, Duration::ZERO));
            if let Err(err) = outcome {
                warn!(group, error = %err, "haze stop failed");
            }
        });
        started
    }

    /// Dims every fixture in the plot to zero.
    pub fn blackout(&self, fade: Duration) -> Result<()> {
        let fixtures = self.members.plot()?.fixtures().to_vec();
        debug!(fixtures = fixtures.len(), "blackout");
        set_dim(&fixtures, &self.fader, 0, fade)
    }

    /// Spreads `colors` evenly over the color-capable members, in plot order.
    /// Needs at least two colors.
    pub fn gradient_across_group(
        &self,
        group: &str,
        colors: &[Color],
        fade: Duration,
    ) -> Result<()> {
        if colors.len() < 2 {
            return Ok(());
        }
        let fixtures: Vec<_> = self
            .members
            .of(group)?
            .into_iter()
            .filter(|fixture| fixture.as_color().is_some())
            .collect();
        let count = fixtures.len();

        let mut index = 0;
        dispatch(&fixtures, |fixture| {
            let ratio = if count > 1 {
                index as f32 / (count - 1) as f32
            } else {
                0.0
            };
            index += 1;
            let color = gradient_color(colors, ratio);
            match fixture.as_color() {
                Some(colored) => colored.set_color(&self.fader, color, fade),
                None => Ok(()),
            }
        })
    }

    /// Rolls a tilt sine wave over the heads of `group`. The first step is
    /// written now, later steps run on the fader every `wave.delay`.
    pub fn wave_motion(&self, group: &str, wave: Wave) -> Result<()> {
        let heads: Vec<_> = self
            .members
            .of(group)?
            .into_iter()
            .filter(|fixture| fixture.as_positionable().is_some())
            .collect();
        if heads.is_empty() || wave.steps == 0 {
            return Ok(());
        }

        let heads = Arc::new(heads);
        wave_step(&heads, &self.fader, &wave, 0)?;
        for step in 1..wave.steps {
            let heads = heads.clone();
            self.schedule(wave.delay * step, move |fader| {
                if let Err(err) = wave_step(&heads, fader, &wave, step) {
                    warn!(step, error = %err, "wave step failed");
                }
            });
        }
        Ok(())
    }

    fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: FnOnce(&Fader) + Send + 'static,
    {
        let fader: Weak<Fader> = Arc::downgrade(&self.fader);
        self.fader.schedule(delay, move || {
            if let Some(fader) = fader.upgrade() {
                action(&fader);
            }
        });
    }
}

impl std::fmt::Debug for SceneManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneManager")
            .field("groups", &self.members.groups)
            .finish()
    }
}

/// Tilt of head `index` out of `count` at `step`.
fn wave_tilt(wave: &Wave, step: u32, index: usize, count: usize) -> u8 {
    let phase = (step as f32 + index as f32 / count as f32) * TAU / wave.steps as f32;
    (127.0 + phase.sin() * wave.amplitude).clamp(0.0, 255.0) as u8
}

fn wave_step(heads: &[Fixture], fader: &Fader, wave: &Wave, step: u32) -> Result<()> {
    let count = heads.len();
    let mut index = 0;
    dispatch(heads, |fixture| {
        let tilt = wave_tilt(wave, step, index, count);
        index += 1;
        match fixture.as_positionable() {
            Some(head) => head.set_position(fader, wave.pan, tilt, wave.fade),
            None => Ok(()),
        }
    })
}

/// Piecewise-linear color at `ratio` along `colors`, truncating components.
fn gradient_color(colors: &[Color], ratio: f32) -> Color {
    let last = colors.len() - 1;
    let position = ratio.clamp(0.0, 1.0) * last as f32;
    let low = (position as usize).min(last);
    let high = (low + 1).min(last);
    let t = position - low as f32;
    let mix = |a: u8, b: u8| (f32::from(a) * (1.0 - t) + f32::from(b) * t) as u8;
    let (a, b) = (colors[low], colors[high]);
    Color {
        r: mix(a.r, b.r),
        g: mix(a.g, b.g),
        b: mix(a.b, b.b),
        w: mix(a.w, b.w),
        uv: mix(a.uv, b.uv),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dmx::DmxBuffer,
        fixture::{FixtureKind, Head},
    };

    fn par(name: &str, address: u16) -> Fixture {
        Fixture::build(
            FixtureKind::Par,
            name,
            address,
            [("r", 1), ("g", 2), ("b", 3), ("dim", 4)],
        )
        .unwrap()
    }

    fn head(name: &str, address: u16) -> Fixture {
        Fixture::build(
            FixtureKind::Head,
            name,
            address,
            [("dim", 1), ("pan", 2), ("panF", 3), ("tilt", 4), ("tiltF", 5)],
        )
        .unwrap()
    }

    fn manager(
        fixtures: Vec<Fixture>,
        default_fade: Duration,
    ) -> (SceneManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut plot = LightPlot::load(dir.path().join("plot.ndjson")).unwrap();
        plot.remove(0).unwrap();
        for fixture in fixtures {
            plot.add(fixture).unwrap();
        }
        let fader = Fader::new(
            Arc::new(DmxBuffer::new()),
            Duration::from_millis(50),
            default_fade,
        );
        let scenes = SceneManager::new(
            Arc::new(Mutex::new(plot)),
            GroupConfig::default(),
            Arc::new(fader),
        );
        (scenes, dir)
    }

    fn value(scenes: &SceneManager, address: usize) -> u8 {
        scenes.fader().buffer().get_value(address)
    }

    #[test]
    fn membership_follows_base_address() {
        let (scenes, _dir) = manager(vec![par("a", 0), par("b", 60), par("c", 61)], Duration::ZERO);
        let names: Vec<_> = scenes
            .group_fixtures("bass")
            .unwrap()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(scenes.group_fixtures("nowhere").unwrap().is_empty());
    }

    #[test]
    fn empty_group_issues_no_writes() {
        let (scenes, _dir) = manager(vec![par("a", 0)], Duration::ZERO);
        scenes
            .set_color("highA", Color::rgb(255, 0, 0), Duration::ZERO)
            .unwrap();
        scenes.set_color("unknown", Color::rgb(255, 0, 0), Duration::ZERO).unwrap();
        assert!(scenes.fader().buffer().snapshot().iter().all(|&v| v == 0));
    }

    #[test]
    fn operations_skip_fixtures_without_the_capability() {
        let hazer = Fixture::build(FixtureKind::Hazer, "fog", 10, [("haze", 1)]).unwrap();
        let (scenes, _dir) = manager(vec![par("a", 0), hazer], Duration::ZERO);

        scenes.set_dim("bass", 200, Duration::ZERO).unwrap();
        scenes.set_position("bass", 10, 10, Duration::ZERO).unwrap();

        assert_eq!(value(&scenes, 3), 200);
        assert_eq!(value(&scenes, 10), 0);
    }

    #[test]
    fn pulse_restores_baseline_after_hold() {
        let (scenes, _dir) = manager(vec![par("a", 0)], Duration::ZERO);
        let pulse = Pulse {
            hold: Duration::ZERO,
            ..Pulse::default()
        };

        scenes.pulse_on_beat("bass", pulse).unwrap();
        assert_eq!(value(&scenes, 3), 255);
        assert_eq!(scenes.fader().pending_actions(), 1);

        scenes.fader().tick();
        assert_eq!(value(&scenes, 3), 128);
    }

    #[test]
    fn pulse_restores_valid_members_when_one_is_misaddressed() {
        let broken = Fixture::build(FixtureKind::Par, "broken", 30, [("dim", 500)]).unwrap();
        let (scenes, _dir) = manager(vec![par("a", 0), broken], Duration::ZERO);
        let pulse = Pulse {
            hold: Duration::ZERO,
            ..Pulse::default()
        };

        let err = scenes.pulse_on_beat("bass", pulse).unwrap_err();
        assert!(matches!(err, StageError::AddressOutOfRange { .. }));
        assert_eq!(value(&scenes, 3), 255);
        assert_eq!(scenes.fader().pending_actions(), 1);

        scenes.fader().tick();
        assert_eq!(value(&scenes, 3), 128);
    }

    #[test]
    fn haze_pulse_stops_even_when_a_hazer_is_misaddressed() {
        let fog = Fixture::build(FixtureKind::Hazer, "fog", 10, [("haze", 1)]).unwrap();
        let broken = Fixture::build(FixtureKind::Hazer, "broken", 20, [("haze", 600)]).unwrap();
        let (scenes, _dir) = manager(vec![fog, broken], Duration::ZERO);

        assert!(scenes.haze_pulse("bass", Duration::ZERO).is_err());
        assert_eq!(value(&scenes, 10), 255);

        scenes.fader().tick();
        assert_eq!(value(&scenes, 10), 0);
    }

    #[test]
    fn offset_position_is_relative_to_base() {
        let mut spot = Head::unpatched("spot", 100);
        spot.motion.pan = 1;
        spot.motion.tilt = 2;
        spot.base_tilt = 250;
        let (scenes, _dir) = manager(vec![Fixture::Head(spot)], Duration::ZERO);

        scenes.offset_position("midB", -27, 20, Duration::ZERO).unwrap();
        assert_eq!(value(&scenes, 100), 100);
        assert_eq!(value(&scenes, 101), 255);
    }

    #[test]
    fn gradient_spans_first_to_last_color() {
        let fixtures = vec![par("a", 161), par("b", 170), par("c", 180)];
        let (scenes, _dir) = manager(fixtures, Duration::ZERO);
        let colors = [Color::rgb(255, 0, 0), Color::rgb(0, 0, 255)];

        scenes.gradient_across_group("high", &colors, Duration::ZERO).unwrap();

        assert_eq!([value(&scenes, 161), value(&scenes, 163)], [255, 0]);
        assert_eq!([value(&scenes, 170), value(&scenes, 172)], [127, 127]);
        assert_eq!([value(&scenes, 180), value(&scenes, 182)], [0, 255]);
    }

    #[test]
    fn wave_schedules_remaining_steps() {
        let (scenes, _dir) = manager(vec![head("h1", 161), head("h2", 170)], Duration::ZERO);
        let wave = Wave {
            delay: Duration::ZERO,
            fade: Duration::ZERO,
            ..Wave::default()
        };

        scenes.wave_motion("high", wave).unwrap();
        assert_eq!(value(&scenes, 164), 127);
        assert_eq!(scenes.fader().pending_actions(), 5);

        scenes.fader().tick();
        assert_eq!(scenes.fader().pending_actions(), 0);
        assert_eq!(value(&scenes, 162), 127);
    }

    #[test]
    fn removing_a_fixture_stops_its_fades() {
        let (scenes, _dir) = manager(vec![par("a", 0), par("b", 10)], Duration::ZERO);
        scenes.set_dim("bass", 200, Duration::from_secs(1)).unwrap();
        assert!(scenes.fader().is_fading(3) && scenes.fader().is_fading(13));

        let removed = scenes.remove_fixture(0).unwrap().unwrap();
        assert_eq!(removed.name(), "a");
        assert!(!scenes.fader().is_fading(3));
        assert!(scenes.fader().is_fading(13));
        assert!(scenes.remove_fixture(7).unwrap().is_none());
    }

    #[test]
    fn blackout_dims_everything() {
        let (scenes, _dir) = manager(vec![par("a", 0), par("b", 300)], Duration::ZERO);
        scenes.set_dim_all(255, Duration::ZERO).unwrap();
        assert_eq!(value(&scenes, 303), 255);

        scenes.blackout(Duration::ZERO).unwrap();
        assert_eq!([value(&scenes, 3), value(&scenes, 303)], [0, 0]);
    }

    #[test]
    fn wave_tilt_follows_a_sine() {
        let wave = Wave::default();
        assert_eq!(wave_tilt(&wave, 0, 0, 1), 127);
        // A quarter turn into six steps is step 1.5.
        assert_eq!(wave_tilt(&wave, 1, 1, 2), 167);
    }
}
