//! Patched lighting fixtures.
//!
//! A fixture record stores a 0-based base address plus 1-based channel
//! offsets; offset 0 means the parameter is not patched. Behaviour is exposed
//! through capability traits so callers can drive any fixture that supports
//! an operation without caring about its kind.

mod fade;
mod plot;

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{dmx::UNIVERSE_SIZE, Result, StageError};

pub use fade::Fader;
pub use plot::LightPlot;

/// Addressable fixture parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Param {
    Red,
    Green,
    Blue,
    White,
    Uv,
    Dim,
    ColorFade,
    Strobe,
    Pan,
    PanFine,
    Tilt,
    TiltFine,
    Speed,
    Zoom,
    Haze,
    Fan,
}

impl Param {
    /// Field name used in plot files.
    pub fn key(self) -> &'static str {
        match self {
            Param::Red => "r",
            Param::Green => "g",
            Param::Blue => "b",
            Param::White => "w",
            Param::Uv => "uv",
            Param::Dim => "dim",
            Param::ColorFade => "fade",
            Param::Strobe => "strobo",
            Param::Pan => "pan",
            Param::PanFine => "panF",
            Param::Tilt => "tilt",
            Param::TiltFine => "tiltF",
            Param::Speed => "speed",
            Param::Zoom => "zoom",
            Param::Haze => "haze",
            Param::Fan => "fan",
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Color with optional white and UV components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    #[serde(default)]
    pub w: u8,
    #[serde(default)]
    pub uv: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, w: 0, uv: 0 }
    }
}

impl From<[u8; 3]> for Color {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self::rgb(r, g, b)
    }
}

fn default_center() -> u8 {
    127
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimmer {
    pub name: String,
    pub address: u16,
    #[serde(default)]
    pub dim: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorChannels {
    pub r: u16,
    pub g: u16,
    pub b: u16,
    pub w: u16,
    pub uv: u16,
    pub dim: u16,
    pub fade: u16,
    #[serde(rename = "strobo", alias = "strobe")]
    pub strobe: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Par {
    pub name: String,
    pub address: u16,
    #[serde(flatten)]
    pub channels: ColorChannels,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionChannels {
    pub pan: u16,
    #[serde(rename = "panF")]
    pub pan_fine: u16,
    pub tilt: u16,
    #[serde(rename = "tiltF")]
    pub tilt_fine: u16,
    pub speed: u16,
    pub zoom: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub name: String,
    pub address: u16,
    #[serde(flatten)]
    pub color: ColorChannels,
    #[serde(flatten)]
    pub motion: MotionChannels,
    #[serde(default = "default_center")]
    pub base_pan: u8,
    #[serde(default = "default_center")]
    pub base_tilt: u8,
}

impl Head {
    /// Unpatched head with centred base position.
    pub fn unpatched(name: impl Into<String>, address: u16) -> Self {
        Self {
            name: name.into(),
            address,
            color: ColorChannels::default(),
            motion: MotionChannels::default(),
            base_pan: default_center(),
            base_tilt: default_center(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hazer {
    pub name: String,
    pub address: u16,
    #[serde(default)]
    pub haze: u16,
    #[serde(default)]
    pub fan: u16,
}

/// Kind of fixture, as written in the `type` field of a plot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureKind {
    Dimmer,
    Par,
    Head,
    Hazer,
}

impl FixtureKind {
    pub fn tag(self) -> &'static str {
        match self {
            FixtureKind::Dimmer => "dimr",
            FixtureKind::Par => "par",
            FixtureKind::Head => "head",
            FixtureKind::Hazer => "haze",
        }
    }

    /// Parameters a fixture of this kind can patch.
    pub fn params(self) -> &'static [Param] {
        match self {
            FixtureKind::Dimmer => &[Param::Dim],
            FixtureKind::Par => &COLOR_PARAMS,
            FixtureKind::Head => &HEAD_PARAMS,
            FixtureKind::Hazer => &[Param::Haze, Param::Fan],
        }
    }
}

impl FromStr for FixtureKind {
    type Err = StageError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dimr" | "dimmer" => Ok(FixtureKind::Dimmer),
            "par" => Ok(FixtureKind::Par),
            "head" => Ok(FixtureKind::Head),
            "haze" | "hazer" => Ok(FixtureKind::Hazer),
            other => Err(StageError::msg(format!(
                "unknown fixture type `{other}` (expected dimr, par, head or haze)"
            ))),
        }
    }
}

/// One patched fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Fixture {
    #[serde(rename = "dimr")]
    Dimmer(Dimmer),
    #[serde(rename = "par")]
    Par(Par),
    #[serde(rename = "head")]
    Head(Head),
    #[serde(rename = "haze")]
    Hazer(Hazer),
}

impl Fixture {
    /// Builds a fixture from a kind, a name, a base address and channel
    /// offsets keyed by their plot-file names (`r`, `dim`, `panF`, ...).
    /// Heads also accept `base_pan` and `base_tilt`.
    pub fn build<'a>(
        kind: FixtureKind,
        name: &str,
        address: u16,
        offsets: impl IntoIterator<Item = (&'a str, u16)>,
    ) -> Result<Self> {
        let mut record = serde_json::Map::new();
        record.insert("type".into(), kind.tag().into());
        record.insert("name".into(), name.into());
        record.insert("address".into(), address.into());
        for (key, offset) in offsets {
            let base = kind == FixtureKind::Head && matches!(key, "base_pan" | "base_tilt");
            let known = base
                || kind.params().iter().any(|param| {
                    param.key() == key || (*param == Param::Strobe && key == "strobe")
                });
            if !known {
                return Err(StageError::msg(format!(
                    "`{}` fixtures have no `{key}` channel",
                    kind.tag()
                )));
            }
            record.insert(key.to_string(), offset.into());
        }
        Ok(serde_json::from_value(serde_json::Value::Object(record))?)
    }

    pub fn name(&self) -> &str {
        match self {
            Fixture::Dimmer(f) => &f.name,
            Fixture::Par(f) => &f.name,
            Fixture::Head(f) => &f.name,
            Fixture::Hazer(f) => &f.name,
        }
    }

    /// 0-based base address.
    pub fn address(&self) -> u16 {
        match self {
            Fixture::Dimmer(f) => f.address,
            Fixture::Par(f) => f.address,
            Fixture::Head(f) => f.address,
            Fixture::Hazer(f) => f.address,
        }
    }

    pub fn kind(&self) -> FixtureKind {
        match self {
            Fixture::Dimmer(_) => FixtureKind::Dimmer,
            Fixture::Par(_) => FixtureKind::Par,
            Fixture::Head(_) => FixtureKind::Head,
            Fixture::Hazer(_) => FixtureKind::Hazer,
        }
    }

    pub fn params(&self) -> &'static [Param] {
        self.kind().params()
    }

    fn patch(&self) -> &dyn Patched {
        match self {
            Fixture::Dimmer(f) => f,
            Fixture::Par(f) => f,
            Fixture::Head(f) => f,
            Fixture::Hazer(f) => f,
        }
    }

    /// Absolute addresses of every patched parameter. Addresses are not
    /// range checked here.
    pub fn channel_map(&self) -> BTreeMap<Param, i64> {
        let patch = self.patch();
        self.params()
            .iter()
            .filter_map(|&param| patch.absolute(param).map(|address| (param, address)))
            .collect()
    }

    /// DMX address of `param`: `Ok(None)` when the parameter is not patched,
    /// an error when it falls outside the universe.
    pub fn resolve(&self, param: Param) -> Result<Option<usize>> {
        self.patch().resolve(param)
    }

    /// Every in-range address this fixture drives.
    pub fn addresses(&self) -> Vec<usize> {
        self.channel_map()
            .into_values()
            .filter_map(|address| usize::try_from(address).ok())
            .filter(|&address| address < UNIVERSE_SIZE)
            .collect()
    }

    pub fn as_dimmable(&self) -> Option<&dyn Dimmable> {
        match self {
            Fixture::Dimmer(f) => Some(f),
            Fixture::Par(f) => Some(f),
            Fixture::Head(f) => Some(f),
            Fixture::Hazer(_) => None,
        }
    }

    pub fn as_color(&self) -> Option<&dyn ColorCapable> {
        match self {
            Fixture::Par(f) => Some(f),
            Fixture::Head(f) => Some(f),
            Fixture::Dimmer(_) | Fixture::Hazer(_) => None,
        }
    }

    pub fn as_positionable(&self) -> Option<&dyn Positionable> {
        match self {
            Fixture::Head(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_hazeable(&self) -> Option<&dyn Hazeable> {
        match self {
            Fixture::Hazer(f) => Some(f),
            _ => None,
        }
    }
}

impl fmt::Display for Fixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel = u32::from(self.address()) + 1;
        write!(f, "{} `{}` @ {channel}", self.kind().tag(), self.name())
    }
}

/// Channel layout shared by every fixture record.
trait Patched {
    fn label(&self) -> &str;

    fn base(&self) -> u16;

    fn offset(&self, param: Param) -> u16;

    fn absolute(&self, param: Param) -> Option<i64> {
        match self.offset(param) {
            0 => None,
            offset => Some(i64::from(self.base()) + i64::from(offset) - 1),
        }
    }

    fn resolve(&self, param: Param) -> Result<Option<usize>> {
        let Some(address) = self.absolute(param) else {
            return Ok(None);
        };
        match usize::try_from(address) {
            Ok(index) if index < UNIVERSE_SIZE => Ok(Some(index)),
            _ => Err(StageError::AddressOutOfRange {
                fixture: self.label().to_string(),
                param: param.key().to_string(),
                address,
            }),
        }
    }

    /// Fades `param` to `value`. Unpatched parameters are skipped.
    fn write(&self, fader: &Fader, param: Param, value: u8, fade: Duration) -> Result<()> {
        if let Some(address) = self.resolve(param)? {
            fader.fade_to(address, value, fade);
        }
        Ok(())
    }
}

const COLOR_PARAMS: [Param; 8] = [
    Param::Red,
    Param::Green,
    Param::Blue,
    Param::White,
    Param::Uv,
    Param::Dim,
    Param::ColorFade,
    Param::Strobe,
];

const HEAD_PARAMS: [Param; 14] = [
    Param::Red,
    Param::Green,
    Param::Blue,
    Param::White,
    Param::Uv,
    Param::Dim,
    Param::ColorFade,
    Param::Strobe,
    Param::Pan,
    Param::PanFine,
    Param::Tilt,
    Param::TiltFine,
    Param::Speed,
    Param::Zoom,
];

impl ColorChannels {
    fn offset(&self, param: Param) -> u16 {
        match param {
            Param::Red => self.r,
            Param::Green => self.g,
            Param::Blue => self.b,
            Param::White => self.w,
            Param::Uv => self.uv,
            Param::Dim => self.dim,
            Param::ColorFade => self.fade,
            Param::Strobe => self.strobe,
            _ => 0,
        }
    }
}

impl Patched for Dimmer {
    fn label(&self) -> &str {
        &self.name
    }

    fn base(&self) -> u16 {
        self.address
    }

    fn offset(&self, param: Param) -> u16 {
        match param {
            Param::Dim => self.dim,
            _ => 0,
        }
    }
}

impl Patched for Par {
    fn label(&self) -> &str {
        &self.name
    }

    fn base(&self) -> u16 {
        self.address
    }

    fn offset(&self, param: Param) -> u16 {
        self.channels.offset(param)
    }
}

impl Patched for Head {
    fn label(&self) -> &str {
        &self.name
    }

    fn base(&self) -> u16 {
        self.address
    }

    fn offset(&self, param: Param) -> u16 {
        match param {
            Param::Pan => self.motion.pan,
            Param::PanFine => self.motion.pan_fine,
            Param::Tilt => self.motion.tilt,
            Param::TiltFine => self.motion.tilt_fine,
            Param::Speed => self.motion.speed,
            Param::Zoom => self.motion.zoom,
            other => self.color.offset(other),
        }
    }
}

impl Patched for Hazer {
    fn label(&self) -> &str {
        &self.name
    }

    fn base(&self) -> u16 {
        self.address
    }

    fn offset(&self, param: Param) -> u16 {
        match param {
            Param::Haze => self.haze,
            Param::Fan => self.fan,
            _ => 0,
        }
    }
}

/// Fixtures with an intensity channel.
pub trait Dimmable {
    fn set_dim(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()>;
}

/// Fixtures with color mixing.
pub trait ColorCapable {
    /// Writes every patched color component; `w` and `uv` only reach fixtures
    /// that have those channels.
    fn set_color(&self, fader: &Fader, color: Color, fade: Duration) -> Result<()>;

    fn set_strobe(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()>;
}

/// Moving heads.
pub trait Positionable {
    /// Sets coarse pan and tilt; fine channels, when patched, are zeroed.
    fn set_position(&self, fader: &Fader, pan: u8, tilt: u8, fade: Duration) -> Result<()>;

    fn set_speed(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()>;

    fn set_zoom(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()>;

    /// Rest position `(pan, tilt)` that offsets are applied to.
    fn base_position(&self) -> (u8, u8);
}

/// Atmosphere generators.
pub trait Hazeable {
    fn set_haze(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()>;

    fn set_fan(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()>;
}

impl Dimmable for Dimmer {
    fn set_dim(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()> {
        self.write(fader, Param::Dim, value, fade)
    }
}

impl Dimmable for Par {
    fn set_dim(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()> {
        self.write(fader, Param::Dim, value, fade)
    }
}

impl Dimmable for Head {
    fn set_dim(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()> {
        self.write(fader, Param::Dim, value, fade)
    }
}

fn write_color(patch: &dyn Patched, fader: &Fader, color: Color, fade: Duration) -> Result<()> {
    let components = [
        (Param::Red, color.r),
        (Param::Green, color.g),
        (Param::Blue, color.b),
        (Param::White, color.w),
        (Param::Uv, color.uv),
    ];
    write_each(patch, fader, &components, fade)
}

/// Writes every `(param, value)` pair, returning the first rejected write
/// once the rest have been attempted.
fn write_each(
    patch: &dyn Patched,
    fader: &Fader,
    values: &[(Param, u8)],
    fade: Duration,
) -> Result<()> {
    let mut first_error = None;
    for &(param, value) in values {
        if let Err(err) = patch.write(fader, param, value, fade) {
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

impl ColorCapable for Par {
    fn set_color(&self, fader: &Fader, color: Color, fade: Duration) -> Result<()> {
        write_color(self, fader, color, fade)
    }

    fn set_strobe(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()> {
        self.write(fader, Param::Strobe, value, fade)
    }
}

impl ColorCapable for Head {
    fn set_color(&self, fader: &Fader, color: Color, fade: Duration) -> Result<()> {
        write_color(self, fader, color, fade)
    }

    fn set_strobe(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()> {
        self.write(fader, Param::Strobe, value, fade)
    }
}

impl Positionable for Head {
    fn set_position(&self, fader: &Fader, pan: u8, tilt: u8, fade: Duration) -> Result<()> {
        let values = [
            (Param::Pan, pan),
            (Param::PanFine, 0),
            (Param::Tilt, tilt),
            (Param::TiltFine, 0),
        ];
        write_each(self, fader, &values, fade)
    }

    fn set_speed(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()> {
        self.write(fader, Param::Speed, value, fade)
    }

    fn set_zoom(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()> {
        self.write(fader, Param::Zoom, value, fade)
    }

    fn base_position(&self) -> (u8, u8) {
        (self.base_pan, self.base_tilt)
    }
}

impl Hazeable for Hazer {
    fn set_haze(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()> {
        self.write(fader, Param::Haze, value, fade)
    }

    fn set_fan(&self, fader: &Fader, value: u8, fade: Duration) -> Result<()> {
        self.write(fader, Param::Fan, value, fade)
    }
}
