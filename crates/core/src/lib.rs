//! Core library for the beatlights stage controller.
//!
//! Audio flows from an [`AudioSource`] through the concurrent analysis
//! [`AudioPipeline`] into a shared [`AudioState`]. The [`AudioReactor`] turns
//! that state into group commands on the [`SceneManager`], which drives
//! patched fixtures through the [`Fader`] into the [`DmxBuffer`] that the
//! [`DmxOutput`] loop transmits.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod dmx;
pub mod error;
pub mod fixture;
pub mod mapping;
pub mod pipeline;
pub mod scene;
pub mod timeline;

pub use analysis::{AudioState, ChordQuality};
#[cfg(feature = "live")]
pub use audio::LiveSource;
pub use audio::{AudioSource, FileSource};
pub use config::{AppConfig, AudioConfig, DmxConfig, GroupConfig};
pub use dmx::{DmxBuffer, DmxOutput, SerialTransmitter, SimulatedTransmitter, Transmitter};
pub use error::{Result, StageError};
pub use fixture::{Color, Fader, Fixture, FixtureKind, LightPlot, Param};
pub use mapping::{AudioReactor, LightingMode, LightingModes};
pub use pipeline::{AudioPipeline, BeatListener};
pub use scene::{Pulse, SceneManager, Wave};
pub use timeline::{PlaybackClock, Shutdown, ShutdownTrigger};
