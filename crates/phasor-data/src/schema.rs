//! Serde data file structs for controller configuration and signal programs.
//!
//! These structs define the on-disk format. They are deserialized from RON,
//! JSON, or TOML data files and then resolved into core types by the loader.

use serde::Deserialize;

use phasor_core::light::{LightColor, Mode};

// ===========================================================================
// Controller configuration
// ===========================================================================

/// Registry tunables. Every field is optional; missing ones keep the
/// built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigData {
    /// Weight of the previous flow/wait reading, in `0..=1`.
    pub smoothing_previous_weight: Option<f64>,
    pub phase_shift: Option<u32>,
    pub metric_shift: Option<u32>,
    pub queue_decay: Option<f64>,
    pub default_wait_flow_balance: Option<f64>,
    /// Name of a step change metric, e.g. `"first_wait"`.
    pub default_change_metric: Option<String>,
    /// Bounds of steps that omit their own.
    pub default_min_ticks: Option<u64>,
    pub default_max_ticks: Option<u64>,
    pub event_history: Option<usize>,
}

// ===========================================================================
// Programs
// ===========================================================================

/// A timed program spanning one or more junctions. The first junction is
/// master.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgramData {
    pub name: String,
    pub junctions: Vec<u16>,
    /// Start the program once it is installed.
    #[serde(default)]
    pub start: bool,
    pub steps: Vec<StepData>,
}

/// One step of a program, shared by every member junction. Omitted bounds,
/// balance and change metric fall back to the controller configuration.
///
/// RON files need `#![enable(implicit_some)]` to write the optional bounds
/// as bare numbers.
#[derive(Debug, Clone, Deserialize)]
pub struct StepData {
    #[serde(default)]
    pub min_ticks: Option<i64>,
    #[serde(default)]
    pub max_ticks: Option<i64>,
    #[serde(default)]
    pub wait_flow_balance: Option<f64>,
    #[serde(default)]
    pub change_metric: Option<String>,
    /// Lights that are not red in this step. Every other light is red.
    #[serde(default)]
    pub lights: Vec<LightData>,
    /// Pedestrian signals pinned for this step.
    #[serde(default)]
    pub pedestrians: Vec<PedestrianData>,
}

/// Colors of one light at one segment end. `left` and `right` follow
/// `main` when omitted.
#[derive(Debug, Clone, Deserialize)]
pub struct LightData {
    pub junction: u16,
    pub segment: u16,
    /// Vehicle class name; the default light when omitted.
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub mode: ModeData,
    pub main: ColorData,
    #[serde(default)]
    pub left: Option<ColorData>,
    #[serde(default)]
    pub right: Option<ColorData>,
}

impl LightData {
    pub fn arrows(&self) -> (LightColor, LightColor, LightColor) {
        let main = self.main;
        (
            self.left.unwrap_or(main).into(),
            main.into(),
            self.right.unwrap_or(main).into(),
        )
    }
}

/// A manually pinned pedestrian signal.
#[derive(Debug, Clone, Deserialize)]
pub struct PedestrianData {
    pub junction: u16,
    pub segment: u16,
    pub color: ColorData,
}

/// A steady light color as written in data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorData {
    Red,
    Green,
}

impl From<ColorData> for LightColor {
    fn from(c: ColorData) -> Self {
        match c {
            ColorData::Red => LightColor::Red,
            ColorData::Green => LightColor::Green,
        }
    }
}

/// Which arrows a light shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeData {
    #[default]
    Simple,
    SingleLeft,
    SingleRight,
    All,
}

impl From<ModeData> for Mode {
    fn from(m: ModeData) -> Self {
        match m {
            ModeData::Simple => Mode::Simple,
            ModeData::SingleLeft => Mode::SingleLeft,
            ModeData::SingleRight => Mode::SingleRight,
            ModeData::All => Mode::All,
        }
    }
}
