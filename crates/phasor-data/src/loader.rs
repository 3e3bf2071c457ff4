//! Resolution pipeline: reads data files, resolves names, installs programs.
//!
//! Provides format detection (RON/JSON/TOML), file discovery, and
//! deserialization helpers, plus [`load_signal_plan`] and
//! [`install_programs`] which turn a data directory into running controllers.

use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use phasor_core::config::{ControllerConfig, FlowWaitSmoothing};
use phasor_core::error::ControllerError;
use phasor_core::fixed::Fixed64;
use phasor_core::id::{JunctionId, ProgramId, SegmentId};
use phasor_core::light::{LightColor, Mode};
use phasor_core::registry::JunctionRegistry;
use phasor_core::services::Services;
use phasor_core::step::{StepChangeMetric, StepTiming};
use phasor_core::vehicle::VehicleClass;

use crate::schema::{ConfigData, ProgramData, StepData};

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// A required data file was not found in the given directory.
    #[error("required file '{file}' not found in {dir}")]
    MissingRequired { file: String, dir: PathBuf },

    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two files with the same base name but different formats exist.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    /// A deserialization error occurred.
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// A name reference could not be resolved.
    #[error("unresolved {expected_kind} reference '{name}' in {file}")]
    UnresolvedRef {
        file: PathBuf,
        name: String,
        expected_kind: &'static str,
    },

    /// A duplicate name was found.
    #[error("duplicate name '{name}' in {file}")]
    DuplicateName { file: PathBuf, name: String },

    /// A number cannot be represented.
    #[error("value {value} for '{field}' in {file} is out of range")]
    OutOfRange {
        file: PathBuf,
        field: &'static str,
        value: f64,
    },

    /// The registry refused a program.
    #[error("program '{program}' could not be installed: {source}")]
    Install {
        program: String,
        #[source]
        source: ControllerError,
    },

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

/// Supported data file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<Format, DataLoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(DataLoadError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// File discovery
// ===========================================================================

/// Scan a directory for a data file with the given base name (without extension).
///
/// Looks for `{base_name}.ron`, `{base_name}.toml`, and `{base_name}.json`.
/// Returns `Ok(None)` if no file is found, or `Err(ConflictingFormats)` if
/// multiple formats exist for the same base name.
pub fn find_data_file(dir: &Path, base_name: &str) -> Result<Option<PathBuf>, DataLoadError> {
    let mut found: Option<PathBuf> = None;
    for ext in ["ron", "toml", "json"] {
        let candidate = dir.join(format!("{base_name}.{ext}"));
        if candidate.exists() {
            if let Some(existing) = found {
                return Err(DataLoadError::ConflictingFormats {
                    a: existing,
                    b: candidate,
                });
            }
            found = Some(candidate);
        }
    }
    Ok(found)
}

/// Like [`find_data_file`], but returns an error if no file is found.
pub fn require_data_file(dir: &Path, base_name: &str) -> Result<PathBuf, DataLoadError> {
    find_data_file(dir, base_name)?.ok_or_else(|| DataLoadError::MissingRequired {
        file: base_name.to_string(),
        dir: dir.to_path_buf(),
    })
}

// ===========================================================================
// Deserialization
// ===========================================================================

fn parse_error(path: &Path, detail: impl ToString) -> DataLoadError {
    DataLoadError::Parse {
        file: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Read a file and deserialize it according to its format (detected from extension).
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Toml => toml::from_str(&content).map_err(|e| parse_error(path, e)),
    }
}

/// Deserialize a list from a file. For TOML files, extracts the array at the
/// given `toml_key` from a top-level table. For RON and JSON, deserializes
/// directly as `Vec<T>`.
pub fn deserialize_list<T: DeserializeOwned>(path: &Path, toml_key: &str) -> Result<Vec<T>, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Toml => {
            let table: toml::Value = toml::from_str(&content).map_err(|e| parse_error(path, e))?;
            let array = table
                .get(toml_key)
                .ok_or_else(|| parse_error(path, format!("missing key '{toml_key}' in TOML file")))?
                .clone();
            array.try_into().map_err(|e: toml::de::Error| parse_error(path, e))
        }
    }
}

// ===========================================================================
// Configuration
// ===========================================================================

fn to_fixed(value: f64, field: &'static str, file: &Path) -> Result<Fixed64, DataLoadError> {
    let converted = value.is_finite().then(|| Fixed64::checked_from_num(value)).flatten();
    converted.ok_or_else(|| DataLoadError::OutOfRange {
        file: file.to_path_buf(),
        field,
        value,
    })
}

fn resolve_metric(name: &str, file: &Path) -> Result<StepChangeMetric, DataLoadError> {
    StepChangeMetric::from_name(name).ok_or_else(|| DataLoadError::UnresolvedRef {
        file: file.to_path_buf(),
        name: name.to_string(),
        expected_kind: "change metric",
    })
}

/// Overlay a configuration file onto the built-in defaults.
pub fn resolve_config(data: &ConfigData, file: &Path) -> Result<ControllerConfig, DataLoadError> {
    let mut config = ControllerConfig::default();
    if let Some(w) = data.smoothing_previous_weight {
        config.smoothing = FlowWaitSmoothing::new(to_fixed(w, "smoothing_previous_weight", file)?);
    }
    if let Some(shift) = data.phase_shift {
        config.tick_scale.phase_shift = shift;
    }
    if let Some(shift) = data.metric_shift {
        config.tick_scale.metric_shift = shift;
    }
    if let Some(decay) = data.queue_decay {
        config.queue_decay = to_fixed(decay, "queue_decay", file)?;
    }
    if let Some(balance) = data.default_wait_flow_balance {
        config.default_wait_flow_balance = to_fixed(balance, "default_wait_flow_balance", file)?;
    }
    if let Some(name) = &data.default_change_metric {
        config.default_change_metric = resolve_metric(name, file)?;
    }
    if let Some(min) = data.default_min_ticks {
        config.default_min_ticks = min;
    }
    if let Some(max) = data.default_max_ticks {
        config.default_max_ticks = max;
    }
    if let Some(capacity) = data.event_history {
        config.event_history = capacity;
    }
    Ok(config)
}

/// Load `controller.{ron,toml,json}` from `dir`, or the defaults when absent.
pub fn load_controller_config(dir: &Path) -> Result<ControllerConfig, DataLoadError> {
    match find_data_file(dir, "controller")? {
        Some(path) => {
            let data: ConfigData = deserialize_file(&path)?;
            resolve_config(&data, &path)
        }
        None => Ok(ControllerConfig::default()),
    }
}

// ===========================================================================
// Programs
// ===========================================================================

/// Everything a data directory defines.
#[derive(Debug, Clone)]
pub struct SignalPlan {
    pub config: ControllerConfig,
    pub programs: Vec<ProgramData>,
    /// File the programs came from, for error reporting.
    pub programs_file: PathBuf,
}

/// Load `programs.{ron,toml,json}` from `dir`. The file must exist and
/// program names must be unique.
pub fn load_programs(dir: &Path) -> Result<(Vec<ProgramData>, PathBuf), DataLoadError> {
    let path = require_data_file(dir, "programs")?;
    let programs: Vec<ProgramData> = deserialize_list(&path, "programs")?;
    let mut seen = HashSet::new();
    for program in &programs {
        check_duplicate(&mut seen, &program.name, &path)?;
    }
    Ok((programs, path))
}

/// Load the controller configuration and program definitions of a directory.
pub fn load_signal_plan(dir: &Path) -> Result<SignalPlan, DataLoadError> {
    let config = load_controller_config(dir)?;
    let (programs, programs_file) = load_programs(dir)?;
    tracing::info!(dir = %dir.display(), programs = programs.len(), "signal plan loaded");
    Ok(SignalPlan {
        config,
        programs,
        programs_file,
    })
}

/// A light entry with every name resolved.
struct ResolvedLight {
    junction: JunctionId,
    segment: SegmentId,
    class: VehicleClass,
    mode: Mode,
    arrows: (LightColor, LightColor, LightColor),
}

struct ResolvedStep {
    timing: StepTiming,
    lights: Vec<ResolvedLight>,
    pedestrians: Vec<(JunctionId, SegmentId, LightColor)>,
}

fn member(junctions: &[JunctionId], id: u16, file: &Path) -> Result<JunctionId, DataLoadError> {
    let junction = JunctionId(id);
    if junctions.contains(&junction) {
        Ok(junction)
    } else {
        Err(DataLoadError::UnresolvedRef {
            file: file.to_path_buf(),
            name: junction.to_string(),
            expected_kind: "program junction",
        })
    }
}

fn resolve_step(
    step: &StepData,
    junctions: &[JunctionId],
    config: &ControllerConfig,
    file: &Path,
) -> Result<ResolvedStep, DataLoadError> {
    let defaults = StepTiming::from_config(config);
    let bound = |ticks: Option<i64>, default: u64| ticks.unwrap_or_else(|| i64::try_from(default).unwrap_or(i64::MAX));
    let mut timing = StepTiming::clamped(
        bound(step.min_ticks, defaults.min_ticks()),
        bound(step.max_ticks, defaults.max_ticks()),
        defaults.wait_flow_balance(),
        defaults.change_metric(),
    );
    if let Some(b) = step.wait_flow_balance {
        timing = timing.with_balance(to_fixed(b, "wait_flow_balance", file)?);
    }
    if let Some(name) = &step.change_metric {
        timing = timing.with_change_metric(resolve_metric(name, file)?);
    }

    let mut lights = Vec::with_capacity(step.lights.len());
    for light in &step.lights {
        let class = match &light.class {
            Some(name) => VehicleClass::parse_name(name).ok_or_else(|| DataLoadError::UnresolvedRef {
                file: file.to_path_buf(),
                name: name.clone(),
                expected_kind: "vehicle class",
            })?,
            None => VehicleClass::GENERAL,
        };
        lights.push(ResolvedLight {
            junction: member(junctions, light.junction, file)?,
            segment: SegmentId(light.segment),
            class,
            mode: light.mode.into(),
            arrows: light.arrows(),
        });
    }
    let pedestrians = step
        .pedestrians
        .iter()
        .map(|p| Ok((member(junctions, p.junction, file)?, SegmentId(p.segment), p.color.into())))
        .collect::<Result<Vec<_>, DataLoadError>>()?;
    Ok(ResolvedStep {
        timing,
        lights,
        pedestrians,
    })
}

/// Set up, record and optionally start every program of `programs`.
///
/// Names are resolved before the registry is touched. Installation is
/// all-or-nothing: when any program fails, every junction this call
/// signalized is removed again.
pub fn install_programs(
    registry: &mut JunctionRegistry,
    programs: &[ProgramData],
    services: &Services<'_>,
    file: &Path,
) -> Result<BTreeMap<String, ProgramId>, DataLoadError> {
    let resolved = programs
        .iter()
        .map(|program| -> Result<_, DataLoadError> {
            let junctions: Vec<JunctionId> = program.junctions.iter().copied().map(JunctionId).collect();
            let steps = program
                .steps
                .iter()
                .map(|s| resolve_step(s, &junctions, registry.config(), file))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((program, junctions, steps))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut installed = BTreeMap::new();
    let mut signalized: Vec<JunctionId> = Vec::new();
    for (program, junctions, steps) in &resolved {
        let result = install_program(registry, program, junctions, steps, services, file, &mut signalized);
        match result {
            Ok(id) => {
                tracing::info!(program = %program.name, steps = steps.len(), started = program.start, "program installed");
                installed.insert(program.name.clone(), id);
            }
            Err(err) => {
                roll_back(registry, &signalized);
                return Err(err);
            }
        }
    }
    Ok(installed)
}

fn install_program(
    registry: &mut JunctionRegistry,
    program: &ProgramData,
    junctions: &[JunctionId],
    steps: &[ResolvedStep],
    services: &Services<'_>,
    file: &Path,
    signalized: &mut Vec<JunctionId>,
) -> Result<ProgramId, DataLoadError> {
    let id = registry
        .set_up_timed_program(junctions, services)
        .map_err(|source| DataLoadError::Install {
            program: program.name.clone(),
            source,
        })?;
    signalized.extend_from_slice(junctions);
    record_steps(registry, id, junctions, steps, program.start, services).map_err(|err| match err {
        RecordError::Segment(segment) => DataLoadError::UnresolvedRef {
            file: file.to_path_buf(),
            name: segment.to_string(),
            expected_kind: "segment",
        },
        RecordError::Controller(source) => DataLoadError::Install {
            program: program.name.clone(),
            source,
        },
    })?;
    Ok(id)
}

/// Unsignalize every junction of a failed installation.
fn roll_back(registry: &mut JunctionRegistry, junctions: &[JunctionId]) {
    for &junction in junctions {
        if let Err(err) = registry.remove_junction(junction) {
            tracing::warn!(junction = %junction, error = %err, "install rollback failed");
        }
    }
    tracing::warn!(junctions = junctions.len(), "program installation rolled back");
}

enum RecordError {
    Segment(SegmentId),
    Controller(ControllerError),
}

impl From<ControllerError> for RecordError {
    fn from(err: ControllerError) -> Self {
        RecordError::Controller(err)
    }
}

fn record_steps(
    registry: &mut JunctionRegistry,
    id: ProgramId,
    junctions: &[JunctionId],
    steps: &[ResolvedStep],
    start: bool,
    services: &Services<'_>,
) -> Result<(), RecordError> {
    for step in steps {
        for &junction in junctions {
            let lights = registry
                .lights_mut(junction)
                .ok_or(ControllerError::UnknownJunction(junction))?;
            lights.make_red();
            for (_, group) in lights.groups_mut() {
                group.set_manual_pedestrian(None);
            }
        }
        for light in &step.lights {
            let group = registry
                .lights_mut(light.junction)
                .and_then(|l| l.group_mut(light.segment))
                .ok_or(RecordError::Segment(light.segment))?;
            let state = group.light_mut(light.class);
            state.set_mode(light.mode);
            let (left, main, right) = light.arrows;
            state.set_colors(left, main, right);
        }
        for &(junction, segment, color) in &step.pedestrians {
            let group = registry
                .lights_mut(junction)
                .and_then(|l| l.group_mut(segment))
                .ok_or(RecordError::Segment(segment))?;
            group.set_manual_pedestrian(Some(color));
        }
        registry.add_step(id, step.timing)?;
    }
    if start {
        registry.start_program(id, services)?;
    }
    Ok(())
}

// ===========================================================================
// Name resolution helpers
// ===========================================================================

/// Record `name` as seen, returning a `DuplicateName` error if it already
/// was.
pub fn check_duplicate<'a>(seen: &mut HashSet<&'a str>, name: &'a str, file: &Path) -> Result<(), DataLoadError> {
    if seen.insert(name) {
        Ok(())
    } else {
        Err(DataLoadError::DuplicateName {
            file: file.to_path_buf(),
            name: name.to_string(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
