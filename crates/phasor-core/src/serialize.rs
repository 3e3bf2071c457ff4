//! Persistence of registry state.
//!
//! Snapshots are encoded with `bitcode` behind a versioned header. Only
//! configuration is persisted: node-group membership, the ordered steps of
//! each member with their timing, and every light's mode and colors. Runtime
//! decision state is rebuilt when a program restarts after loading.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::fixed::Ticks;
use crate::id::JunctionId;
use crate::junction::JunctionLights;
use crate::light_group::SegmentEndLightGroup;
use crate::program::{JunctionTimeline, ProgramController};
use crate::step::{StepState, StepTiming};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a registry snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0x5048_5301;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

/// Errors that can occur during deserialization.
#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
    #[error("stored program is inconsistent: {0}")]
    InvalidProgram(#[from] ControllerError),
}

// ---------------------------------------------------------------------------
// Snapshot header
// ---------------------------------------------------------------------------

/// Header prepended to every serialized snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// Phase tick at the time the snapshot was taken.
    pub phase_tick: Ticks,
    /// Metric tick at the time the snapshot was taken.
    pub metric_tick: Ticks,
}

impl SnapshotHeader {
    pub fn new(phase_tick: Ticks, metric_tick: Ticks) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            phase_tick,
            metric_tick,
        }
    }

    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One step of one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub timing: StepTiming,
    pub groups: Vec<SegmentEndLightGroup>,
}

impl StepRecord {
    pub fn from_step(step: &StepState) -> Self {
        Self {
            timing: step.timing(),
            groups: step.groups().cloned().collect(),
        }
    }

    /// Rebuild the step. Stored timing is clamped again.
    pub fn into_step(self) -> StepState {
        let t = self.timing;
        let timing = StepTiming::clamped(
            i64::try_from(t.min_ticks()).unwrap_or(i64::MAX),
            i64::try_from(t.max_ticks()).unwrap_or(i64::MAX),
            t.wait_flow_balance(),
            t.change_metric(),
        );
        StepState::from_groups(timing, self.groups)
    }
}

/// The steps of one node-group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineRecord {
    pub junction: JunctionId,
    pub steps: Vec<StepRecord>,
}

/// A timed program: members in node-group order, master first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRecord {
    pub members: Vec<TimelineRecord>,
    pub started: bool,
    pub test_mode: bool,
    pub current_step: usize,
}

impl ProgramRecord {
    pub fn from_program(program: &ProgramController) -> Self {
        Self {
            members: program
                .timelines()
                .map(|t| TimelineRecord {
                    junction: t.junction,
                    steps: t.steps().iter().map(StepRecord::from_step).collect(),
                })
                .collect(),
            started: program.is_started(),
            test_mode: program.is_test_mode(),
            current_step: program.current_step(),
        }
    }

    /// A stopped program with the recorded steps. Callers restart it.
    pub fn into_program(self) -> Result<ProgramController, ControllerError> {
        let timelines = self
            .members
            .into_iter()
            .map(|m| {
                let steps = m.steps.into_iter().map(StepRecord::into_step).collect();
                JunctionTimeline::from_steps(m.junction, steps)
            })
            .collect();
        let mut program = ProgramController::from_timelines(timelines)?;
        program.set_test_mode(self.test_mode);
        Ok(program)
    }
}

/// Everything a registry persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub header: SnapshotHeader,
    pub config: ControllerConfig,
    pub manual: Vec<JunctionId>,
    pub programs: Vec<ProgramRecord>,
    pub lights: Vec<JunctionLights>,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub fn encode(snapshot: &RegistrySnapshot) -> Result<Vec<u8>, SerializeError> {
    bitcode::serialize(snapshot).map_err(|e| SerializeError::Encode(e.to_string()))
}

/// Decode and validate a snapshot.
pub fn decode(data: &[u8]) -> Result<RegistrySnapshot, DeserializeError> {
    let snapshot: RegistrySnapshot =
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
    snapshot.header.validate()?;
    Ok(snapshot)
}
