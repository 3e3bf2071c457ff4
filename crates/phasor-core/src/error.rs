//! Controller error taxonomy.

use crate::id::{JunctionId, ProgramId, SegmentId};

/// Errors produced by controller and registry operations.
///
/// None of these are fatal to the per-tick pass: the registry degrades every
/// failure to "remove this junction or controller from the active set".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    /// A referenced junction no longer exists in the road network.
    #[error("junction {0} no longer exists")]
    TopologyInvalid(JunctionId),

    /// Writing a step's lights failed; the step is permanently invalid.
    /// `cause` is the write failure, absent on later ticks.
    #[error("step {step} of junction {junction} is corrupted")]
    StepCorrupted {
        junction: JunctionId,
        step: usize,
        #[source]
        cause: Option<Box<ControllerError>>,
    },

    /// A step snapshot and the live lights disagree on a segment end.
    #[error("segment {segment} of junction {junction} does not match the step snapshot")]
    LightWrite { junction: JunctionId, segment: SegmentId },

    /// A member's registry entry does not point back at its controller.
    #[error("junction {0} is not controlled by its node group's program")]
    ConsensusBroken(JunctionId),

    /// Every member of the node group was removed.
    #[error("node group is empty")]
    GroupEmpty,

    #[error("junction {0} is not signalized")]
    UnknownJunction(JunctionId),

    #[error("unknown program {0:?}")]
    UnknownProgram(ProgramId),

    #[error("junction {0} already belongs to a timed program")]
    AlreadyTimed(JunctionId),

    #[error("program has no steps")]
    NoSteps,

    #[error("step index {index} out of range for {count} steps")]
    StepIndexOutOfRange { index: usize, count: usize },

    /// A member's timeline has a different number of steps than the master's.
    #[error("junction {junction} has {found} steps, expected {expected}")]
    StepCountMismatch {
        junction: JunctionId,
        expected: usize,
        found: usize,
    },

    #[error("program is not running")]
    NotStarted,

    #[error("program must be stopped before its steps are edited")]
    Running,
}
