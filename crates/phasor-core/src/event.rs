//! Controller events with a pre-allocated ring buffer.
//!
//! The registry records one [`ControllerEvent`] for every observable state
//! transition during a pass. The events of the latest pass are returned from
//! `JunctionRegistry::simulation_step`; a bounded history is kept in an
//! [`EventBuffer`] for UIs and debugging.

use crate::fixed::Ticks;
use crate::id::{JunctionId, ProgramId};

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Why a timed program stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// An operator stopped or removed the program.
    Requested,
    /// The node group lost every member.
    GroupEmpty,
    /// A step failed to write its lights.
    StepCorrupted,
    /// The master junction no longer exists.
    TopologyInvalid,
}

/// Why a junction left its node group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Requested,
    TopologyInvalid,
    ConsensusBroken,
}

/// A controller event. All events carry the phase tick at which they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    ProgramStarted {
        program: ProgramId,
        tick: Ticks,
    },
    ProgramStopped {
        program: ProgramId,
        reason: StopReason,
        tick: Ticks,
    },
    /// The master decided the current phase is over; the end transition is showing.
    PhaseEnding {
        program: ProgramId,
        step: usize,
        tick: Ticks,
    },
    /// Every member of the node group switched to `step` on this tick.
    PhaseAdvanced {
        program: ProgramId,
        step: usize,
        tick: Ticks,
    },
    MemberRemoved {
        program: ProgramId,
        junction: JunctionId,
        reason: RemovalReason,
        tick: Ticks,
    },
    StepInvalidated {
        program: ProgramId,
        junction: JunctionId,
        step: usize,
        tick: Ticks,
    },
    /// A junction's live lights were rebuilt after a topology change.
    LightsRebuilt {
        junction: JunctionId,
        tick: Ticks,
    },
}

/// Discriminant tag for event types, used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProgramStarted,
    ProgramStopped,
    PhaseEnding,
    PhaseAdvanced,
    MemberRemoved,
    StepInvalidated,
    LightsRebuilt,
}

impl ControllerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ControllerEvent::ProgramStarted { .. } => EventKind::ProgramStarted,
            ControllerEvent::ProgramStopped { .. } => EventKind::ProgramStopped,
            ControllerEvent::PhaseEnding { .. } => EventKind::PhaseEnding,
            ControllerEvent::PhaseAdvanced { .. } => EventKind::PhaseAdvanced,
            ControllerEvent::MemberRemoved { .. } => EventKind::MemberRemoved,
            ControllerEvent::StepInvalidated { .. } => EventKind::StepInvalidated,
            ControllerEvent::LightsRebuilt { .. } => EventKind::LightsRebuilt,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBuffer: pre-allocated ring buffer
// ---------------------------------------------------------------------------

/// A pre-allocated ring buffer for events. Fixed capacity; when full, the
/// oldest events are dropped.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<Option<ControllerEvent>>,
    /// Write position (wraps around).
    head: usize,
    len: usize,
}

impl EventBuffer {
    /// Create a new ring buffer with the given capacity.
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    /// Push an event into the ring buffer. If full, the oldest event is dropped.
    pub fn push(&mut self, event: ControllerEvent) {
        let capacity = self.capacity();
        self.events[self.head] = Some(event);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over events in order from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &ControllerEvent> {
        let start = if self.len < self.capacity() { 0 } else { self.head };
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.events[(start + i) % capacity].as_ref())
    }

    /// Events of one kind, oldest first.
    pub fn of_kind(&self, kind: EventKind) -> impl Iterator<Item = &ControllerEvent> {
        self.iter().filter(move |e| e.kind() == kind)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.events {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(256)
    }
}
