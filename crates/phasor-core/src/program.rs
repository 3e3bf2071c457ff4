//! Timed programs and node-group synchronization.
//!
//! A [`ProgramController`] drives the timed program of a node group: one or
//! more junctions that switch phases together. Every member keeps its own
//! [`JunctionTimeline`] of steps, all of equal length. The first member of
//! the node group is the master; only its step decides when a phase ends and
//! the decision is broadcast to every slave within the same call.
//!
//! # Tick order
//!
//! 1. Prune members that vanished from the network or lost their live lights.
//! 2. Refuse to run an invalidated step.
//! 3. If the master's end transition finished, advance every member to the
//!    next step and write its lights.
//! 4. Otherwise let the master decide, broadcast a new decision, and write
//!    every member's lights.

use std::collections::BTreeMap;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::event::RemovalReason;
use crate::fixed::{mean, rounded_mean_ticks, Ticks};
use crate::id::JunctionId;
use crate::junction::{JunctionLights, LiveLights};
use crate::services::Services;
use crate::sim::{StateHash, TickStamp};
use crate::step::{calc_flow_wait, StepChangeMetric, StepState, StepTiming};

// ---------------------------------------------------------------------------
// Junction timeline
// ---------------------------------------------------------------------------

/// The ordered steps of one node-group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JunctionTimeline {
    pub junction: JunctionId,
    steps: Vec<StepState>,
    current: usize,
}

impl JunctionTimeline {
    pub fn new(junction: JunctionId) -> Self {
        Self::from_steps(junction, Vec::new())
    }

    pub fn from_steps(junction: JunctionId, steps: Vec<StepState>) -> Self {
        Self {
            junction,
            steps,
            current: 0,
        }
    }

    pub fn steps(&self) -> &[StepState] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepState> {
        self.steps.get(index)
    }

    pub fn current_step(&self) -> usize {
        self.current
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Write the current step into the junction's live lights. A failed
    /// write invalidates the step for good.
    fn write_lights(&mut self, now: Ticks, live: &mut JunctionLights) -> Result<(), ControllerError> {
        let count = self.steps.len();
        if count == 0 {
            return Ok(());
        }
        let index = self.current;
        let Some(step) = self.steps.get(index) else {
            return Err(ControllerError::StepIndexOutOfRange { index, count });
        };
        let prev = step
            .previous_step()
            .filter(|&p| p < count)
            .unwrap_or((index + count - 1) % count);
        let next = (index + 1) % count;

        let result = step.write_lights(&self.steps[prev], &self.steps[next], step.transition(now), live, now);
        let Err(cause) = result else {
            return Ok(());
        };
        if self.steps[index].invalidate() {
            tracing::error!(
                junction = %self.junction,
                step = index,
                error = %cause,
                "step lights could not be written; step invalidated"
            );
        }
        Err(ControllerError::StepCorrupted {
            junction: self.junction,
            step: index,
            cause: Some(Box::new(cause)),
        })
    }

    fn hash_into(&self, hash: &mut StateHash) {
        hash.write_u16(self.junction.0);
        hash.write_u64(self.current as u64);
        for step in &self.steps {
            step.hash_into(hash);
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Whether a node group still has members after a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Remaining,
    Empty,
}

/// What one controller tick did to the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The program is not running.
    Idle,
    /// The current step keeps running.
    Holding,
    /// The master decided; the end transition of this step is showing.
    Ending(usize),
    /// Every member switched to this step.
    Advanced(usize),
}

/// Result of one controller tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Members dropped from the node group during this tick.
    pub pruned: Vec<(JunctionId, RemovalReason)>,
    pub outcome: PhaseOutcome,
}

impl TickReport {
    fn idle() -> Self {
        Self {
            pruned: Vec::new(),
            outcome: PhaseOutcome::Idle,
        }
    }
}

// ---------------------------------------------------------------------------
// Program controller
// ---------------------------------------------------------------------------

/// The timed program shared by a node group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramController {
    node_group: Vec<JunctionId>,
    timelines: BTreeMap<JunctionId, JunctionTimeline>,
    started: bool,
    test_mode: bool,
}

impl ProgramController {
    /// A stopped program without steps. Duplicate junctions are ignored; the
    /// first one becomes the master.
    pub fn new(junctions: &[JunctionId]) -> Result<Self, ControllerError> {
        let mut node_group: Vec<JunctionId> = Vec::with_capacity(junctions.len());
        for &junction in junctions {
            if !node_group.contains(&junction) {
                node_group.push(junction);
            }
        }
        let timelines = node_group
            .iter()
            .map(|&j| (j, JunctionTimeline::new(j)))
            .collect();
        Self::from_parts(node_group, timelines)
    }

    /// Reassemble a stopped program from stored timelines.
    pub fn from_timelines(timelines: Vec<JunctionTimeline>) -> Result<Self, ControllerError> {
        let node_group = timelines.iter().map(|t| t.junction).collect();
        let timelines = timelines.into_iter().map(|t| (t.junction, t)).collect();
        Self::from_parts(node_group, timelines)
    }

    fn from_parts(
        node_group: Vec<JunctionId>,
        timelines: BTreeMap<JunctionId, JunctionTimeline>,
    ) -> Result<Self, ControllerError> {
        if node_group.is_empty() {
            return Err(ControllerError::GroupEmpty);
        }
        let expected = timelines.get(&node_group[0]).map_or(0, JunctionTimeline::len);
        if let Some(t) = timelines.values().find(|t| t.len() != expected) {
            return Err(ControllerError::StepCountMismatch {
                junction: t.junction,
                expected,
                found: t.len(),
            });
        }
        Ok(Self {
            node_group,
            timelines,
            started: false,
            test_mode: false,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn master(&self) -> Option<JunctionId> {
        self.node_group.first().copied()
    }

    pub fn is_master(&self, junction: JunctionId) -> bool {
        self.master() == Some(junction)
    }

    pub fn node_group(&self) -> &[JunctionId] {
        &self.node_group
    }

    pub fn contains(&self, junction: JunctionId) -> bool {
        self.node_group.contains(&junction)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn step_count(&self) -> usize {
        self.master_timeline().map_or(0, JunctionTimeline::len)
    }

    pub fn current_step(&self) -> usize {
        self.master_timeline().map_or(0, JunctionTimeline::current_step)
    }

    pub fn current_step_of(&self, junction: JunctionId) -> Option<usize> {
        self.timelines.get(&junction).map(JunctionTimeline::current_step)
    }

    pub fn timeline(&self, junction: JunctionId) -> Option<&JunctionTimeline> {
        self.timelines.get(&junction)
    }

    /// Timelines in node-group order.
    pub fn timelines(&self) -> impl Iterator<Item = &JunctionTimeline> {
        self.node_group.iter().filter_map(|j| self.timelines.get(j))
    }

    pub fn step(&self, junction: JunctionId, index: usize) -> Option<&StepState> {
        self.timelines.get(&junction)?.step(index)
    }

    fn master_timeline(&self) -> Option<&JunctionTimeline> {
        self.timelines.get(&self.master()?)
    }

    fn master_step(&self) -> Option<&StepState> {
        self.master_timeline()?.step(self.current_step())
    }

    /// Ticks until the current phase may end, as seen by the master.
    pub fn min_time_remaining(&self, now: Ticks) -> Option<Ticks> {
        self.master_step().map(|s| s.min_time_remaining(now))
    }

    /// Ticks until the current phase must end, as seen by the master.
    pub fn max_time_remaining(&self, now: Ticks) -> Option<Ticks> {
        self.master_step().map(|s| s.max_time_remaining(now))
    }

    // -----------------------------------------------------------------------
    // Step editing
    // -----------------------------------------------------------------------

    fn ensure_stopped(&self) -> Result<(), ControllerError> {
        if self.started {
            return Err(ControllerError::Running);
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), ControllerError> {
        let count = self.step_count();
        if index >= count {
            return Err(ControllerError::StepIndexOutOfRange { index, count });
        }
        Ok(())
    }

    /// Append a step that snapshots every member's current live lights.
    /// Returns the new step's index.
    pub fn add_step(&mut self, timing: StepTiming, live: &LiveLights) -> Result<usize, ControllerError> {
        self.ensure_stopped()?;
        let captured = self
            .node_group
            .iter()
            .map(|&j| {
                live.get(&j)
                    .map(|lights| (j, StepState::capture(timing, lights)))
                    .ok_or(ControllerError::UnknownJunction(j))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for (junction, step) in captured {
            if let Some(timeline) = self.timelines.get_mut(&junction) {
                timeline.steps.push(step);
            }
        }
        Ok(self.step_count() - 1)
    }

    pub fn remove_step(&mut self, index: usize) -> Result<(), ControllerError> {
        self.ensure_stopped()?;
        self.check_index(index)?;
        for timeline in self.timelines.values_mut() {
            timeline.steps.remove(index);
            timeline.current = 0;
        }
        Ok(())
    }

    /// Move a step to a new position, shifting the steps in between.
    pub fn move_step(&mut self, from: usize, to: usize) -> Result<(), ControllerError> {
        self.ensure_stopped()?;
        self.check_index(from)?;
        self.check_index(to)?;
        for timeline in self.timelines.values_mut() {
            let step = timeline.steps.remove(from);
            timeline.steps.insert(to, step);
            timeline.current = 0;
        }
        Ok(())
    }

    /// Change a step's timing on every member. Allowed while running; the
    /// running step picks the new bounds up on its next decision.
    pub fn update_step_timing(&mut self, index: usize, timing: StepTiming) -> Result<(), ControllerError> {
        self.check_index(index)?;
        for timeline in self.timelines.values_mut() {
            if let Some(step) = timeline.steps.get_mut(index) {
                step.set_timing(timing);
            }
        }
        Ok(())
    }

    /// Replace a step's snapshot with every member's current live lights.
    pub fn recapture_step(&mut self, index: usize, live: &LiveLights) -> Result<(), ControllerError> {
        self.ensure_stopped()?;
        self.check_index(index)?;
        if let Some(&missing) = self.node_group.iter().find(|j| !live.contains_key(j)) {
            return Err(ControllerError::UnknownJunction(missing));
        }
        for timeline in self.timelines.values_mut() {
            if let (Some(step), Some(lights)) = (timeline.steps.get_mut(index), live.get(&timeline.junction)) {
                step.recapture(lights);
            }
        }
        Ok(())
    }

    /// Edit one member's snapshot of a step.
    pub fn step_mut(&mut self, junction: JunctionId, index: usize) -> Result<&mut StepState, ControllerError> {
        self.ensure_stopped()?;
        self.check_index(index)?;
        self.timelines
            .get_mut(&junction)
            .and_then(|t| t.steps.get_mut(index))
            .ok_or(ControllerError::UnknownJunction(junction))
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Drop members that vanished from the network or lost their live
    /// lights, then align every snapshot with the live lights.
    pub fn housekeeping(&mut self, services: &Services<'_>, live: &LiveLights) -> Vec<(JunctionId, RemovalReason)> {
        let pruned = self.prune(services, live);
        for timeline in self.timelines.values_mut() {
            let Some(lights) = live.get(&timeline.junction) else {
                continue;
            };
            for step in &mut timeline.steps {
                step.housekeeping(lights, services.restrictions);
            }
        }
        pruned
    }

    fn prune(&mut self, services: &Services<'_>, live: &LiveLights) -> Vec<(JunctionId, RemovalReason)> {
        let mut pruned = Vec::new();
        self.node_group.retain(|&j| {
            let reason = if !services.topology.junction_exists(j) {
                RemovalReason::TopologyInvalid
            } else if !live.contains_key(&j) {
                RemovalReason::ConsensusBroken
            } else {
                return true;
            };
            pruned.push((j, reason));
            false
        });
        for (junction, reason) in &pruned {
            self.timelines.remove(junction);
            tracing::warn!(junction = %junction, ?reason, "member pruned from node group");
        }
        pruned
    }

    /// Remove one member. The caller tears the program down on
    /// [`Membership::Empty`]; otherwise the next member becomes master.
    pub fn remove_member(&mut self, junction: JunctionId) -> Result<Membership, ControllerError> {
        if !self.contains(junction) {
            return Err(ControllerError::UnknownJunction(junction));
        }
        self.node_group.retain(|&j| j != junction);
        self.timelines.remove(&junction);
        if self.node_group.is_empty() {
            self.started = false;
            return Ok(Membership::Empty);
        }
        Ok(Membership::Remaining)
    }

    /// Merge `other` into this program.
    ///
    /// The shorter program is padded with all-red steps whose timing comes
    /// from the longer one. Each step's bounds become the rounded mean and
    /// its balance the mean across every member. The merged program restarts
    /// at step 0 when it has any steps.
    pub fn join(
        &mut self,
        mut other: ProgramController,
        now: Ticks,
        services: &Services<'_>,
        live: &mut LiveLights,
    ) -> Result<(), ControllerError> {
        let target = self.step_count().max(other.step_count());
        let donor: Vec<StepTiming> = if self.step_count() >= other.step_count() {
            self.master_timings()
        } else {
            other.master_timings()
        };
        self.pad(target, &donor, live)?;
        other.pad(target, &donor, live)?;

        for junction in other.node_group.clone() {
            if self.contains(junction) {
                continue;
            }
            if let Some(timeline) = other.timelines.remove(&junction) {
                self.node_group.push(junction);
                self.timelines.insert(junction, timeline);
            }
        }

        for index in 0..target {
            let timings: Vec<StepTiming> = self
                .timelines
                .values()
                .filter_map(|t| t.step(index).map(StepState::timing))
                .collect();
            let metric = self
                .master_timeline()
                .and_then(|t| t.step(index))
                .map_or(StepChangeMetric::Default, |s| s.timing().change_metric());
            let min = rounded_mean_ticks(timings.iter().map(StepTiming::min_ticks));
            let max = rounded_mean_ticks(timings.iter().map(StepTiming::max_ticks));
            let merged = StepTiming::clamped(
                i64::try_from(min).unwrap_or(i64::MAX),
                i64::try_from(max).unwrap_or(i64::MAX),
                mean(timings.iter().map(StepTiming::wait_flow_balance)),
                metric,
            );
            for timeline in self.timelines.values_mut() {
                if let Some(step) = timeline.steps.get_mut(index) {
                    step.set_timing(merged);
                }
            }
        }

        self.started = false;
        self.test_mode = false;
        tracing::info!(
            members = self.node_group.len(),
            steps = target,
            "timed programs joined"
        );
        if target > 0 {
            self.start(now, services, live)?;
        }
        Ok(())
    }

    fn master_timings(&self) -> Vec<StepTiming> {
        self.master_timeline()
            .map(|t| t.steps.iter().map(StepState::timing).collect())
            .unwrap_or_default()
    }

    fn pad(&mut self, target: usize, donor: &[StepTiming], live: &LiveLights) -> Result<(), ControllerError> {
        for timeline in self.timelines.values_mut() {
            let lights = live
                .get(&timeline.junction)
                .ok_or(ControllerError::UnknownJunction(timeline.junction))?;
            while timeline.steps.len() < target {
                let Some(&timing) = donor.get(timeline.steps.len()) else {
                    break;
                };
                timeline.steps.push(StepState::all_red(timing, lights));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Start the program at step 0. Vanished slaves are pruned; a vanished
    /// master aborts the start. Returns the pruned members.
    pub fn start(
        &mut self,
        now: Ticks,
        services: &Services<'_>,
        live: &mut LiveLights,
    ) -> Result<Vec<(JunctionId, RemovalReason)>, ControllerError> {
        self.start_at(0, now, services, live)
    }

    /// Start the program at an arbitrary step, e.g. when resuming a saved
    /// program.
    pub fn start_at(
        &mut self,
        index: usize,
        now: Ticks,
        services: &Services<'_>,
        live: &mut LiveLights,
    ) -> Result<Vec<(JunctionId, RemovalReason)>, ControllerError> {
        let master = self.master().ok_or(ControllerError::GroupEmpty)?;
        if !services.topology.junction_exists(master) {
            return Err(ControllerError::TopologyInvalid(master));
        }
        let pruned = self.housekeeping(services, live);
        if self.step_count() == 0 {
            return Err(ControllerError::NoSteps);
        }
        self.check_index(index)?;
        for timeline in self.timelines.values_mut() {
            timeline.current = index;
            if let Some(step) = timeline.steps.get_mut(index) {
                step.start(now, None);
            }
        }
        self.started = true;
        self.write_all_lights(now, live)?;
        tracing::info!(
            master = %master,
            members = self.node_group.len(),
            steps = self.step_count(),
            step = index,
            tick = now,
            "timed program started"
        );
        Ok(pruned)
    }

    /// Stop running. The live lights keep their last colors.
    pub fn stop(&mut self) {
        if self.started {
            tracing::info!(master = ?self.master(), "timed program stopped");
        }
        self.started = false;
    }

    /// Hold the current step: lights are still written but the phase never
    /// ends on its own.
    pub fn set_test_mode(&mut self, enabled: bool) {
        self.test_mode = enabled;
    }

    /// Advance every member to the next step right away.
    pub fn skip_step(&mut self, now: Ticks, live: &mut LiveLights) -> Result<usize, ControllerError> {
        if !self.started {
            return Err(ControllerError::NotStarted);
        }
        self.advance(now, live)
    }

    /// Run the master's decision and report whether the current phase is
    /// over. Slaves delegate to the master.
    pub fn step_done(
        &mut self,
        junction: JunctionId,
        now: TickStamp,
        services: &Services<'_>,
        config: &ControllerConfig,
    ) -> Result<bool, ControllerError> {
        if !self.contains(junction) {
            return Err(ControllerError::UnknownJunction(junction));
        }
        if !self.started {
            return Err(ControllerError::NotStarted);
        }
        self.decide(now, services, config);
        Ok(self.master_step().is_some_and(StepState::is_done))
    }

    /// One controller tick.
    pub fn simulation_step(
        &mut self,
        now: TickStamp,
        services: &Services<'_>,
        config: &ControllerConfig,
        live: &mut LiveLights,
    ) -> Result<TickReport, ControllerError> {
        if !self.started {
            return Ok(TickReport::idle());
        }
        let pruned = self.prune(services, live);
        let master = self.master().ok_or(ControllerError::GroupEmpty)?;

        let index = self.current_step();
        if let Some(junction) = self.invalid_member(index) {
            return Err(ControllerError::StepCorrupted {
                junction,
                step: index,
                cause: None,
            });
        }

        let outcome = if self.test_mode {
            self.write_all_lights(now.phase, live)?;
            PhaseOutcome::Holding
        } else if self.master_step().is_some_and(|s| s.is_end_transition_done(now.phase)) {
            let next = self.advance(now.phase, live)?;
            tracing::debug!(master = %master, step = next, tick = now.phase, "phase advanced");
            PhaseOutcome::Advanced(next)
        } else {
            let ending = self.decide(now, services, config);
            self.write_all_lights(now.phase, live)?;
            if ending {
                tracing::debug!(master = %master, step = index, tick = now.phase, "phase ending");
                PhaseOutcome::Ending(index)
            } else {
                PhaseOutcome::Holding
            }
        };
        Ok(TickReport { pruned, outcome })
    }

    fn invalid_member(&self, index: usize) -> Option<JunctionId> {
        self.node_group.iter().copied().find(|j| {
            self.timelines
                .get(j)
                .and_then(|t| t.step(index))
                .is_none_or(|s| !s.is_valid())
        })
    }

    /// Evaluate the master's step and broadcast its decision. Returns
    /// whether the phase ended on this call.
    fn decide(&mut self, now: TickStamp, services: &Services<'_>, config: &ControllerConfig) -> bool {
        let Some(master) = self.master() else {
            return false;
        };
        let index = self.current_step();
        let Some(step) = self.step(master, index) else {
            return false;
        };
        let was_done = step.is_done();
        let measurement = step.wants_measurement(now).then(|| {
            let members: Vec<(JunctionId, &StepState)> = self
                .node_group
                .iter()
                .filter_map(|&j| self.step(j, index).map(|s| (j, s)))
                .collect();
            calc_flow_wait(&members, services, config, step.timing().wait_flow_balance())
        });

        let Some(step) = self.timelines.get_mut(&master).and_then(|t| t.steps.get_mut(index)) else {
            return false;
        };
        if !step.step_done(now, measurement, &config.smoothing) {
            return false;
        }
        let end_start = step.end_transition_start().unwrap_or(now.phase);
        for timeline in self.timelines.values_mut() {
            if let Some(step) = timeline.steps.get_mut(index) {
                step.follow_end_transition(end_start);
            }
        }
        !was_done
    }

    fn advance(&mut self, now: Ticks, live: &mut LiveLights) -> Result<usize, ControllerError> {
        let count = self.step_count();
        if count == 0 {
            return Err(ControllerError::NoSteps);
        }
        let previous = self.current_step();
        let next = (previous + 1) % count;
        for timeline in self.timelines.values_mut() {
            timeline.current = next;
            if let Some(step) = timeline.steps.get_mut(next) {
                step.start(now, Some(previous));
            }
        }
        self.write_all_lights(now, live)?;
        Ok(next)
    }

    fn write_all_lights(&mut self, now: Ticks, live: &mut LiveLights) -> Result<(), ControllerError> {
        for timeline in self.timelines.values_mut() {
            if let Some(lights) = live.get_mut(&timeline.junction) {
                timeline.write_lights(now, lights)?;
            }
        }
        Ok(())
    }

    pub(crate) fn hash_into(&self, hash: &mut StateHash) {
        for &junction in &self.node_group {
            hash.write_u16(junction.0);
        }
        hash.write_u8(u8::from(self.started));
        hash.write_u8(u8::from(self.test_mode));
        for timeline in self.timelines() {
            timeline.hash_into(hash);
        }
    }
}
