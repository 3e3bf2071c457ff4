//! One phase of a timed program at one junction.
//!
//! A [`StepState`] holds a snapshot of the lights the junction should show
//! during the phase plus the runtime state that decides when the phase ends.
//! Decisions move through `NotStarted -> Running -> EndTransition -> Done`:
//!
//! - below `min_ticks` the step always holds,
//! - between `min_ticks` and `max_ticks` the smoothed flow/wait reading and
//!   the step's [`StepChangeMetric`] decide,
//! - at `max_ticks` the step ends unconditionally.
//!
//! Only the master junction of a node group decides. Slave steps receive the
//! decision through [`StepState::follow_end_transition`].

use std::collections::BTreeMap;

use crate::config::{ControllerConfig, FlowWaitSmoothing};
use crate::error::ControllerError;
use crate::fixed::{checked_div_64, Fixed64, Ticks};
use crate::id::{JunctionId, SegmentEndId, SegmentId};
use crate::junction::JunctionLights;
use crate::light::{calc_light_state, ArrowDirection, LightColor};
use crate::light_group::SegmentEndLightGroup;
use crate::services::{MetricWindow, Services, VehicleRestrictions};
use crate::sim::{StateHash, TickStamp};
use crate::vehicle::VehicleClass;
use serde::{Deserialize, Serialize};

/// Smallest balance a step accepts; lower values are clamped up to it.
pub const MIN_WAIT_FLOW_BALANCE: Fixed64 = Fixed64::from_bits(0x028F_5C29);

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Which flow/wait relation ends a step inside its adaptive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StepChangeMetric {
    /// Change once vehicles wait and the flow falls below the wait.
    #[default]
    Default,
    /// Change as soon as any vehicle flows.
    FirstFlow,
    /// Change as soon as any vehicle waits.
    FirstWait,
    /// Change once nothing flows.
    NoFlow,
    /// Change once nothing waits.
    NoWait,
}

impl StepChangeMetric {
    pub fn should_change(self, reading: FlowWait) -> bool {
        let FlowWait { flow, wait } = reading;
        match self {
            StepChangeMetric::Default => wait > Fixed64::ZERO && flow < wait,
            StepChangeMetric::FirstFlow => flow > Fixed64::ZERO,
            StepChangeMetric::FirstWait => wait > Fixed64::ZERO,
            StepChangeMetric::NoFlow => flow == Fixed64::ZERO,
            StepChangeMetric::NoWait => wait == Fixed64::ZERO,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StepChangeMetric::Default => "default",
            StepChangeMetric::FirstFlow => "first_flow",
            StepChangeMetric::FirstWait => "first_wait",
            StepChangeMetric::NoFlow => "no_flow",
            StepChangeMetric::NoWait => "no_wait",
        }
    }

    /// Resolve a name produced by [`StepChangeMetric::name`].
    pub fn from_name(name: &str) -> Option<StepChangeMetric> {
        match name {
            "default" => Some(StepChangeMetric::Default),
            "first_flow" => Some(StepChangeMetric::FirstFlow),
            "first_wait" => Some(StepChangeMetric::FirstWait),
            "no_flow" => Some(StepChangeMetric::NoFlow),
            "no_wait" => Some(StepChangeMetric::NoWait),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            StepChangeMetric::Default => 0,
            StepChangeMetric::FirstFlow => 1,
            StepChangeMetric::FirstWait => 2,
            StepChangeMetric::NoFlow => 3,
            StepChangeMetric::NoWait => 4,
        }
    }
}

/// Dwell bounds and adaptive parameters of one step.
///
/// Construct through [`StepTiming::new`] or [`StepTiming::clamped`]; both
/// enforce `min_ticks >= 1` and `max_ticks >= min_ticks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTiming {
    min_ticks: Ticks,
    max_ticks: Ticks,
    wait_flow_balance: Fixed64,
    change_metric: StepChangeMetric,
}

impl StepTiming {
    /// Clamped bounds with balance 1 and the default change metric.
    pub fn new(min_ticks: i64, max_ticks: i64) -> Self {
        Self::clamped(min_ticks, max_ticks, Fixed64::ONE, StepChangeMetric::Default)
    }

    /// Clamp out-of-range configuration instead of rejecting it.
    pub fn clamped(
        min_ticks: i64,
        max_ticks: i64,
        wait_flow_balance: Fixed64,
        change_metric: StepChangeMetric,
    ) -> Self {
        let min = min_ticks.max(1);
        let max = max_ticks.max(min);
        let balance = wait_flow_balance.max(MIN_WAIT_FLOW_BALANCE);
        if min != min_ticks || max != max_ticks || balance != wait_flow_balance {
            tracing::debug!(
                requested_min = min_ticks,
                requested_max = max_ticks,
                min,
                max,
                balance = %balance,
                "step timing clamped"
            );
        }
        Self {
            min_ticks: min as Ticks,
            max_ticks: max as Ticks,
            wait_flow_balance: balance,
            change_metric,
        }
    }

    /// Timing built from the registry-wide defaults.
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::clamped(
            ticks_to_i64(config.default_min_ticks),
            ticks_to_i64(config.default_max_ticks),
            config.default_wait_flow_balance,
            config.default_change_metric,
        )
    }

    pub fn min_ticks(&self) -> Ticks {
        self.min_ticks
    }

    pub fn max_ticks(&self) -> Ticks {
        self.max_ticks
    }

    pub fn wait_flow_balance(&self) -> Fixed64 {
        self.wait_flow_balance
    }

    pub fn change_metric(&self) -> StepChangeMetric {
        self.change_metric
    }

    pub fn with_balance(self, balance: Fixed64) -> Self {
        Self::clamped(
            ticks_to_i64(self.min_ticks),
            ticks_to_i64(self.max_ticks),
            balance,
            self.change_metric,
        )
    }

    pub fn with_change_metric(mut self, metric: StepChangeMetric) -> Self {
        self.change_metric = metric;
        self
    }
}

fn ticks_to_i64(ticks: Ticks) -> i64 {
    i64::try_from(ticks).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// A flow/wait reading. Flow is already divided by the step's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowWait {
    pub flow: Fixed64,
    pub wait: Fixed64,
}

/// Result of measuring traffic around a node group for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    Reading(FlowWait),
    /// A member's step has no segment ends left; the step must end.
    Collapsed,
}

/// Observable lifecycle of a step at a given tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    NotStarted,
    Running,
    EndTransition,
    Done,
}

/// Which transition colors apply to a light write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transition {
    pub at_start: bool,
    pub at_end: bool,
}

// ---------------------------------------------------------------------------
// Step state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StepRuntime {
    start: Option<Ticks>,
    previous: Option<usize>,
    done: bool,
    end_transition_start: Option<Ticks>,
    last_measured: Option<Ticks>,
    smoothed: Option<FlowWait>,
}

/// One phase of a timed program at one junction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepState {
    timing: StepTiming,
    lights: BTreeMap<SegmentId, SegmentEndLightGroup>,
    runtime: StepRuntime,
    valid: bool,
}

impl StepState {
    /// Snapshot the junction's live lights, snapped to steady colors.
    pub fn capture(timing: StepTiming, live: &JunctionLights) -> Self {
        Self::from_groups(timing, live.groups().map(|(_, g)| g.clone()))
    }

    /// A step that shows red everywhere at the junction.
    pub fn all_red(timing: StepTiming, live: &JunctionLights) -> Self {
        let mut step = Self::capture(timing, live);
        for group in step.lights.values_mut() {
            group.make_red();
        }
        step
    }

    /// Build a step from stored light groups, keyed by their segment.
    pub fn from_groups(
        timing: StepTiming,
        groups: impl IntoIterator<Item = SegmentEndLightGroup>,
    ) -> Self {
        let lights = groups
            .into_iter()
            .map(|mut g| {
                g.make_red_or_green();
                (g.end.segment, g)
            })
            .collect();
        Self {
            timing,
            lights,
            runtime: StepRuntime::default(),
            valid: true,
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    pub fn timing(&self) -> StepTiming {
        self.timing
    }

    pub fn set_timing(&mut self, timing: StepTiming) {
        self.timing = timing;
    }

    pub fn group(&self, segment: SegmentId) -> Option<&SegmentEndLightGroup> {
        self.lights.get(&segment)
    }

    pub fn groups(&self) -> impl Iterator<Item = &SegmentEndLightGroup> {
        self.lights.values()
    }

    /// Mutable access to the snapshot for editors.
    pub fn lights_mut(&mut self) -> impl Iterator<Item = &mut SegmentEndLightGroup> {
        self.lights.values_mut()
    }

    pub fn segment_count(&self) -> usize {
        self.lights.len()
    }

    /// Set the snapshot colors of one light. Returns false when the segment
    /// end is not part of this step.
    pub fn set_light(
        &mut self,
        segment: SegmentId,
        class: VehicleClass,
        left: LightColor,
        main: LightColor,
        right: LightColor,
    ) -> bool {
        let Some(group) = self.lights.get_mut(&segment) else {
            return false;
        };
        group.light_mut(class).set_colors(left.steady(), main.steady(), right.steady());
        true
    }

    /// Take the junction's current live colors into the snapshot.
    ///
    /// Existing groups keep their dedicated classes and copy colors through
    /// the live group's lookup; segment ends the snapshot lacks are cloned
    /// and vanished ones dropped.
    pub fn recapture(&mut self, live: &JunctionLights) {
        self.lights.retain(|segment, _| live.group(*segment).is_some());
        for (segment, live_group) in live.groups() {
            match self.lights.get_mut(&segment) {
                Some(group) => group.copy_states_from(live_group),
                None => {
                    self.lights.insert(segment, live_group.clone());
                }
            }
        }
        for group in self.lights.values_mut() {
            group.make_red_or_green();
        }
    }

    /// Align the snapshot with the live lights after a topology change.
    ///
    /// Vanished segment ends are dropped, new ones are added as all-red
    /// copies of the live group, and dedicated classes follow the lane
    /// permissions. Returns whether anything changed.
    pub fn housekeeping(&mut self, live: &JunctionLights, restrictions: &dyn VehicleRestrictions) -> bool {
        let before = self.lights.len();
        self.lights.retain(|segment, _| live.group(*segment).is_some());
        let mut changed = self.lights.len() != before;

        for (segment, live_group) in live.groups() {
            let group = self.lights.entry(segment).or_insert_with(|| {
                changed = true;
                let mut g = live_group.clone();
                g.make_red();
                g
            });
            changed |= group.housekeeping(false, &restrictions.lane_classes(live_group.end));
        }
        changed
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Begin the phase at `now`. Clears the decision and any smoothed reading.
    pub fn start(&mut self, now: Ticks, previous: Option<usize>) {
        self.runtime = StepRuntime {
            start: Some(now),
            previous,
            ..StepRuntime::default()
        };
    }

    pub fn is_started(&self) -> bool {
        self.runtime.start.is_some()
    }

    pub fn start_tick(&self) -> Option<Ticks> {
        self.runtime.start
    }

    pub fn previous_step(&self) -> Option<usize> {
        self.runtime.previous
    }

    pub fn is_done(&self) -> bool {
        self.runtime.done
    }

    pub fn end_transition_start(&self) -> Option<Ticks> {
        self.runtime.end_transition_start
    }

    pub fn smoothed(&self) -> Option<FlowWait> {
        self.runtime.smoothed
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the step permanently unusable. Returns whether it was valid before.
    pub fn invalidate(&mut self) -> bool {
        std::mem::replace(&mut self.valid, false)
    }

    fn elapsed(&self, now: Ticks) -> Option<Ticks> {
        self.runtime.start.map(|start| now.saturating_sub(start))
    }

    fn finish(&mut self, now: Ticks) {
        self.runtime.done = true;
        self.runtime.end_transition_start = Some(now);
    }

    /// Whether a fresh flow/wait reading would be used at `now`.
    pub fn wants_measurement(&self, now: TickStamp) -> bool {
        let Some(elapsed) = self.elapsed(now.phase) else {
            return false;
        };
        !self.runtime.done
            && elapsed >= self.timing.min_ticks
            && elapsed < self.timing.max_ticks
            && self.runtime.last_measured != Some(now.metric)
    }

    /// Decide whether the phase is over.
    ///
    /// `measurement` is only consumed inside the adaptive window and at most
    /// once per metric tick. A step that was never started never finishes.
    pub fn step_done(
        &mut self,
        now: TickStamp,
        measurement: Option<Measurement>,
        smoothing: &FlowWaitSmoothing,
    ) -> bool {
        if self.runtime.done {
            return true;
        }
        let Some(elapsed) = self.elapsed(now.phase) else {
            return false;
        };
        if elapsed >= self.timing.max_ticks {
            self.finish(now.phase);
            return true;
        }
        if elapsed < self.timing.min_ticks {
            return false;
        }
        if self.runtime.last_measured == Some(now.metric) {
            return false;
        }
        let Some(measurement) = measurement else {
            return false;
        };
        self.runtime.last_measured = Some(now.metric);

        let reading = match measurement {
            Measurement::Collapsed => {
                self.finish(now.phase);
                return true;
            }
            Measurement::Reading(reading) => reading,
        };
        let smoothed = match self.runtime.smoothed {
            None => reading,
            Some(previous) => FlowWait {
                flow: smoothing.blend(previous.flow, reading.flow),
                wait: smoothing.blend(previous.wait, reading.wait),
            },
        };
        self.runtime.smoothed = Some(smoothed);

        if self.timing.change_metric.should_change(smoothed) {
            self.finish(now.phase);
        }
        self.runtime.done
    }

    /// Adopt the master's decision that the phase ended at `end_start`.
    pub fn follow_end_transition(&mut self, end_start: Ticks) {
        if !self.runtime.done {
            self.finish(end_start);
        }
    }

    pub fn is_in_start_transition(&self, now: Ticks) -> bool {
        self.runtime.start == Some(now) && !self.runtime.done
    }

    pub fn is_in_end_transition(&self, now: Ticks) -> bool {
        self.runtime.done && self.runtime.end_transition_start.is_some_and(|t| now <= t)
    }

    pub fn is_end_transition_done(&self, now: Ticks) -> bool {
        self.runtime.done && self.runtime.end_transition_start.is_some_and(|t| now > t)
    }

    pub fn phase(&self, now: Ticks) -> StepPhase {
        if !self.is_started() {
            StepPhase::NotStarted
        } else if self.is_end_transition_done(now) {
            StepPhase::Done
        } else if self.runtime.done {
            StepPhase::EndTransition
        } else {
            StepPhase::Running
        }
    }

    /// Transition colors to show at `now`.
    pub fn transition(&self, now: Ticks) -> Transition {
        let at_end = self.runtime.done;
        Transition {
            at_start: !at_end && self.is_in_start_transition(now),
            at_end,
        }
    }

    /// Ticks until the adaptive window opens.
    pub fn min_time_remaining(&self, now: Ticks) -> Ticks {
        match self.runtime.start {
            Some(start) => (start + self.timing.min_ticks).saturating_sub(now),
            None => self.timing.min_ticks,
        }
    }

    /// Ticks until the step ends unconditionally.
    pub fn max_time_remaining(&self, now: Ticks) -> Ticks {
        match self.runtime.start {
            Some(start) => (start + self.timing.max_ticks).saturating_sub(now),
            None => self.timing.max_ticks,
        }
    }

    // -----------------------------------------------------------------------
    // Light output
    // -----------------------------------------------------------------------

    /// Write this step's colors into the live lights, injecting transition
    /// colors where an arrow changes across the phase boundary.
    ///
    /// `prev` and `next` are the neighboring steps of the same junction. A
    /// segment end present on only one side means the step no longer matches
    /// the junction.
    pub fn write_lights(
        &self,
        prev: &StepState,
        next: &StepState,
        transition: Transition,
        live: &mut JunctionLights,
        now: Ticks,
    ) -> Result<(), ControllerError> {
        let junction = live.junction;
        if let Some(&segment) = self.lights.keys().find(|s| live.group(**s).is_none()) {
            return Err(ControllerError::LightWrite { junction, segment });
        }
        let Transition { at_start, at_end } = transition;

        for (segment, live_group) in live.groups_mut() {
            let current = self
                .lights
                .get(&segment)
                .ok_or(ControllerError::LightWrite { junction, segment })?;
            let before = prev.lights.get(&segment).unwrap_or(current);
            let after = next.lights.get(&segment).unwrap_or(current);

            for class in live_group.classes() {
                let (p, c, n) = (before.light(class), current.light(class), after.light(class));
                let pick = |dir: ArrowDirection| {
                    calc_light_state(p.color_for(dir), c.color_for(dir), n.color_for(dir), at_start, at_end)
                };
                let colors = (
                    pick(ArrowDirection::Left),
                    pick(ArrowDirection::Forward),
                    pick(ArrowDirection::Right),
                );
                live_group.light_mut(class).set_mode(c.mode());
                live_group.apply_colors(class, colors.0, colors.1, colors.2, now);
            }

            match current.pedestrian().filter(|_| current.is_manual_pedestrian()) {
                Some(color) => {
                    let p = before.pedestrian().unwrap_or(color);
                    let n = after.pedestrian().unwrap_or(color);
                    live_group.write_manual_pedestrian(Some(calc_light_state(p, color, n, at_start, at_end)), now);
                }
                None => live_group.write_manual_pedestrian(None, now),
            }
        }
        Ok(())
    }

    pub(crate) fn hash_into(&self, hash: &mut StateHash) {
        hash.write_u64(self.timing.min_ticks);
        hash.write_u64(self.timing.max_ticks);
        hash.write_fixed64(self.timing.wait_flow_balance);
        hash.write_u8(self.timing.change_metric.code());
        hash.write_u64(self.runtime.start.unwrap_or(u64::MAX));
        hash.write_u8(u8::from(self.runtime.done));
        hash.write_u64(self.runtime.end_transition_start.unwrap_or(u64::MAX));
        for group in self.lights.values() {
            group.hash_into(hash);
        }
    }
}

// ---------------------------------------------------------------------------
// Flow / wait measurement
// ---------------------------------------------------------------------------

/// Measure flow and wait across the corresponding step of every node-group
/// member.
///
/// Flow counts vehicles that can move now: current-window samples toward a
/// direction whose arrow is green. Wait counts queued vehicles: decayed
/// look-back samples toward a red arrow. Samples are normalized by the length
/// of the approach segment and averaged per kind; flow is then divided by
/// `balance`.
pub fn calc_flow_wait(
    members: &[(JunctionId, &StepState)],
    services: &Services<'_>,
    config: &ControllerConfig,
    balance: Fixed64,
) -> Measurement {
    let decayed = MetricWindow::Decayed {
        decay: config.queue_decay,
    };
    let (mut flow_sum, mut flow_count) = (Fixed64::ZERO, 0u32);
    let (mut wait_sum, mut wait_count) = (Fixed64::ZERO, 0u32);

    for &(junction, step) in members {
        if step.lights.is_empty() {
            return Measurement::Collapsed;
        }
        for (&segment, group) in &step.lights {
            let end = SegmentEndId::new(junction, segment);
            let length = services.topology.segment_length(segment);
            let length = if length > Fixed64::ZERO { length } else { Fixed64::ONE };

            for (class, light) in group.lights() {
                let classes = group.served_classes(class);
                for sample in services.metrics.approaching(end, classes, MetricWindow::Current) {
                    let dir = services.topology.direction(junction, segment, sample.target);
                    if light.color_for(dir).steady().is_green() {
                        flow_sum = flow_sum.saturating_add(per_length(sample.vehicles, length));
                        flow_count += 1;
                    }
                }
                for sample in services.metrics.approaching(end, classes, decayed) {
                    let dir = services.topology.direction(junction, segment, sample.target);
                    if light.color_for(dir).steady().is_red() {
                        wait_sum = wait_sum.saturating_add(per_length(sample.vehicles, length));
                        wait_count += 1;
                    }
                }
            }
        }
    }

    let flow = average(flow_sum, flow_count);
    let wait = average(wait_sum, wait_count);
    let flow = if balance > Fixed64::ZERO {
        checked_div_64(flow, balance).unwrap_or(flow)
    } else {
        flow
    };
    Measurement::Reading(FlowWait { flow, wait })
}

fn per_length(vehicles: Fixed64, length: Fixed64) -> Fixed64 {
    checked_div_64(vehicles, length).unwrap_or(vehicles)
}

fn average(sum: Fixed64, count: u32) -> Fixed64 {
    if count == 0 {
        return Fixed64::ZERO;
    }
    checked_div_64(sum, Fixed64::from_num(count)).unwrap_or(Fixed64::ZERO)
}
