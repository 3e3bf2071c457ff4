//! The junction registry: which junctions are signalized and how.
//!
//! [`JunctionRegistry`] is the single repository the host creates on load and
//! clears on unload. It owns every junction's live lights and every timed
//! [`ProgramController`], and runs the per-tick pass:
//!
//! 1. Derive the phase and metric ticks from the host frame counter.
//! 2. Drain queued [`TopologyEvent`]s.
//! 3. Verify that every member of a node group is still controlled by it.
//! 4. Tick every program in isolation. A failing program is torn down and its
//!    junctions revert to unsignalized; other programs are unaffected.
//! 5. Refresh automatic pedestrian signals.

use std::collections::BTreeMap;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::event::{ControllerEvent, EventBuffer, RemovalReason, StopReason};
use crate::id::{JunctionId, ProgramId, SegmentEndId};
use crate::junction::{JunctionLights, LiveLights};
use crate::light::SegmentLightState;
use crate::program::{Membership, PhaseOutcome, ProgramController};
use crate::serialize::{self, DeserializeError, ProgramRecord, RegistrySnapshot, SerializeError, SnapshotHeader};
use crate::services::{LightSink, Services};
use crate::sim::{StateHash, TickStamp};
use crate::step::StepTiming;
use crate::topology_queue::{TopologyEvent, TopologyQueue};
use crate::vehicle::VehicleClass;
use slotmap::SlotMap;

/// How a signalized junction is controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JunctionControl {
    /// Lights are set by hand and never change on their own.
    Manual,
    /// Lights follow a timed program.
    Timed(ProgramId),
}

/// Every signalized junction and timed program of one simulation.
#[derive(Debug)]
pub struct JunctionRegistry {
    config: ControllerConfig,
    programs: SlotMap<ProgramId, ProgramController>,
    control: BTreeMap<JunctionId, JunctionControl>,
    live: LiveLights,
    topology: TopologyQueue,
    history: EventBuffer,
    pass_events: Vec<ControllerEvent>,
    now: TickStamp,
}

impl Default for JunctionRegistry {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

impl JunctionRegistry {
    pub fn new(config: ControllerConfig) -> Self {
        let history = EventBuffer::new(config.event_history);
        Self {
            config,
            programs: SlotMap::with_key(),
            control: BTreeMap::new(),
            live: LiveLights::new(),
            topology: TopologyQueue::new(),
            history,
            pass_events: Vec::new(),
            now: TickStamp::default(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Queue through which the host reports road-network changes.
    pub fn topology_events(&mut self) -> &mut TopologyQueue {
        &mut self.topology
    }

    /// The ticks of the most recent pass.
    pub fn now(&self) -> TickStamp {
        self.now
    }

    /// Drop every junction and program. Used when the simulation unloads.
    pub fn clear(&mut self) {
        self.programs.clear();
        self.control.clear();
        self.live.clear();
        self.topology.clear();
        self.history.clear();
        self.pass_events.clear();
        self.now = TickStamp::default();
    }

    // -----------------------------------------------------------------------
    // Oracle
    // -----------------------------------------------------------------------

    pub fn control(&self, junction: JunctionId) -> Option<JunctionControl> {
        self.control.get(&junction).copied()
    }

    pub fn lights(&self, junction: JunctionId) -> Option<&JunctionLights> {
        self.live.get(&junction)
    }

    /// Operator access to a junction's live lights, e.g. before capturing a step.
    pub fn lights_mut(&mut self, junction: JunctionId) -> Option<&mut JunctionLights> {
        self.live.get_mut(&junction)
    }

    /// The light a vehicle of `class` obeys at a segment end.
    pub fn light(&self, end: SegmentEndId, class: VehicleClass) -> Option<&SegmentLightState> {
        self.live
            .get(&end.junction)?
            .group(end.segment)
            .map(|g| g.light(class))
    }

    pub fn signalized(&self) -> impl Iterator<Item = JunctionId> + '_ {
        self.control.keys().copied()
    }

    pub fn program(&self, id: ProgramId) -> Option<&ProgramController> {
        self.programs.get(id)
    }

    /// Direct access for editing steps, timing and test mode.
    pub fn program_mut(&mut self, id: ProgramId) -> Option<&mut ProgramController> {
        self.programs.get_mut(id)
    }

    pub fn programs(&self) -> impl Iterator<Item = (ProgramId, &ProgramController)> {
        self.programs.iter()
    }

    pub fn program_of(&self, junction: JunctionId) -> Option<ProgramId> {
        match self.control(junction)? {
            JunctionControl::Timed(id) => Some(id),
            JunctionControl::Manual => None,
        }
    }

    /// Push every junction's live lights to `sink`.
    pub fn publish(&self, sink: &mut dyn LightSink) {
        for (&junction, lights) in &self.live {
            sink.publish(junction, lights);
        }
    }

    /// Events of the most recent pass or operation.
    pub fn last_events(&self) -> &[ControllerEvent] {
        &self.pass_events
    }

    pub fn history(&self) -> &EventBuffer {
        &self.history
    }

    /// Deterministic hash of programs and lights, for desync detection.
    pub fn state_hash(&self) -> u64 {
        let mut hash = StateHash::new();
        hash.write_u64(self.now.phase);
        for (&junction, control) in &self.control {
            hash.write_u16(junction.0);
            hash.write_u8(match control {
                JunctionControl::Manual => 0,
                JunctionControl::Timed(_) => 1,
            });
        }
        for program in self.programs.values() {
            program.hash_into(&mut hash);
        }
        for lights in self.live.values() {
            lights.hash_into(&mut hash);
        }
        hash.finish()
    }

    fn emit(&mut self, event: ControllerEvent) {
        self.history.push(event.clone());
        self.pass_events.push(event);
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    fn ensure_lights(&mut self, junction: JunctionId, services: &Services<'_>) -> Result<(), ControllerError> {
        if !services.topology.junction_exists(junction) {
            return Err(ControllerError::TopologyInvalid(junction));
        }
        self.live
            .entry(junction)
            .or_insert_with(|| JunctionLights::build(junction, services.topology, services.restrictions));
        Ok(())
    }

    /// Signalize a junction with manually set lights. A timed junction
    /// leaves its program first.
    pub fn set_manual(&mut self, junction: JunctionId, services: &Services<'_>) -> Result<(), ControllerError> {
        self.ensure_lights(junction, services)?;
        if self.program_of(junction).is_some() {
            self.detach(junction, RemovalReason::Requested);
        }
        self.control.insert(junction, JunctionControl::Manual);
        tracing::info!(junction = %junction, "manual lights set up");
        Ok(())
    }

    /// Create a stopped, empty timed program over `junctions`; the first one
    /// becomes master. Manual junctions convert; junctions that already
    /// belong to a program are refused.
    pub fn set_up_timed_program(
        &mut self,
        junctions: &[JunctionId],
        services: &Services<'_>,
    ) -> Result<ProgramId, ControllerError> {
        for &junction in junctions {
            if !services.topology.junction_exists(junction) {
                return Err(ControllerError::TopologyInvalid(junction));
            }
            if self.program_of(junction).is_some() {
                return Err(ControllerError::AlreadyTimed(junction));
            }
        }
        let program = ProgramController::new(junctions)?;
        for &junction in program.node_group() {
            self.ensure_lights(junction, services)?;
        }
        let members = program.node_group().to_vec();
        let id = self.programs.insert(program);
        for &junction in &members {
            self.control.insert(junction, JunctionControl::Timed(id));
        }
        tracing::info!(program = ?id, members = ?members, "timed program set up");
        Ok(id)
    }

    fn program_entry(&mut self, id: ProgramId) -> Result<&mut ProgramController, ControllerError> {
        self.programs.get_mut(id).ok_or(ControllerError::UnknownProgram(id))
    }

    /// Append a step capturing the current live lights of every member.
    pub fn add_step(&mut self, id: ProgramId, timing: StepTiming) -> Result<usize, ControllerError> {
        let program = self.programs.get_mut(id).ok_or(ControllerError::UnknownProgram(id))?;
        program.add_step(timing, &self.live)
    }

    /// Re-capture a step from the current live lights of every member.
    pub fn recapture_step(&mut self, id: ProgramId, index: usize) -> Result<(), ControllerError> {
        let program = self.programs.get_mut(id).ok_or(ControllerError::UnknownProgram(id))?;
        program.recapture_step(index, &self.live)
    }

    pub fn start_program(&mut self, id: ProgramId, services: &Services<'_>) -> Result<(), ControllerError> {
        let now = self.now.phase;
        let program = self.programs.get_mut(id).ok_or(ControllerError::UnknownProgram(id))?;
        let pruned = program.start(now, services, &mut self.live)?;
        self.release_pruned(id, pruned);
        self.emit(ControllerEvent::ProgramStarted { program: id, tick: now });
        Ok(())
    }

    pub fn stop_program(&mut self, id: ProgramId) -> Result<(), ControllerError> {
        let program = self.program_entry(id)?;
        if !program.is_started() {
            return Ok(());
        }
        program.stop();
        let members = program.node_group().to_vec();
        for junction in members {
            if let Some(lights) = self.live.get_mut(&junction) {
                lights.make_red_or_green();
            }
        }
        let tick = self.now.phase;
        self.emit(ControllerEvent::ProgramStopped {
            program: id,
            reason: StopReason::Requested,
            tick,
        });
        Ok(())
    }

    /// Operator-forced advance to the next step.
    pub fn skip_step(&mut self, id: ProgramId) -> Result<usize, ControllerError> {
        let now = self.now.phase;
        let program = self.programs.get_mut(id).ok_or(ControllerError::UnknownProgram(id))?;
        let step = program.skip_step(now, &mut self.live)?;
        self.emit(ControllerEvent::PhaseAdvanced { program: id, step, tick: now });
        Ok(step)
    }

    /// Merge program `other` into `target`. Every junction of `other` then
    /// follows `target`, which restarts with the merged steps.
    pub fn join_programs(
        &mut self,
        target: ProgramId,
        other: ProgramId,
        services: &Services<'_>,
    ) -> Result<(), ControllerError> {
        if target == other {
            return Ok(());
        }
        let members: Vec<JunctionId> = [target, other]
            .iter()
            .map(|&id| self.programs.get(id).ok_or(ControllerError::UnknownProgram(id)))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flat_map(|p| p.node_group().iter().copied())
            .collect();
        if let Some(&missing) = members.iter().find(|j| !self.live.contains_key(j)) {
            return Err(ControllerError::UnknownJunction(missing));
        }

        let now = self.now.phase;
        let absorbed = self.programs.remove(other).ok_or(ControllerError::UnknownProgram(other))?;
        for junction in absorbed.node_group() {
            self.control.insert(*junction, JunctionControl::Timed(target));
        }
        let program = self.programs.get_mut(target).ok_or(ControllerError::UnknownProgram(target))?;
        if let Err(err) = program.join(absorbed, now, services, &mut self.live) {
            tracing::warn!(program = ?target, error = %err, "join failed; tearing down");
            self.teardown(target, stop_reason(&err));
            return Err(err);
        }
        self.emit(ControllerEvent::ProgramStopped {
            program: other,
            reason: StopReason::Requested,
            tick: now,
        });
        if self.programs.get(target).is_some_and(ProgramController::is_started) {
            self.emit(ControllerEvent::ProgramStarted { program: target, tick: now });
        }
        Ok(())
    }

    /// Take a junction out of its program and keep it signalized with its
    /// current lights under manual control.
    pub fn remove_from_program(&mut self, junction: JunctionId) -> Result<(), ControllerError> {
        if self.program_of(junction).is_none() {
            return Err(ControllerError::UnknownJunction(junction));
        }
        self.detach(junction, RemovalReason::Requested);
        self.control.insert(junction, JunctionControl::Manual);
        Ok(())
    }

    /// Stop signalizing a junction altogether.
    pub fn remove_junction(&mut self, junction: JunctionId) -> Result<(), ControllerError> {
        if !self.control.contains_key(&junction) {
            return Err(ControllerError::UnknownJunction(junction));
        }
        self.detach(junction, RemovalReason::Requested);
        self.control.remove(&junction);
        self.live.remove(&junction);
        tracing::info!(junction = %junction, "junction unsignalized");
        Ok(())
    }

    /// Remove a junction from its program, tearing the program down when it
    /// was the last member. The junction's own entry is left to the caller.
    fn detach(&mut self, junction: JunctionId, reason: RemovalReason) {
        let Some(id) = self.program_of(junction) else {
            return;
        };
        let tick = self.now.phase;
        let membership = self.programs.get_mut(id).map(|p| p.remove_member(junction));
        self.control.remove(&junction);
        self.emit(ControllerEvent::MemberRemoved {
            program: id,
            junction,
            reason,
            tick,
        });
        if matches!(membership, Some(Ok(Membership::Empty))) {
            self.teardown(id, StopReason::GroupEmpty);
        }
    }

    /// Drop a program. Its remaining members revert to unsignalized.
    fn teardown(&mut self, id: ProgramId, reason: StopReason) {
        let tick = self.now.phase;
        if self.programs.remove(id).is_none() {
            return;
        }
        let orphans: Vec<JunctionId> = self
            .control
            .iter()
            .filter(|&(_, &c)| c == JunctionControl::Timed(id))
            .map(|(&j, _)| j)
            .collect();
        for junction in &orphans {
            self.control.remove(junction);
            self.live.remove(junction);
        }
        tracing::warn!(program = ?id, ?reason, junctions = ?orphans, "timed program torn down");
        self.emit(ControllerEvent::ProgramStopped {
            program: id,
            reason,
            tick,
        });
    }

    /// Members a program dropped on its own revert to unsignalized.
    fn release_pruned(&mut self, id: ProgramId, pruned: Vec<(JunctionId, RemovalReason)>) {
        let tick = self.now.phase;
        for (junction, reason) in pruned {
            if self.control.get(&junction) == Some(&JunctionControl::Timed(id)) {
                self.control.remove(&junction);
                self.live.remove(&junction);
            }
            self.emit(ControllerEvent::MemberRemoved {
                program: id,
                junction,
                reason,
                tick,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Per-tick pass
    // -----------------------------------------------------------------------

    /// Advance every controller by one host frame and return the events of
    /// this pass.
    pub fn simulation_step(&mut self, frame: u64, services: &Services<'_>) -> &[ControllerEvent] {
        self.pass_events.clear();
        self.now = self.config.tick_scale.stamp(frame);
        let now = self.now;

        for event in self.topology.drain() {
            self.apply_topology_event(event, services);
        }
        self.verify_consensus();

        let ids: Vec<ProgramId> = self.programs.keys().collect();
        for id in ids {
            let Some(program) = self.programs.get_mut(id) else {
                continue;
            };
            match program.simulation_step(now, services, &self.config, &mut self.live) {
                Ok(report) => {
                    self.release_pruned(id, report.pruned);
                    match report.outcome {
                        PhaseOutcome::Ending(step) => self.emit(ControllerEvent::PhaseEnding {
                            program: id,
                            step,
                            tick: now.phase,
                        }),
                        PhaseOutcome::Advanced(step) => self.emit(ControllerEvent::PhaseAdvanced {
                            program: id,
                            step,
                            tick: now.phase,
                        }),
                        PhaseOutcome::Idle | PhaseOutcome::Holding => {}
                    }
                }
                Err(err) => {
                    if let ControllerError::StepCorrupted { junction, step, .. } = &err {
                        self.emit(ControllerEvent::StepInvalidated {
                            program: id,
                            junction: *junction,
                            step: *step,
                            tick: now.phase,
                        });
                    }
                    self.teardown(id, stop_reason(&err));
                }
            }
        }

        for lights in self.live.values_mut() {
            lights.update_pedestrians(services.topology, now.phase);
        }
        &self.pass_events
    }

    fn apply_topology_event(&mut self, event: TopologyEvent, services: &Services<'_>) {
        let junction = event.junction();
        if !self.control.contains_key(&junction) {
            return;
        }
        let removed = matches!(event, TopologyEvent::JunctionRemoved(_))
            || !services.topology.junction_exists(junction);
        if removed {
            self.detach(junction, RemovalReason::TopologyInvalid);
            self.control.remove(&junction);
            self.live.remove(&junction);
            tracing::warn!(junction = %junction, "signalized junction removed from the network");
            return;
        }

        let rebuilt = self
            .live
            .get_mut(&junction)
            .is_some_and(|l| l.housekeeping(services.topology, services.restrictions, true));
        if rebuilt {
            self.emit(ControllerEvent::LightsRebuilt {
                junction,
                tick: self.now.phase,
            });
        }
        if let Some(id) = self.program_of(junction) {
            let pruned = match self.programs.get_mut(id) {
                Some(program) => program.housekeeping(services, &self.live),
                None => Vec::new(),
            };
            self.release_pruned(id, pruned);
            if self.programs.get(id).is_some_and(|p| p.node_group().is_empty()) {
                self.teardown(id, StopReason::GroupEmpty);
            }
        }
    }

    /// Every node-group member must be registered as controlled by that
    /// group's program; members that are not are dropped from the group.
    fn verify_consensus(&mut self) {
        let mut broken: Vec<(ProgramId, JunctionId)> = Vec::new();
        for (id, program) in &self.programs {
            for &junction in program.node_group() {
                if self.control.get(&junction) != Some(&JunctionControl::Timed(id)) {
                    broken.push((id, junction));
                }
            }
        }
        let tick = self.now.phase;
        for (id, junction) in broken {
            tracing::warn!(program = ?id, junction = %junction, "node group consensus broken");
            let membership = self.programs.get_mut(id).map(|p| p.remove_member(junction));
            self.emit(ControllerEvent::MemberRemoved {
                program: id,
                junction,
                reason: RemovalReason::ConsensusBroken,
                tick,
            });
            if matches!(membership, Some(Ok(Membership::Empty))) {
                self.teardown(id, StopReason::GroupEmpty);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            header: SnapshotHeader::new(self.now.phase, self.now.metric),
            config: self.config.clone(),
            manual: self
                .control
                .iter()
                .filter(|&(_, &c)| c == JunctionControl::Manual)
                .map(|(&j, _)| j)
                .collect(),
            programs: self.programs.values().map(ProgramRecord::from_program).collect(),
            lights: self.live.values().cloned().collect(),
        }
    }

    pub fn save(&self) -> Result<Vec<u8>, SerializeError> {
        serialize::encode(&self.snapshot())
    }

    /// Rebuild a registry from saved bytes against the current network.
    pub fn load(data: &[u8], services: &Services<'_>) -> Result<Self, DeserializeError> {
        Self::restore(serialize::decode(data)?, services)
    }

    /// Rebuild a registry from a decoded snapshot. Junctions that no longer
    /// exist are skipped; running programs resume at their saved step.
    pub fn restore(snapshot: RegistrySnapshot, services: &Services<'_>) -> Result<Self, DeserializeError> {
        let mut registry = Self::new(snapshot.config);
        registry.now = TickStamp {
            phase: snapshot.header.phase_tick,
            metric: snapshot.header.metric_tick,
        };

        for mut lights in snapshot.lights {
            if services.topology.junction_exists(lights.junction) {
                lights.housekeeping(services.topology, services.restrictions, false);
                registry.live.insert(lights.junction, lights);
            }
        }
        for junction in snapshot.manual {
            if registry.live.contains_key(&junction) {
                registry.control.insert(junction, JunctionControl::Manual);
            }
        }

        for record in snapshot.programs {
            let (started, current) = (record.started, record.current_step);
            let mut program = record.into_program()?;
            program.housekeeping(services, &registry.live);
            if program.node_group().is_empty() {
                continue;
            }
            let members = program.node_group().to_vec();
            let id = registry.programs.insert(program);
            for junction in members {
                registry.control.insert(junction, JunctionControl::Timed(id));
            }
            if !started {
                continue;
            }
            let now = registry.now.phase;
            let resumed = match registry.programs.get_mut(id) {
                Some(program) => program.start_at(current, now, services, &mut registry.live),
                None => continue,
            };
            match resumed {
                Ok(pruned) => registry.release_pruned(id, pruned),
                Err(err) => {
                    tracing::warn!(program = ?id, error = %err, "saved program could not resume");
                    registry.teardown(id, stop_reason(&err));
                }
            }
        }
        tracing::info!(
            junctions = registry.control.len(),
            programs = registry.programs.len(),
            "registry loaded"
        );
        Ok(registry)
    }
}

fn stop_reason(err: &ControllerError) -> StopReason {
    match err {
        ControllerError::GroupEmpty => StopReason::GroupEmpty,
        ControllerError::TopologyInvalid(_) | ControllerError::ConsensusBroken(_) => StopReason::TopologyInvalid,
        _ => StopReason::StepCorrupted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::id::SegmentId;
    use crate::light::LightColor;
    use crate::services::NoTraffic;
    use crate::test_utils::*;

    /// Two steps per junction: odd segments green, then even segments green.
    fn two_phase(registry: &mut JunctionRegistry, id: ProgramId, timing: StepTiming) {
        let members = registry.program(id).unwrap().node_group().to_vec();
        for phase in 0..2 {
            for &j in &members {
                let lights = registry.lights_mut(j).unwrap();
                let segs = lights.segments();
                for (i, s) in segs.into_iter().enumerate() {
                    let color = if i % 2 == phase { LightColor::Green } else { LightColor::Red };
                    lights.group_mut(s).unwrap().set_all(color);
                }
            }
            registry.add_step(id, timing).unwrap();
        }
    }

    fn kinds(events: &[ControllerEvent]) -> Vec<EventKind> {
        events.iter().map(ControllerEvent::kind).collect()
    }

    #[test]
    fn manual_junction_gets_lights() {
        let (net, js) = TestNetwork::corridor(1);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        reg.set_manual(js[0], &services).unwrap();
        assert_eq!(reg.control(js[0]), Some(JunctionControl::Manual));
        assert_eq!(reg.lights(js[0]).unwrap().len(), 4);
        assert!(reg.light(SegmentEndId::new(js[0], SegmentId(11)), VehicleClass::PASSENGER_CAR).is_some());
        assert_eq!(
            reg.set_manual(JunctionId(99), &services),
            Err(ControllerError::TopologyInvalid(JunctionId(99)))
        );
    }

    #[test]
    fn junction_cannot_join_two_programs() {
        let (net, js) = TestNetwork::corridor(2);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        reg.set_up_timed_program(&js, &services).unwrap();
        assert_eq!(
            reg.set_up_timed_program(&js[1..], &services),
            Err(ControllerError::AlreadyTimed(js[1]))
        );
    }

    #[test]
    fn manual_junction_converts_to_timed() {
        let (net, js) = TestNetwork::corridor(1);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        reg.set_manual(js[0], &services).unwrap();
        let id = reg.set_up_timed_program(&js, &services).unwrap();
        assert_eq!(reg.control(js[0]), Some(JunctionControl::Timed(id)));
    }

    #[test]
    fn tick_pass_cycles_phases() {
        let (net, js) = TestNetwork::corridor(1);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut config = ControllerConfig::default();
        config.tick_scale.phase_shift = 0;
        config.tick_scale.metric_shift = 0;
        let mut reg = JunctionRegistry::new(config);
        let id = reg.set_up_timed_program(&js, &services).unwrap();
        two_phase(&mut reg, id, StepTiming::new(2, 2));
        reg.start_program(id, &services).unwrap();
        assert_eq!(kinds(reg.last_events()), vec![EventKind::ProgramStarted]);

        assert!(reg.simulation_step(1, &services).is_empty());
        assert_eq!(kinds(reg.simulation_step(2, &services)), vec![EventKind::PhaseEnding]);
        assert_eq!(kinds(reg.simulation_step(3, &services)), vec![EventKind::PhaseAdvanced]);
        assert_eq!(reg.program(id).unwrap().current_step(), 1);
    }

    #[test]
    fn stopping_freezes_lights_on_steady_colors() {
        let (net, js) = TestNetwork::corridor(1);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        let id = reg.set_up_timed_program(&js, &services).unwrap();
        two_phase(&mut reg, id, StepTiming::new(2, 4));
        reg.start_program(id, &services).unwrap();
        let end = SegmentEndId::new(js[0], SegmentId(11));
        assert_eq!(reg.light(end, VehicleClass::PASSENGER_CAR).unwrap().main(), LightColor::RedToGreen);

        reg.stop_program(id).unwrap();
        assert_eq!(reg.light(end, VehicleClass::PASSENGER_CAR).unwrap().main(), LightColor::Green);
        assert_eq!(
            kinds(reg.last_events()),
            vec![EventKind::ProgramStarted, EventKind::ProgramStopped]
        );
    }

    #[test]
    fn frames_map_to_phase_ticks() {
        let (net, js) = TestNetwork::corridor(1);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        let id = reg.set_up_timed_program(&js, &services).unwrap();
        two_phase(&mut reg, id, StepTiming::new(1, 1));
        reg.start_program(id, &services).unwrap();
        // With the default shift of 6, frames 0..64 are all phase tick 0.
        for frame in 0..64 {
            assert!(reg.simulation_step(frame, &services).is_empty(), "frame {frame}");
        }
        assert_eq!(kinds(reg.simulation_step(64, &services)), vec![EventKind::PhaseEnding]);
        assert_eq!(reg.now().phase, 1);
        assert_eq!(reg.now().metric, 2);
    }

    #[test]
    fn demolished_junction_leaves_program() {
        let (mut net, js) = TestNetwork::corridor(2);
        let mut reg = JunctionRegistry::default();
        let id = {
            let services = Services::new(&net, &net, &NoTraffic);
            let id = reg.set_up_timed_program(&js, &services).unwrap();
            two_phase(&mut reg, id, StepTiming::new(1, 3));
            reg.start_program(id, &services).unwrap();
            id
        };
        net.remove_junction(js[0]);
        reg.topology_events().push(TopologyEvent::JunctionRemoved(js[0]));
        let services = Services::new(&net, &net, &NoTraffic);
        reg.simulation_step(64, &services);

        assert_eq!(reg.control(js[0]), None);
        assert!(reg.lights(js[0]).is_none());
        let program = reg.program(id).unwrap();
        assert_eq!(program.master(), Some(js[1]));
        assert!(program.is_started());
        assert!(reg.history().of_kind(EventKind::MemberRemoved).count() == 1);
    }

    #[test]
    fn last_member_removal_tears_program_down() {
        let (net, js) = TestNetwork::corridor(1);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        let id = reg.set_up_timed_program(&js, &services).unwrap();
        reg.remove_junction(js[0]).unwrap();
        assert!(reg.program(id).is_none());
        assert_eq!(reg.control(js[0]), None);
        assert!(reg.history().of_kind(EventKind::ProgramStopped).count() == 1);
    }

    #[test]
    fn remove_from_program_keeps_manual_lights() {
        let (net, js) = TestNetwork::corridor(2);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        let id = reg.set_up_timed_program(&js, &services).unwrap();
        reg.remove_from_program(js[1]).unwrap();
        assert_eq!(reg.control(js[1]), Some(JunctionControl::Manual));
        assert!(reg.lights(js[1]).is_some());
        assert_eq!(reg.program(id).unwrap().node_group(), &js[..1]);
    }

    #[test]
    fn segment_change_rebuilds_lights_and_steps() {
        let (mut net, js) = TestNetwork::corridor(1);
        let mut reg = JunctionRegistry::default();
        let id = {
            let services = Services::new(&net, &net, &NoTraffic);
            let id = reg.set_up_timed_program(&js, &services).unwrap();
            two_phase(&mut reg, id, StepTiming::new(1, 3));
            reg.start_program(id, &services).unwrap();
            id
        };
        net.remove_segment(js[0], SegmentId(14));
        reg.topology_events().push(TopologyEvent::SegmentsChanged(js[0]));
        let services = Services::new(&net, &net, &NoTraffic);
        let events = kinds(reg.simulation_step(64, &services));
        assert!(events.contains(&EventKind::LightsRebuilt));
        assert!(!events.contains(&EventKind::ProgramStopped));
        assert_eq!(reg.lights(js[0]).unwrap().len(), 3);
        assert!(reg.program(id).unwrap().is_started());
    }

    #[test]
    fn unreported_segment_change_tears_down_only_that_program() {
        let (mut net, js) = TestNetwork::corridor(2);
        let mut reg = JunctionRegistry::default();
        let (a, b) = {
            let services = Services::new(&net, &net, &NoTraffic);
            let a = reg.set_up_timed_program(&js[..1], &services).unwrap();
            let b = reg.set_up_timed_program(&js[1..], &services).unwrap();
            two_phase(&mut reg, a, StepTiming::new(1, 3));
            two_phase(&mut reg, b, StepTiming::new(1, 3));
            reg.start_program(a, &services).unwrap();
            reg.start_program(b, &services).unwrap();
            (a, b)
        };
        // The live lights change without the program being told.
        net.remove_segment(js[0], SegmentId(14));
        let services = Services::new(&net, &net, &NoTraffic);
        reg.lights_mut(js[0]).unwrap().housekeeping(&net, &net, false);

        let events = kinds(reg.simulation_step(64, &services));
        assert!(events.contains(&EventKind::StepInvalidated));
        assert!(events.contains(&EventKind::ProgramStopped));
        assert!(reg.program(a).is_none());
        assert_eq!(reg.control(js[0]), None);
        assert!(reg.program(b).unwrap().is_started());
    }

    #[test]
    fn broken_consensus_drops_member() {
        let (net, js) = TestNetwork::corridor(2);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        let id = reg.set_up_timed_program(&js, &services).unwrap();
        // Simulate a stale registry entry.
        reg.control.insert(js[1], JunctionControl::Manual);
        reg.simulation_step(0, &services);
        assert_eq!(reg.program(id).unwrap().node_group(), &js[..1]);
        assert_eq!(reg.control(js[1]), Some(JunctionControl::Manual));
    }

    #[test]
    fn join_points_members_at_target() {
        let (net, js) = TestNetwork::corridor(2);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        let a = reg.set_up_timed_program(&js[..1], &services).unwrap();
        let b = reg.set_up_timed_program(&js[1..], &services).unwrap();
        two_phase(&mut reg, a, StepTiming::new(2, 4));
        two_phase(&mut reg, b, StepTiming::new(4, 6));
        reg.join_programs(a, b, &services).unwrap();
        assert!(reg.program(b).is_none());
        assert_eq!(reg.control(js[1]), Some(JunctionControl::Timed(a)));
        let program = reg.program(a).unwrap();
        assert_eq!(program.node_group(), &js[..]);
        assert_eq!(program.step(js[1], 0).unwrap().timing().min_ticks(), 3);
        assert!(program.is_started());
    }

    #[test]
    fn join_restarts_running_programs() {
        let (net, js) = TestNetwork::corridor(2);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut config = ControllerConfig::default();
        config.tick_scale.phase_shift = 0;
        config.tick_scale.metric_shift = 0;
        let mut reg = JunctionRegistry::new(config);
        let a = reg.set_up_timed_program(&js[..1], &services).unwrap();
        let b = reg.set_up_timed_program(&js[1..], &services).unwrap();
        two_phase(&mut reg, a, StepTiming::new(2, 2));
        two_phase(&mut reg, b, StepTiming::new(2, 2));
        reg.start_program(a, &services).unwrap();
        reg.start_program(b, &services).unwrap();
        for frame in 1..=3 {
            reg.simulation_step(frame, &services);
        }
        assert_eq!(reg.program(a).unwrap().current_step(), 1);

        reg.join_programs(a, b, &services).unwrap();
        let program = reg.program(a).unwrap();
        assert!(program.is_started());
        for &j in &js {
            assert_eq!(program.current_step_of(j), Some(0));
        }
    }

    #[test]
    fn pedestrians_follow_vehicle_lights() {
        let (net, js) = TestNetwork::corridor(1);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        reg.set_manual(js[0], &services).unwrap();
        reg.lights_mut(js[0]).unwrap().group_mut(SegmentId(11)).unwrap().set_all(LightColor::Green);
        reg.simulation_step(0, &services);
        let lights = reg.lights(js[0]).unwrap();
        assert_eq!(lights.group(SegmentId(11)).unwrap().pedestrian(), Some(LightColor::Green));
        assert_eq!(lights.group(SegmentId(13)).unwrap().pedestrian(), Some(LightColor::Red));
    }

    #[test]
    fn publish_pushes_every_junction() {
        let (net, js) = TestNetwork::corridor(3);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        for &j in &js {
            reg.set_manual(j, &services).unwrap();
        }
        let mut sink = RecordingSink::default();
        reg.publish(&mut sink);
        assert_eq!(sink.publish_count, 3);
        assert_eq!(sink.published.len(), 3);
    }

    #[test]
    fn save_and_load_resume_programs() {
        let (net, js) = TestNetwork::corridor(2);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        let id = reg.set_up_timed_program(&js, &services).unwrap();
        two_phase(&mut reg, id, StepTiming::new(1, 2));
        reg.start_program(id, &services).unwrap();
        for frame in (0..400).step_by(64) {
            reg.simulation_step(frame, &services);
        }
        let current = reg.program(id).unwrap().current_step();

        let data = reg.save().unwrap();
        let loaded = JunctionRegistry::load(&data, &services).unwrap();
        let (loaded_id, program) = loaded.programs().next().unwrap();
        assert_eq!(program.node_group(), &js[..]);
        assert!(program.is_started());
        assert_eq!(program.current_step(), current);
        assert_eq!(loaded.control(js[1]), Some(JunctionControl::Timed(loaded_id)));
        assert_eq!(loaded.now(), reg.now());
    }

    #[test]
    fn load_skips_demolished_junctions() {
        let (mut net, js) = TestNetwork::corridor(2);
        let mut reg = JunctionRegistry::default();
        {
            let services = Services::new(&net, &net, &NoTraffic);
            reg.set_manual(js[0], &services).unwrap();
            reg.set_manual(js[1], &services).unwrap();
        }
        let data = reg.save().unwrap();
        net.remove_junction(js[1]);
        let services = Services::new(&net, &net, &NoTraffic);
        let loaded = JunctionRegistry::load(&data, &services).unwrap();
        assert_eq!(loaded.signalized().collect::<Vec<_>>(), vec![js[0]]);
    }

    #[test]
    fn clear_empties_registry() {
        let (net, js) = TestNetwork::corridor(1);
        let services = Services::new(&net, &net, &NoTraffic);
        let mut reg = JunctionRegistry::default();
        reg.set_up_timed_program(&js, &services).unwrap();
        reg.clear();
        assert_eq!(reg.signalized().count(), 0);
        assert_eq!(reg.programs().count(), 0);
    }
}
