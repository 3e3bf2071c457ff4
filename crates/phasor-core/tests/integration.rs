//! Integration tests for the Phasor controller.
//!
//! These tests drive a [`JunctionRegistry`] end to end: program setup,
//! adaptive switching across synchronized node groups, topology changes,
//! joins, persistence and determinism.

use phasor_core::config::ControllerConfig;
use phasor_core::event::{ControllerEvent, EventKind, StopReason};
use phasor_core::id::*;
use phasor_core::light::LightColor;
use phasor_core::registry::{JunctionControl, JunctionRegistry};
use phasor_core::services::{NoTraffic, Services, TrafficMetrics};
use phasor_core::step::StepTiming;
use phasor_core::test_utils::*;
use phasor_core::topology_queue::TopologyEvent;
use phasor_core::vehicle::VehicleClass;

// ===========================================================================
// Helpers
// ===========================================================================

/// A registry whose phase and metric ticks equal the frame counter.
fn unscaled_registry() -> JunctionRegistry {
    let mut config = ControllerConfig::default();
    config.tick_scale.phase_shift = 0;
    config.tick_scale.metric_shift = 0;
    JunctionRegistry::new(config)
}

/// Record two steps per member: ring positions 0 and 2 green, then 1 and 3.
fn record_two_phases(reg: &mut JunctionRegistry, program: ProgramId, timing: StepTiming) {
    let members = reg.program(program).unwrap().node_group().to_vec();
    for phase in 0..2usize {
        for &junction in &members {
            let lights = reg.lights_mut(junction).unwrap();
            for (i, segment) in lights.segments().into_iter().enumerate() {
                let color = if i % 2 == phase { LightColor::Green } else { LightColor::Red };
                lights.group_mut(segment).unwrap().set_all(color);
            }
        }
        reg.add_step(program, timing).unwrap();
    }
}

fn main_color(reg: &JunctionRegistry, junction: JunctionId, segment: u16) -> LightColor {
    reg.light(SegmentEndId::new(junction, SegmentId(segment)), VehicleClass::PASSENGER_CAR)
        .unwrap()
        .main()
}

fn kinds(events: &[ControllerEvent]) -> Vec<EventKind> {
    events.iter().map(ControllerEvent::kind).collect()
}

fn run(reg: &mut JunctionRegistry, frames: std::ops::Range<u64>, services: &Services<'_>) {
    for frame in frames {
        reg.simulation_step(frame, services);
    }
}

// ===========================================================================
// Test 1: Three-junction consensus
// ===========================================================================
//
// A corridor of three junctions shares one program. Queues build at every red
// approach while nothing flows on green, so the master ends the phase as soon
// as the adaptive window opens. Every member switches on the same tick.

#[test]
fn three_junction_consensus() {
    let (net, js) = TestNetwork::corridor(3);
    let metrics = ScriptedMetrics::uniform(&net, 0.0, 3.0);
    let services = Services::new(&net, &net, &metrics);
    let mut reg = unscaled_registry();
    let program = reg.set_up_timed_program(&js, &services).unwrap();
    record_two_phases(&mut reg, program, StepTiming::new(1, 10));
    reg.start_program(program, &services).unwrap();

    // Tick 0 is the start transition of step 0.
    for &j in &js {
        assert_eq!(main_color(&reg, j, j.0 * 10 + 1), LightColor::RedToGreen);
        assert_eq!(main_color(&reg, j, j.0 * 10 + 2), LightColor::Red);
    }

    // Tick 1: window opens, wait beats flow, the end transition shows.
    assert_eq!(kinds(reg.simulation_step(1, &services)), vec![EventKind::PhaseEnding]);
    for &j in &js {
        assert_eq!(main_color(&reg, j, j.0 * 10 + 1), LightColor::GreenToRed);
        assert_eq!(main_color(&reg, j, j.0 * 10 + 2), LightColor::Red);
    }

    // Tick 2: every member is on step 1.
    assert_eq!(kinds(reg.simulation_step(2, &services)), vec![EventKind::PhaseAdvanced]);
    let p = reg.program(program).unwrap();
    for &j in &js {
        assert_eq!(p.current_step_of(j), Some(1));
        assert_eq!(main_color(&reg, j, j.0 * 10 + 1), LightColor::Red);
        assert_eq!(main_color(&reg, j, j.0 * 10 + 2), LightColor::RedToGreen);
    }

    // The queues are now on the other approaches, so the cycle repeats.
    assert_eq!(kinds(reg.simulation_step(3, &services)), vec![EventKind::PhaseEnding]);
    for &j in &js {
        assert_eq!(main_color(&reg, j, j.0 * 10 + 2), LightColor::GreenToRed);
    }
    assert_eq!(kinds(reg.simulation_step(4, &services)), vec![EventKind::PhaseAdvanced]);
    assert_eq!(reg.program(program).unwrap().current_step(), 0);
}

// ===========================================================================
// Test 2: Upper bound without traffic
// ===========================================================================
//
// With no vehicles the default rule never fires, so every phase runs to its
// maximum: 4 ticks of green plus one tick of end transition.

#[test]
fn phases_run_to_upper_bound_without_traffic() {
    let (net, js) = TestNetwork::corridor(1);
    let services = Services::new(&net, &net, &NoTraffic);
    let mut reg = unscaled_registry();
    let program = reg.set_up_timed_program(&js, &services).unwrap();
    record_two_phases(&mut reg, program, StepTiming::new(2, 4));
    reg.start_program(program, &services).unwrap();

    let mut advanced_at = Vec::new();
    for frame in 1..=20 {
        for event in reg.simulation_step(frame, &services) {
            if let ControllerEvent::PhaseAdvanced { tick, step, .. } = event {
                advanced_at.push((*tick, *step));
            }
        }
    }
    assert_eq!(advanced_at, vec![(5, 1), (10, 0), (15, 1), (20, 0)]);
}

// ===========================================================================
// Test 3: Determinism
// ===========================================================================

fn scripted_run(metrics: &dyn TrafficMetrics, frames: u64) -> Vec<u64> {
    let (net, js) = TestNetwork::corridor(3);
    let services = Services::new(&net, &net, metrics);
    let mut reg = JunctionRegistry::default();
    let a = reg.set_up_timed_program(&js[..2], &services).unwrap();
    let b = reg.set_up_timed_program(&js[2..], &services).unwrap();
    record_two_phases(&mut reg, a, StepTiming::new(2, 6));
    record_two_phases(&mut reg, b, StepTiming::new(1, 3));
    reg.start_program(a, &services).unwrap();
    reg.start_program(b, &services).unwrap();
    (0..frames)
        .map(|frame| {
            reg.simulation_step(frame, &services);
            reg.state_hash()
        })
        .collect()
}

#[test]
fn identical_runs_hash_identically() {
    let (net, _) = TestNetwork::corridor(3);
    let metrics = ScriptedMetrics::uniform(&net, 1.0, 2.0);
    let first = scripted_run(&metrics, 2_000);
    let second = scripted_run(&metrics, 2_000);
    assert_eq!(first, second);
    // The lights actually changed along the way.
    assert!(first.windows(2).any(|w| w[0] != w[1]));
}

// ===========================================================================
// Test 4: Join merges programs
// ===========================================================================

#[test]
fn joined_programs_switch_together() {
    let (net, js) = TestNetwork::corridor(2);
    let services = Services::new(&net, &net, &NoTraffic);
    let mut reg = unscaled_registry();
    let a = reg.set_up_timed_program(&js[..1], &services).unwrap();
    let b = reg.set_up_timed_program(&js[1..], &services).unwrap();
    record_two_phases(&mut reg, a, StepTiming::new(1, 2));
    record_two_phases(&mut reg, b, StepTiming::new(3, 6));
    reg.start_program(b, &services).unwrap();

    reg.join_programs(a, b, &services).unwrap();
    assert!(reg.program(b).is_none());
    assert_eq!(reg.control(js[1]), Some(JunctionControl::Timed(a)));
    let stopped: Vec<_> = reg.history().of_kind(EventKind::ProgramStopped).collect();
    assert_eq!(stopped.len(), 1);

    let p = reg.program(a).unwrap();
    assert_eq!(p.master(), Some(js[0]));
    for &j in &js {
        let t = p.step(j, 0).unwrap().timing();
        assert_eq!((t.min_ticks(), t.max_ticks()), (2, 4));
    }

    run(&mut reg, 1..6, &services);
    let p = reg.program(a).unwrap();
    assert_eq!(p.current_step_of(js[0]), Some(1));
    assert_eq!(p.current_step_of(js[1]), Some(1));
}

// ===========================================================================
// Test 5: Failure isolation
// ===========================================================================
//
// A junction demolished without anyone telling the registry takes down only
// its own program on the next pass, and its junction reverts to unsignalized.

#[test]
fn vanished_master_tears_down_only_its_program() {
    let (mut net, js) = TestNetwork::corridor(2);
    let mut reg = unscaled_registry();
    let (a, b) = {
        let services = Services::new(&net, &net, &NoTraffic);
        let a = reg.set_up_timed_program(&js[..1], &services).unwrap();
        let b = reg.set_up_timed_program(&js[1..], &services).unwrap();
        record_two_phases(&mut reg, a, StepTiming::new(1, 3));
        record_two_phases(&mut reg, b, StepTiming::new(1, 3));
        reg.start_program(a, &services).unwrap();
        reg.start_program(b, &services).unwrap();
        (a, b)
    };

    net.remove_junction(js[0]);
    let services = Services::new(&net, &net, &NoTraffic);
    let events = reg.simulation_step(1, &services).to_vec();

    assert!(events.iter().any(|e| matches!(
        e,
        ControllerEvent::ProgramStopped { program, reason: StopReason::GroupEmpty, .. } if *program == a
    )));
    assert!(reg.program(a).is_none());
    assert_eq!(reg.control(js[0]), None);
    assert!(reg.program(b).unwrap().is_started());

    run(&mut reg, 2..10, &services);
    assert!(reg.program(b).unwrap().is_started());
}

#[test]
fn reported_topology_change_keeps_program_running() {
    let (mut net, js) = TestNetwork::corridor(2);
    let mut reg = unscaled_registry();
    let program = {
        let services = Services::new(&net, &net, &NoTraffic);
        let program = reg.set_up_timed_program(&js, &services).unwrap();
        record_two_phases(&mut reg, program, StepTiming::new(1, 3));
        reg.start_program(program, &services).unwrap();
        program
    };

    net.set_lanes(
        SegmentEndId::new(js[1], SegmentId(21)),
        vec![VehicleClass::ROAD_VEHICLE, VehicleClass::TRAM],
    );
    reg.topology_events().push(TopologyEvent::SegmentsChanged(js[1]));
    let services = Services::new(&net, &net, &NoTraffic);
    let events = kinds(reg.simulation_step(1, &services));
    assert!(events.contains(&EventKind::LightsRebuilt));
    assert!(!events.contains(&EventKind::ProgramStopped));

    let group = reg.lights(js[1]).unwrap().group(SegmentId(21)).unwrap();
    assert!(group.has_dedicated(VehicleClass::TRAM));
    run(&mut reg, 2..12, &services);
    assert!(reg.program(program).unwrap().is_started());
}

// ===========================================================================
// Test 6: Save and load
// ===========================================================================

#[test]
fn save_load_resumes_identically() {
    let (net, js) = TestNetwork::corridor(2);
    let services = Services::new(&net, &net, &NoTraffic);
    let mut reg = JunctionRegistry::default();
    let program = reg.set_up_timed_program(&js[..1], &services).unwrap();
    reg.set_manual(js[1], &services).unwrap();
    record_two_phases(&mut reg, program, StepTiming::new(3, 5));
    reg.start_program(program, &services).unwrap();
    reg.simulation_step(64, &services);

    let bytes = reg.save().unwrap();
    let loaded = JunctionRegistry::load(&bytes, &services).unwrap();
    assert_eq!(loaded.control(js[1]), Some(JunctionControl::Manual));
    assert_eq!(loaded.programs().count(), 1);
    let (_, p) = loaded.programs().next().unwrap();
    assert!(p.is_started());
    assert_eq!(p.current_step(), reg.program(program).unwrap().current_step());
    assert_eq!(loaded.lights(js[1]), reg.lights(js[1]));
}

#[test]
fn corrupted_save_is_rejected() {
    let (net, _) = TestNetwork::corridor(1);
    let services = Services::new(&net, &net, &NoTraffic);
    let reg = JunctionRegistry::default();
    let mut bytes = reg.save().unwrap();
    bytes.truncate(bytes.len() / 2);
    assert!(JunctionRegistry::load(&bytes, &services).is_err());
}

// ===========================================================================
// Test 7: Test mode
// ===========================================================================

#[test]
fn test_mode_holds_current_step() {
    let (net, js) = TestNetwork::corridor(1);
    let services = Services::new(&net, &net, &NoTraffic);
    let mut reg = unscaled_registry();
    let program = reg.set_up_timed_program(&js, &services).unwrap();
    record_two_phases(&mut reg, program, StepTiming::new(1, 2));
    reg.start_program(program, &services).unwrap();
    reg.program_mut(program).unwrap().set_test_mode(true);

    run(&mut reg, 1..30, &services);
    assert_eq!(reg.program(program).unwrap().current_step(), 0);

    assert_eq!(reg.skip_step(program).unwrap(), 1);
    assert_eq!(main_color(&reg, js[0], 12), LightColor::RedToGreen);
}
