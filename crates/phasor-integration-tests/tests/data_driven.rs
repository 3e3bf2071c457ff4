//! Cross-crate integration tests: data files to running controllers.
//!
//! Programs are loaded with `phasor-data`, installed into a
//! `phasor-core` registry on an in-memory corridor, and driven for many
//! frames.

use std::fs;
use std::path::{Path, PathBuf};

use phasor_core::event::EventKind;
use phasor_core::id::*;
use phasor_core::light::LightColor;
use phasor_core::registry::{JunctionControl, JunctionRegistry};
use phasor_core::services::{NoTraffic, Services};
use phasor_core::test_utils::*;
use phasor_core::topology_queue::TopologyEvent;
use phasor_core::vehicle::VehicleClass;
use phasor_data::{install_programs, load_signal_plan, SignalPlan};

fn example_data() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../phasor-examples/data")
}

fn make_test_dir(suffix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("phasor_it_{suffix}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn install(plan: &SignalPlan, net: &TestNetwork, metrics: &ScriptedMetrics) -> (JunctionRegistry, ProgramId) {
    let services = Services::new(net, net, metrics);
    let mut registry = JunctionRegistry::new(plan.config.clone());
    let installed = install_programs(&mut registry, &plan.programs, &services, &plan.programs_file).unwrap();
    let id = *installed.values().next().unwrap();
    (registry, id)
}

// ===========================================================================
// Example data
// ===========================================================================

#[test]
fn example_plan_runs_in_lockstep() {
    let plan = load_signal_plan(&example_data()).unwrap();
    assert_eq!(plan.config.event_history, 512);
    let (net, js) = TestNetwork::corridor(3);
    let metrics = ScriptedMetrics::uniform(&net, 1.0, 2.0);
    let (mut registry, program) = install(&plan, &net, &metrics);
    let services = Services::new(&net, &net, &metrics);

    for frame in 0..5_000u64 {
        registry.simulation_step(frame, &services);
        let p = registry.program(program).unwrap();
        let step = p.current_step();
        for &j in &js {
            assert_eq!(p.current_step_of(j), Some(step), "frame {frame}");
        }
    }
    assert!(registry.program(program).unwrap().is_started());
    assert!(registry.history().of_kind(EventKind::PhaseAdvanced).count() > 5);
    assert_eq!(registry.history().of_kind(EventKind::ProgramStopped).count(), 0);
}

#[test]
fn example_plan_pins_pedestrians_in_side_phase() {
    let plan = load_signal_plan(&example_data()).unwrap();
    let (net, _) = TestNetwork::corridor(3);
    let metrics = ScriptedMetrics::default();
    let (mut registry, program) = install(&plan, &net, &metrics);
    let services = Services::new(&net, &net, &NoTraffic);

    let mut frame = 0;
    while registry.program(program).unwrap().current_step() != 1 {
        frame += 1;
        registry.simulation_step(frame, &services);
        assert!(frame < 10_000, "side phase never started");
    }
    // One phase tick later the start transition is over.
    for _ in 0..64 {
        frame += 1;
        registry.simulation_step(frame, &services);
    }
    assert_eq!(registry.program(program).unwrap().current_step(), 1);
    let group = registry.lights(JunctionId(2)).unwrap().group(SegmentId(21)).unwrap();
    assert!(group.is_manual_pedestrian());
    assert_eq!(group.pedestrian(), Some(LightColor::Green));
    let main = registry
        .light(SegmentEndId::new(JunctionId(2), SegmentId(21)), VehicleClass::PASSENGER_CAR)
        .unwrap();
    assert!(main.main().is_red());
}

// ===========================================================================
// Formats
// ===========================================================================

const PROGRAM_JSON: &str = r#"[{
    "name": "pair",
    "junctions": [1, 2],
    "start": true,
    "steps": [
        {"min_ticks": 1, "max_ticks": 3, "lights": [
            {"junction": 1, "segment": 11, "main": "green"},
            {"junction": 2, "segment": 21, "main": "green"}
        ]},
        {"min_ticks": 2, "max_ticks": 5, "change_metric": "first_wait", "lights": [
            {"junction": 1, "segment": 12, "main": "green", "left": "red"},
            {"junction": 2, "segment": 22, "main": "green"}
        ]}
    ]
}]"#;

const PROGRAM_TOML: &str = r#"
[[programs]]
name = "pair"
junctions = [1, 2]
start = true

[[programs.steps]]
min_ticks = 1
max_ticks = 3
lights = [
    { junction = 1, segment = 11, main = "green" },
    { junction = 2, segment = 21, main = "green" },
]

[[programs.steps]]
min_ticks = 2
max_ticks = 5
change_metric = "first_wait"
lights = [
    { junction = 1, segment = 12, main = "green", left = "red" },
    { junction = 2, segment = 22, main = "green" },
]
"#;

const PROGRAM_RON: &str = r#"#![enable(implicit_some)]
[(
    name: "pair",
    junctions: [1, 2],
    start: true,
    steps: [
        (min_ticks: 1, max_ticks: 3, lights: [
            (junction: 1, segment: 11, main: green),
            (junction: 2, segment: 21, main: green),
        ]),
        (min_ticks: 2, max_ticks: 5, change_metric: Some("first_wait"), lights: [
            (junction: 1, segment: 12, main: green, left: Some(red)),
            (junction: 2, segment: 22, main: green),
        ]),
    ],
)]"#;

#[test]
fn all_formats_drive_identically() {
    let (net, _) = TestNetwork::corridor(2);
    let metrics = ScriptedMetrics::uniform(&net, 0.5, 1.5);
    let mut hashes = Vec::new();
    for (ext, body) in [("json", PROGRAM_JSON), ("toml", PROGRAM_TOML), ("ron", PROGRAM_RON)] {
        let dir = make_test_dir(&format!("formats_{ext}"));
        fs::write(dir.join(format!("programs.{ext}")), body).unwrap();
        let plan = load_signal_plan(&dir).unwrap();
        let (mut registry, _) = install(&plan, &net, &metrics);
        let services = Services::new(&net, &net, &metrics);
        for frame in 0..3_000u64 {
            registry.simulation_step(frame, &services);
        }
        hashes.push(registry.state_hash());
        let _ = fs::remove_dir_all(&dir);
    }
    assert_eq!(hashes[0], hashes[1]);
    assert_eq!(hashes[1], hashes[2]);
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[test]
fn demolished_slave_leaves_data_program() {
    let plan = load_signal_plan(&example_data()).unwrap();
    let (mut net, js) = TestNetwork::corridor(3);
    let metrics = ScriptedMetrics::default();
    let (mut registry, program) = install(&plan, &net, &metrics);

    net.remove_junction(js[1]);
    registry.topology_events().push(TopologyEvent::JunctionRemoved(js[1]));
    let services = Services::new(&net, &net, &metrics);
    for frame in 0..1_000u64 {
        registry.simulation_step(frame, &services);
    }
    let p = registry.program(program).unwrap();
    assert_eq!(p.node_group(), &[js[0], js[2]]);
    assert!(p.is_started());
    assert_eq!(registry.control(js[1]), None);
}

#[test]
fn data_program_survives_save_and_load() {
    let plan = load_signal_plan(&example_data()).unwrap();
    let (net, js) = TestNetwork::corridor(3);
    let metrics = ScriptedMetrics::uniform(&net, 1.0, 1.0);
    let (mut registry, program) = install(&plan, &net, &metrics);
    let services = Services::new(&net, &net, &metrics);
    for frame in 0..1_500u64 {
        registry.simulation_step(frame, &services);
    }

    let bytes = registry.save().unwrap();
    let mut loaded = JunctionRegistry::load(&bytes, &services).unwrap();
    assert_eq!(loaded.config(), registry.config());
    let (id, p) = loaded.programs().next().unwrap();
    assert_eq!(p.current_step(), registry.program(program).unwrap().current_step());
    for &j in &js {
        assert_eq!(loaded.control(j), Some(JunctionControl::Timed(id)));
    }
    for frame in 1_500..3_000u64 {
        loaded.simulation_step(frame, &services);
    }
    assert!(loaded.program(id).unwrap().is_started());
}
