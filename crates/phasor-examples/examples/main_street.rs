//! Main Street example: a data-driven, three-junction node group.
//!
//! Loads `data/controller.toml` and `data/programs.ron`, installs the program
//! on an in-memory corridor, and drives it with shifting traffic. Main Street
//! carries a steady stream while the side streets queue up every few hundred
//! frames, so the adaptive rule cuts some phases short.
//!
//! Run with: `RUST_LOG=debug cargo run -p phasor-examples --example main_street`

use std::path::Path;

use phasor_core::id::{JunctionId, SegmentEndId, SegmentId};
use phasor_core::registry::JunctionRegistry;
use phasor_core::services::Services;
use phasor_core::test_utils::{ScriptedMetrics, TestNetwork};
use phasor_core::vehicle::VehicleClass;
use phasor_data::{install_programs, load_signal_plan};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let data_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("data");
    let plan = load_signal_plan(&data_dir)?;

    let (net, junctions) = TestNetwork::corridor(3);
    let mut registry = JunctionRegistry::new(plan.config.clone());

    let mut metrics = ScriptedMetrics::uniform(&net, 2.0, 0.5);
    let installed = {
        let services = Services::new(&net, &net, &metrics);
        install_programs(&mut registry, &plan.programs, &services, &plan.programs_file)?
    };
    let program = installed["main_street"];

    for frame in 0..4_000u64 {
        // Side-street queues come and go.
        let side_queue = if (frame / 512) % 2 == 1 { 6.0 } else { 0.0 };
        for &j in &junctions {
            for side in [2, 4] {
                let end = SegmentEndId::new(j, SegmentId(j.0 * 10 + side));
                for target in 1..=4 {
                    if target != side {
                        metrics.set_decayed(end, SegmentId(j.0 * 10 + target), side_queue);
                    }
                }
            }
        }

        let services = Services::new(&net, &net, &metrics);
        for event in registry.simulation_step(frame, &services) {
            info!(frame, ?event, "controller event");
        }
    }

    let p = registry.program(program).ok_or("program vanished")?;
    info!(
        step = p.current_step(),
        hash = registry.state_hash(),
        "finished"
    );
    for (kind, count) in summarize(&registry) {
        println!("{kind:>16}: {count}");
    }
    let light = registry
        .light(SegmentEndId::new(JunctionId(2), SegmentId(21)), VehicleClass::PASSENGER_CAR)
        .ok_or("junction 2 is not signalized")?;
    println!("junction 2, Main Street westbound: {:?}", light.visual_color());
    Ok(())
}

fn summarize(registry: &JunctionRegistry) -> Vec<(String, usize)> {
    let mut counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for event in registry.history().iter() {
        *counts.entry(format!("{:?}", event.kind())).or_default() += 1;
    }
    counts.into_iter().collect()
}
