//! Join and resume example: merge two programs, save, and load.
//!
//! Two independent programs are set up in code with different timing. They
//! are joined into one node group whose step bounds are the averages of
//! both, then the registry is saved, a junction is demolished, and the saved
//! state is loaded back against the changed network.
//!
//! Run with: `cargo run -p phasor-examples --example join_and_resume`

use phasor_core::id::ProgramId;
use phasor_core::light::LightColor;
use phasor_core::registry::JunctionRegistry;
use phasor_core::services::{NoTraffic, Services};
use phasor_core::step::StepTiming;
use phasor_core::test_utils::TestNetwork;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Record a two-step program: odd segments green, then even ones.
fn record(registry: &mut JunctionRegistry, program: ProgramId, timing: StepTiming) -> Result<(), Box<dyn std::error::Error>> {
    let members = registry.program(program).ok_or("unknown program")?.node_group().to_vec();
    for phase in 0..2usize {
        for &junction in &members {
            let lights = registry.lights_mut(junction).ok_or("junction has no lights")?;
            for (i, segment) in lights.segments().into_iter().enumerate() {
                if let Some(group) = lights.group_mut(segment) {
                    group.set_all(if i % 2 == phase { LightColor::Green } else { LightColor::Red });
                }
            }
        }
        registry.add_step(program, timing)?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (mut net, js) = TestNetwork::corridor(4);
    let mut registry = JunctionRegistry::default();

    let bytes = {
        let services = Services::new(&net, &net, &NoTraffic);
        let west = registry.set_up_timed_program(&js[..2], &services)?;
        let east = registry.set_up_timed_program(&js[2..], &services)?;
        record(&mut registry, west, StepTiming::new(2, 6))?;
        record(&mut registry, east, StepTiming::new(6, 10))?;
        registry.start_program(east, &services)?;

        registry.join_programs(west, east, &services)?;
        let joined = registry.program(west).ok_or("join lost the program")?;
        for (i, step) in joined.timeline(js[0]).ok_or("no master timeline")?.steps().iter().enumerate() {
            let t = step.timing();
            info!(step = i, min = t.min_ticks(), max = t.max_ticks(), "merged step");
        }

        for frame in 0..2_000u64 {
            registry.simulation_step(frame, &services);
        }
        info!(hash = registry.state_hash(), "before save");
        registry.save()?
    };
    println!("saved {} bytes", bytes.len());

    // The master is demolished while the game is not running.
    net.remove_junction(js[0]);
    let services = Services::new(&net, &net, &NoTraffic);
    let mut loaded = JunctionRegistry::load(&bytes, &services)?;
    for (id, program) in loaded.programs() {
        println!(
            "program {id:?}: master {:?}, {} members, running: {}",
            program.master(),
            program.node_group().len(),
            program.is_started()
        );
    }
    for frame in 2_000..2_500u64 {
        for event in loaded.simulation_step(frame, &services) {
            info!(frame, ?event, "controller event");
        }
    }
    Ok(())
}
