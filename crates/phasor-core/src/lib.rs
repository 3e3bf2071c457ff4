//! Phasor Core -- adaptive timed traffic-signal control.
//!
//! This crate provides per-segment-end traffic lights, timed programs that
//! cycle through recorded steps, adaptive phase switching driven by flow and
//! wait measurements, master/slave synchronization of junction groups, and the
//! registry that ties every signalized junction of a simulation together.
//!
//! # Per-Tick Pass
//!
//! Each call to [`registry::JunctionRegistry::simulation_step`] advances every
//! controller by one host frame:
//!
//! 1. **Clock** -- Derive the phase and metric ticks from the frame counter.
//! 2. **Topology** -- Apply queued road-network changes to live lights and steps.
//! 3. **Consensus** -- Drop node-group members the registry no longer routes
//!    to their program.
//! 4. **Programs** -- Each master decides whether its phase is over; every
//!    member writes its current step's colors into its live lights.
//! 5. **Pedestrians** -- Derive automatic pedestrian signals from the vehicle
//!    lights.
//!
//! # Host Boundary
//!
//! The host simulation supplies its road network, lane restrictions and
//! traffic counts through the traits in [`services`], and reads lights back
//! through [`registry::JunctionRegistry::light`] or a [`services::LightSink`].
//!
//! ```rust,ignore
//! let services = Services::new(&network, &network, &metrics);
//! let program = registry.set_up_timed_program(&[a, b], &services)?;
//! registry.add_step(program, StepTiming::new(5, 10))?;
//! registry.start_program(program, &services)?;
//! for event in registry.simulation_step(frame, &services) { /* ... */ }
//! ```
//!
//! # Key Types
//!
//! - [`light::SegmentLightState`] -- Left/main/right arrows of one light.
//! - [`light_group::SegmentEndLightGroup`] -- Every light at one segment end,
//!   split by exclusive vehicle class, plus a pedestrian signal.
//! - [`step::StepState`] -- One recorded phase with dwell bounds and the
//!   flow/wait switching rule.
//! - [`program::ProgramController`] -- The synchronized step sequence of a
//!   node group; the first member is master.
//! - [`registry::JunctionRegistry`] -- Every signalized junction and program.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point type for deterministic math.
//! - [`serialize`] -- Versioned snapshots via bitcode.

pub mod config;
pub mod error;
pub mod event;
pub mod fixed;
pub mod id;
pub mod junction;
pub mod light;
pub mod light_group;
pub mod program;
pub mod registry;
pub mod serialize;
pub mod services;
pub mod sim;
pub mod step;
pub mod topology_queue;
pub mod vehicle;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
