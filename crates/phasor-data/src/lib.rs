//! Phasor Data -- loads controller configuration and signal programs from
//! RON, TOML or JSON files and installs them into a registry.

pub mod loader;
pub mod schema;

pub use loader::{install_programs, load_signal_plan, DataLoadError, SignalPlan};
