//! Controller configuration.
//!
//! Every field has a default, so partial configuration files deserialize.

use crate::fixed::{Fixed64, Ticks};
use crate::sim::TickScale;
use crate::step::StepChangeMetric;
use serde::{Deserialize, Serialize};

/// Weight of the previous reading when flow/wait are smoothed with 0.1 / 0.9.
pub const SMOOTHING_PREVIOUS_LIGHT: Fixed64 = Fixed64::from_bits(0x1999_999A);

/// Weight of the previous reading when flow/wait are smoothed with 0.25 / 0.75.
pub const SMOOTHING_PREVIOUS_HEAVY: Fixed64 = Fixed64::from_bits(0x4000_0000);

/// Per-tick decay of the look-back window used to estimate queued vehicles.
pub const DEFAULT_QUEUE_DECAY: Fixed64 = Fixed64::from_bits(0x1999_999A);

/// Exponential smoothing of flow/wait readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowWaitSmoothing {
    /// Weight given to the previous smoothed value; the new reading gets the rest.
    pub previous_weight: Fixed64,
}

impl Default for FlowWaitSmoothing {
    fn default() -> Self {
        Self {
            previous_weight: SMOOTHING_PREVIOUS_HEAVY,
        }
    }
}

impl FlowWaitSmoothing {
    pub fn new(previous_weight: Fixed64) -> Self {
        Self {
            previous_weight: previous_weight.clamp(Fixed64::ZERO, Fixed64::ONE),
        }
    }

    /// Blend a new reading into the previous smoothed value.
    pub fn blend(&self, previous: Fixed64, reading: Fixed64) -> Fixed64 {
        let w = self.previous_weight.clamp(Fixed64::ZERO, Fixed64::ONE);
        previous.saturating_mul(w).saturating_add(reading.saturating_mul(Fixed64::ONE - w))
    }
}

/// Tunables shared by every controller in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub smoothing: FlowWaitSmoothing,
    pub tick_scale: TickScale,
    pub queue_decay: Fixed64,
    /// Balance given to steps created without an explicit one.
    pub default_wait_flow_balance: Fixed64,
    pub default_change_metric: StepChangeMetric,
    /// Dwell bounds for steps created without explicit timing.
    pub default_min_ticks: Ticks,
    pub default_max_ticks: Ticks,
    /// Capacity of the registry's event history.
    pub event_history: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            smoothing: FlowWaitSmoothing::default(),
            tick_scale: TickScale::default(),
            queue_decay: DEFAULT_QUEUE_DECAY,
            default_wait_flow_balance: Fixed64::ONE,
            default_change_metric: StepChangeMetric::Default,
            default_min_ticks: 5,
            default_max_ticks: 10,
            event_history: 256,
        }
    }
}
