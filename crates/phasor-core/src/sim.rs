//! Tick clock types.
//!
//! The host simulation advances a fine-grained frame counter. Controller
//! timing runs on coarser ticks derived from that counter by right-shifting.
//! Phase timing and flow/wait measurement use two independent shifts.

use crate::fixed::{Fixed64, Ticks};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tick scale
// ---------------------------------------------------------------------------

/// Default shift from host frames to phase ticks (64 frames per phase tick).
pub const DEFAULT_PHASE_SHIFT: u32 = 6;

/// Default shift from host frames to metric ticks (32 frames per metric tick).
pub const DEFAULT_METRIC_SHIFT: u32 = 5;

/// How host frames map onto the two controller clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickScale {
    /// Right-shift applied to the frame counter to obtain the phase tick.
    pub phase_shift: u32,
    /// Right-shift applied to the frame counter to obtain the metric tick.
    pub metric_shift: u32,
}

impl Default for TickScale {
    fn default() -> Self {
        Self {
            phase_shift: DEFAULT_PHASE_SHIFT,
            metric_shift: DEFAULT_METRIC_SHIFT,
        }
    }
}

impl TickScale {
    /// Derive both controller clocks from a host frame counter.
    pub fn stamp(&self, frame: u64) -> TickStamp {
        TickStamp {
            phase: frame.checked_shr(self.phase_shift).unwrap_or(0),
            metric: frame.checked_shr(self.metric_shift).unwrap_or(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Tick stamp
// ---------------------------------------------------------------------------

/// The controller's view of "now" for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickStamp {
    /// Coarse tick used for every phase-timing decision.
    pub phase: Ticks,
    /// Tick used to rate-limit flow/wait measurement.
    pub metric: Ticks,
}

impl TickStamp {
    /// A stamp where both clocks read the same value.
    pub fn uniform(tick: Ticks) -> Self {
        Self {
            phase: tick,
            metric: tick,
        }
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A simple deterministic hash of controller state for desync detection.
///
/// Uses FNV-1a (64-bit) for speed and simplicity. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    /// Start a new hash.
    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    /// Feed bytes into the hash.
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write(&[v]);
    }

    pub fn write_fixed64(&mut self, v: Fixed64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    /// Finalize and return the hash value.
    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scale_uses_distinct_shifts() {
        let scale = TickScale::default();
        let stamp = scale.stamp(640);
        assert_eq!(stamp.phase, 10);
        assert_eq!(stamp.metric, 20);
    }

    #[test]
    fn custom_scale_is_independent() {
        let scale = TickScale {
            phase_shift: 0,
            metric_shift: 2,
        };
        let stamp = scale.stamp(12);
        assert_eq!(stamp.phase, 12);
        assert_eq!(stamp.metric, 3);
    }

    #[test]
    fn oversized_shift_yields_zero() {
        let scale = TickScale {
            phase_shift: 80,
            metric_shift: 64,
        };
        assert_eq!(scale.stamp(u64::MAX), TickStamp::uniform(0));
    }

    #[test]
    fn state_hash_deterministic() {
        let mut h1 = StateHash::new();
        h1.write_u64(42);
        let mut h2 = StateHash::new();
        h2.write_u64(42);
        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn state_hash_differs_for_different_input() {
        let mut h1 = StateHash::new();
        h1.write_u16(1);
        let mut h2 = StateHash::new();
        h2.write_u16(2);
        assert_ne!(h1.finish(), h2.finish());
    }
}
