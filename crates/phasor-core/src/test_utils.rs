//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use std::collections::{BTreeMap, BTreeSet};

use crate::fixed::Fixed64;
use crate::id::*;
use crate::junction::JunctionLights;
use crate::light::{ArrowDirection, TurnAvailability};
use crate::services::{
    LightSink, MetricWindow, Topology, TrafficMetrics, TrafficSample, VehicleRestrictions,
};
use crate::vehicle::VehicleClass;

// ===========================================================================
// Fixed-point helper
// ===========================================================================

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Four consecutive segment ids starting at `first`.
pub fn segments(first: u16) -> [SegmentId; 4] {
    [
        SegmentId(first),
        SegmentId(first + 1),
        SegmentId(first + 2),
        SegmentId(first + 3),
    ]
}

// ===========================================================================
// In-memory road network
// ===========================================================================

/// A road network of junctions whose segments sit at ring positions 0..4,
/// numbered clockwise.
///
/// Turning from position `a` to position `b` is a left turn when
/// `b - a == 1 (mod 4)`, straight ahead when it is 2, right when 3 and a
/// u-turn when 0. Every incoming end carries one road-vehicle lane unless
/// configured otherwise; segments are 1 unit long by default.
#[derive(Debug, Clone, Default)]
pub struct TestNetwork {
    junctions: BTreeMap<JunctionId, Vec<(SegmentId, u8)>>,
    outgoing_only: BTreeSet<SegmentEndId>,
    lanes: BTreeMap<SegmentEndId, Vec<VehicleClass>>,
    lengths: BTreeMap<SegmentId, Fixed64>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a junction with segments at the given ring positions.
    pub fn add_junction(&mut self, junction: JunctionId, ends: &[(SegmentId, u8)]) -> JunctionId {
        let ends = ends.iter().map(|&(s, pos)| (s, pos % 4)).collect();
        self.junctions.insert(junction, ends);
        junction
    }

    /// Add a four-way junction; segments take positions 0, 1, 2, 3 in order.
    pub fn add_four_way(&mut self, junction: JunctionId, segments: [SegmentId; 4]) -> JunctionId {
        let ends: Vec<(SegmentId, u8)> = segments
            .iter()
            .enumerate()
            .map(|(pos, &s)| (s, pos as u8))
            .collect();
        self.add_junction(junction, &ends)
    }

    /// `count` four-way junctions numbered from 1; junction `n` owns
    /// segments `10n + 1 ..= 10n + 4`.
    pub fn corridor(count: u16) -> (Self, Vec<JunctionId>) {
        let mut net = Self::new();
        let junctions = (1..=count)
            .map(|n| net.add_four_way(JunctionId(n), segments(n * 10 + 1)))
            .collect();
        (net, junctions)
    }

    pub fn remove_segment(&mut self, junction: JunctionId, segment: SegmentId) {
        if let Some(ends) = self.junctions.get_mut(&junction) {
            ends.retain(|&(s, _)| s != segment);
        }
    }

    pub fn remove_junction(&mut self, junction: JunctionId) {
        self.junctions.remove(&junction);
    }

    /// Replace the lanes of a segment end; one lane per mask.
    pub fn set_lanes(&mut self, end: SegmentEndId, lanes: Vec<VehicleClass>) {
        self.lanes.insert(end, lanes);
    }

    /// Make a segment end carry outgoing lanes only.
    pub fn set_outgoing_only(&mut self, end: SegmentEndId) {
        self.outgoing_only.insert(end);
    }

    pub fn set_segment_length(&mut self, segment: SegmentId, length: f64) {
        self.lengths.insert(segment, fixed(length));
    }

    fn position(&self, junction: JunctionId, segment: SegmentId) -> Option<u8> {
        self.junctions
            .get(&junction)?
            .iter()
            .find(|&&(s, _)| s == segment)
            .map(|&(_, pos)| pos)
    }

    fn occupied(&self, junction: JunctionId, pos: u8) -> bool {
        self.junctions
            .get(&junction)
            .is_some_and(|ends| ends.iter().any(|&(_, p)| p == pos % 4))
    }
}

impl Topology for TestNetwork {
    fn junction_exists(&self, junction: JunctionId) -> bool {
        self.junctions.contains_key(&junction)
    }

    fn segment_ends(&self, junction: JunctionId) -> Vec<SegmentId> {
        self.junctions
            .get(&junction)
            .map(|ends| ends.iter().map(|&(s, _)| s).collect())
            .unwrap_or_default()
    }

    fn has_incoming_lanes(&self, end: SegmentEndId) -> bool {
        self.position(end.junction, end.segment).is_some() && !self.outgoing_only.contains(&end)
    }

    fn direction(&self, junction: JunctionId, from: SegmentId, to: SegmentId) -> ArrowDirection {
        let (Some(a), Some(b)) = (self.position(junction, from), self.position(junction, to)) else {
            return ArrowDirection::Forward;
        };
        match (b + 4 - a) % 4 {
            0 => ArrowDirection::Turn,
            1 => ArrowDirection::Left,
            2 => ArrowDirection::Forward,
            _ => ArrowDirection::Right,
        }
    }

    fn turns(&self, end: SegmentEndId) -> TurnAvailability {
        let Some(p) = self.position(end.junction, end.segment) else {
            return TurnAvailability::default();
        };
        TurnAvailability {
            left: self.occupied(end.junction, p + 1),
            forward: self.occupied(end.junction, p + 2),
            right: self.occupied(end.junction, p + 3),
        }
    }

    fn segment_length(&self, segment: SegmentId) -> Fixed64 {
        self.lengths.get(&segment).copied().unwrap_or(Fixed64::ONE)
    }
}

impl VehicleRestrictions for TestNetwork {
    fn lane_classes(&self, end: SegmentEndId) -> Vec<(LaneIndex, VehicleClass)> {
        if !self.has_incoming_lanes(end) {
            return Vec::new();
        }
        let masks = self
            .lanes
            .get(&end)
            .cloned()
            .unwrap_or_else(|| vec![VehicleClass::ROAD_VEHICLE]);
        masks
            .into_iter()
            .enumerate()
            .map(|(i, m)| (LaneIndex(i as u8), m))
            .collect()
    }
}

// ===========================================================================
// Scripted traffic
// ===========================================================================

/// Traffic metrics that answer from fixed per-end sample tables.
///
/// Samples are returned regardless of the vehicle classes asked for.
#[derive(Debug, Clone, Default)]
pub struct ScriptedMetrics {
    current: BTreeMap<SegmentEndId, Vec<TrafficSample>>,
    decayed: BTreeMap<SegmentEndId, Vec<TrafficSample>>,
}

impl ScriptedMetrics {
    /// The same counts on every incoming end of `network`, toward every
    /// other segment of the junction.
    pub fn uniform(network: &TestNetwork, current: f64, decayed: f64) -> Self {
        let mut metrics = Self::default();
        for (&junction, ends) in &network.junctions {
            for &(from, _) in ends {
                let end = SegmentEndId::new(junction, from);
                for &(to, _) in ends.iter().filter(|&&(s, _)| s != from) {
                    metrics.set_current(end, to, current);
                    metrics.set_decayed(end, to, decayed);
                }
            }
        }
        metrics
    }

    pub fn set_current(&mut self, end: SegmentEndId, target: SegmentId, vehicles: f64) {
        upsert(self.current.entry(end).or_default(), target, vehicles);
    }

    pub fn set_decayed(&mut self, end: SegmentEndId, target: SegmentId, vehicles: f64) {
        upsert(self.decayed.entry(end).or_default(), target, vehicles);
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.decayed.clear();
    }
}

fn upsert(samples: &mut Vec<TrafficSample>, target: SegmentId, vehicles: f64) {
    let vehicles = fixed(vehicles);
    match samples.iter_mut().find(|s| s.target == target) {
        Some(sample) => sample.vehicles = vehicles,
        None => samples.push(TrafficSample { target, vehicles }),
    }
}

impl TrafficMetrics for ScriptedMetrics {
    fn approaching(
        &self,
        end: SegmentEndId,
        _classes: VehicleClass,
        window: MetricWindow,
    ) -> Vec<TrafficSample> {
        let table = match window {
            MetricWindow::Current => &self.current,
            MetricWindow::Decayed { .. } => &self.decayed,
        };
        table.get(&end).cloned().unwrap_or_default()
    }
}

// ===========================================================================
// Light sink
// ===========================================================================

/// A sink that keeps the most recently published lights per junction.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub published: BTreeMap<JunctionId, JunctionLights>,
    pub publish_count: usize,
}

impl LightSink for RecordingSink {
    fn publish(&mut self, junction: JunctionId, lights: &JunctionLights) {
        self.published.insert(junction, lights.clone());
        self.publish_count += 1;
    }
}
