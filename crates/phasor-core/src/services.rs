//! Collaborator interfaces the controller consumes.
//!
//! The controller owns no geometry, lane permissions or vehicle data. The
//! host simulation implements these traits and hands them to every tick in a
//! [`Services`] bundle. Colors flow back out only through [`LightSink`] or by
//! reading the registry.

use crate::fixed::Fixed64;
use crate::id::{JunctionId, LaneIndex, SegmentEndId, SegmentId};
use crate::junction::JunctionLights;
use crate::light::{ArrowDirection, TurnAvailability};
use crate::vehicle::VehicleClass;

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Structural queries about the road network.
pub trait Topology {
    /// Whether the junction still exists.
    fn junction_exists(&self, junction: JunctionId) -> bool;

    /// Every segment connected to the junction, in a stable order.
    fn segment_ends(&self, junction: JunctionId) -> Vec<SegmentId>;

    /// Whether traffic can enter the junction from this segment end.
    /// Outgoing-only (one-way) ends carry no signal heads.
    fn has_incoming_lanes(&self, end: SegmentEndId) -> bool;

    /// Direction of travel from `from` to `to` at `junction`.
    fn direction(&self, junction: JunctionId, from: SegmentId, to: SegmentId) -> ArrowDirection;

    /// Which exits are physically reachable from this segment end.
    fn turns(&self, end: SegmentEndId) -> TurnAvailability;

    /// Segment length, used to normalize vehicle counts. Non-positive
    /// lengths are treated as 1.
    fn segment_length(&self, segment: SegmentId) -> Fixed64;
}

// ---------------------------------------------------------------------------
// Vehicle restrictions
// ---------------------------------------------------------------------------

/// Lane permission lookup.
pub trait VehicleRestrictions {
    /// Allowed vehicle classes for each incoming lane at the segment end.
    fn lane_classes(&self, end: SegmentEndId) -> Vec<(LaneIndex, VehicleClass)>;
}

// ---------------------------------------------------------------------------
// Traffic metrics
// ---------------------------------------------------------------------------

/// Which population of vehicles a metric query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricWindow {
    /// Vehicles positioned to discharge right now.
    Current,
    /// A short look-back where older observations decay by `decay` per tick.
    Decayed { decay: Fixed64 },
}

/// Vehicles approaching a segment end that want to leave via `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSample {
    pub target: SegmentId,
    pub vehicles: Fixed64,
}

/// Vehicle counts around junctions.
pub trait TrafficMetrics {
    /// Samples of vehicles of `classes` approaching `end`, one per target segment.
    fn approaching(
        &self,
        end: SegmentEndId,
        classes: VehicleClass,
        window: MetricWindow,
    ) -> Vec<TrafficSample>;
}

// ---------------------------------------------------------------------------
// Light sink
// ---------------------------------------------------------------------------

/// Receives computed lights. The controller never reads back from a sink.
pub trait LightSink {
    fn publish(&mut self, junction: JunctionId, lights: &JunctionLights);
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// The query collaborators passed to one controller call.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub topology: &'a dyn Topology,
    pub restrictions: &'a dyn VehicleRestrictions,
    pub metrics: &'a dyn TrafficMetrics,
}

impl<'a> Services<'a> {
    pub fn new(
        topology: &'a dyn Topology,
        restrictions: &'a dyn VehicleRestrictions,
        metrics: &'a dyn TrafficMetrics,
    ) -> Self {
        Self {
            topology,
            restrictions,
            metrics,
        }
    }
}

/// A metric source that never sees any vehicles.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTraffic;

impl TrafficMetrics for NoTraffic {
    fn approaching(&self, _: SegmentEndId, _: VehicleClass, _: MetricWindow) -> Vec<TrafficSample> {
        Vec::new()
    }
}
