//! Live light state of one signalized junction.
//!
//! [`JunctionLights`] owns the live [`SegmentEndLightGroup`] of every
//! incoming segment end at a junction. Timed programs write into it each tick;
//! the renderer and vehicle AI read from it.

use std::collections::BTreeMap;

use crate::fixed::Ticks;
use crate::id::{JunctionId, SegmentEndId, SegmentId};
use crate::light::LightColor;
use crate::light_group::SegmentEndLightGroup;
use crate::services::{Topology, VehicleRestrictions};
use crate::sim::StateHash;
use serde::{Deserialize, Serialize};

/// Live lights of every signalized junction, keyed by junction.
pub type LiveLights = BTreeMap<JunctionId, JunctionLights>;

/// The live lights at one junction, keyed by incoming segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JunctionLights {
    pub junction: JunctionId,
    groups: BTreeMap<SegmentId, SegmentEndLightGroup>,
}

impl JunctionLights {
    /// An empty set of lights. Use [`JunctionLights::build`] to populate from topology.
    pub fn new(junction: JunctionId) -> Self {
        Self {
            junction,
            groups: BTreeMap::new(),
        }
    }

    /// Create one group per incoming segment end and derive its vehicle classes.
    pub fn build(
        junction: JunctionId,
        topology: &dyn Topology,
        restrictions: &dyn VehicleRestrictions,
    ) -> Self {
        let mut lights = Self::new(junction);
        lights.housekeeping(topology, restrictions, false);
        lights
    }

    /// Bring the set of groups in line with the current topology: add groups
    /// for new incoming ends, drop vanished ones, re-run class housekeeping.
    /// Returns whether anything changed.
    pub fn housekeeping(
        &mut self,
        topology: &dyn Topology,
        restrictions: &dyn VehicleRestrictions,
        may_delete: bool,
    ) -> bool {
        let incoming: Vec<SegmentId> = topology
            .segment_ends(self.junction)
            .into_iter()
            .filter(|&segment| topology.has_incoming_lanes(SegmentEndId::new(self.junction, segment)))
            .collect();

        let before = self.groups.len();
        self.groups.retain(|segment, _| incoming.contains(segment));
        let mut changed = self.groups.len() != before;

        for segment in incoming {
            let end = SegmentEndId::new(self.junction, segment);
            let group = self.groups.entry(segment).or_insert_with(|| {
                changed = true;
                SegmentEndLightGroup::new(end)
            });
            changed |= group.housekeeping(may_delete, &restrictions.lane_classes(end));
        }
        changed
    }

    pub fn group(&self, segment: SegmentId) -> Option<&SegmentEndLightGroup> {
        self.groups.get(&segment)
    }

    pub fn group_mut(&mut self, segment: SegmentId) -> Option<&mut SegmentEndLightGroup> {
        self.groups.get_mut(&segment)
    }

    pub fn groups(&self) -> impl Iterator<Item = (SegmentId, &SegmentEndLightGroup)> {
        self.groups.iter().map(|(&s, g)| (s, g))
    }

    pub fn groups_mut(&mut self) -> impl Iterator<Item = (SegmentId, &mut SegmentEndLightGroup)> {
        self.groups.iter_mut().map(|(&s, g)| (s, g))
    }

    pub fn segments(&self) -> Vec<SegmentId> {
        self.groups.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Snap every light at the junction to a steady color.
    pub fn make_red_or_green(&mut self) {
        for group in self.groups.values_mut() {
            group.make_red_or_green();
        }
    }

    pub fn make_red(&mut self) {
        for group in self.groups.values_mut() {
            group.make_red();
        }
    }

    /// Derive automatic pedestrian signals.
    ///
    /// Pedestrians crossing segment S see red while any vehicle light at
    /// another segment end shows a non-red arrow toward S. Manually pinned
    /// pedestrian signals are left alone.
    pub fn update_pedestrians(&mut self, topology: &dyn Topology, now: Ticks) {
        let mut colors: Vec<(SegmentId, LightColor)> = Vec::new();
        for (&target, group) in &self.groups {
            if group.pedestrian().is_none() || group.is_manual_pedestrian() {
                continue;
            }
            let conflicting = self.groups.iter().any(|(&source, other)| {
                source != target
                    && other.any_non_red_toward(topology.direction(self.junction, source, target))
            });
            let color = if conflicting {
                LightColor::Red
            } else {
                LightColor::Green
            };
            colors.push((target, color));
        }
        for (segment, color) in colors {
            if let Some(group) = self.groups.get_mut(&segment) {
                group.write_pedestrian(color, now);
            }
        }
    }

    pub(crate) fn hash_into(&self, hash: &mut StateHash) {
        hash.write_u16(self.junction.0);
        for group in self.groups.values() {
            group.hash_into(hash);
        }
    }
}
