//! Per-segment-end light groups.
//!
//! A [`SegmentEndLightGroup`] holds one [`SegmentLightState`] per vehicle
//! class that is signaled separately at a segment end. Lookups go through an
//! explicit two-tier table: the dedicated-class lights first, then the
//! default light that serves every other class. Lookups never fail.

use std::collections::BTreeMap;

use crate::fixed::Ticks;
use crate::id::{LaneIndex, SegmentEndId};
use crate::light::{ArrowDirection, LightColor, Mode, SegmentLightState};
use crate::sim::StateHash;
use crate::vehicle::VehicleClass;
use serde::{Deserialize, Serialize};

/// A light reserved for one exclusive vehicle class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedicatedLight {
    pub class: VehicleClass,
    pub light: SegmentLightState,
}

/// All lights at one segment end plus its pedestrian signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEndLightGroup {
    pub end: SegmentEndId,
    /// Tier 2: serves every class without a dedicated light.
    default_light: SegmentLightState,
    /// Tier 1: insertion-ordered dedicated lights.
    dedicated: Vec<DedicatedLight>,
    /// Lanes that resolve to a dedicated light. Other lanes use the default.
    lane_classes: BTreeMap<LaneIndex, VehicleClass>,
    pedestrian: Option<LightColor>,
    manual_pedestrian: bool,
    last_change: Ticks,
}

impl SegmentEndLightGroup {
    /// A group with only a red default light and no pedestrian signal.
    pub fn new(end: SegmentEndId) -> Self {
        Self {
            end,
            default_light: SegmentLightState::new(end),
            dedicated: Vec::new(),
            lane_classes: BTreeMap::new(),
            pedestrian: None,
            manual_pedestrian: false,
            last_change: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Re-derive the dedicated classes and the pedestrian signal from the
    /// allowed-class mask of every incoming lane.
    ///
    /// New dedicated lights start as copies of the default light. Without
    /// `may_delete`, lights whose lanes disappeared are kept so operator
    /// configuration survives geometry edits. Returns whether anything changed.
    pub fn housekeeping(&mut self, may_delete: bool, lanes: &[(LaneIndex, VehicleClass)]) -> bool {
        let before = self.clone();

        let mut lane_classes = BTreeMap::new();
        let mut backed = VehicleClass::empty();
        let mut allowed = VehicleClass::empty();

        for &(lane, mask) in lanes {
            allowed |= mask;
            let Some(class) = mask.exclusive_class() else {
                continue;
            };
            if !self.dedicated.iter().any(|d| d.class == class) {
                let mut light = self.default_light.clone();
                light.snap_to_steady();
                self.dedicated.push(DedicatedLight { class, light });
                tracing::debug!(end = %self.end, class = class.name(), "dedicated light added");
            }
            lane_classes.insert(lane, class);
            backed |= class;
        }

        if may_delete {
            self.dedicated.retain(|d| backed.contains(d.class));
        }
        self.lane_classes = lane_classes;

        let wants_pedestrian = !allowed.is_empty() && !allowed.is_rail_only();
        match (wants_pedestrian, self.pedestrian) {
            (true, None) => self.pedestrian = Some(LightColor::Red),
            (false, Some(_)) => {
                self.pedestrian = None;
                self.manual_pedestrian = false;
            }
            _ => {}
        }

        *self != before
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// The light serving `class`: a dedicated light covering it, else the default.
    pub fn light(&self, class: VehicleClass) -> &SegmentLightState {
        self.dedicated_index(class)
            .map(|i| &self.dedicated[i].light)
            .unwrap_or(&self.default_light)
    }

    pub fn light_mut(&mut self, class: VehicleClass) -> &mut SegmentLightState {
        match self.dedicated_index(class) {
            Some(i) => &mut self.dedicated[i].light,
            None => &mut self.default_light,
        }
    }

    /// The light governing a lane. Unknown lanes resolve to the default light.
    pub fn light_for_lane(&self, lane: LaneIndex) -> &SegmentLightState {
        match self.lane_classes.get(&lane) {
            Some(&class) => self.light(class),
            None => &self.default_light,
        }
    }

    pub fn default_light(&self) -> &SegmentLightState {
        &self.default_light
    }

    /// Every light in display order: default first, then dedicated lights in
    /// the order they were created.
    pub fn lights(&self) -> impl Iterator<Item = (VehicleClass, &SegmentLightState)> {
        std::iter::once((VehicleClass::GENERAL, &self.default_light))
            .chain(self.dedicated.iter().map(|d| (d.class, &d.light)))
    }

    /// Classes with their own light, default class first.
    pub fn classes(&self) -> Vec<VehicleClass> {
        self.lights().map(|(class, _)| class).collect()
    }

    pub fn has_dedicated(&self, class: VehicleClass) -> bool {
        self.dedicated.iter().any(|d| d.class == class)
    }

    /// The vehicle classes a light actually serves, for metric queries.
    pub fn served_classes(&self, class: VehicleClass) -> VehicleClass {
        if self.has_dedicated(class) {
            return class;
        }
        self.dedicated
            .iter()
            .fold(VehicleClass::all(), |acc, d| acc - d.class)
    }

    fn dedicated_index(&self, class: VehicleClass) -> Option<usize> {
        if class.is_empty() {
            return None;
        }
        self.dedicated
            .iter()
            .position(|d| d.class == class)
            .or_else(|| self.dedicated.iter().position(|d| d.class.contains(class)))
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    /// Set the colors of the light serving `class`. Records `now` when any
    /// arrow actually changed.
    pub fn apply_colors(
        &mut self,
        class: VehicleClass,
        left: LightColor,
        main: LightColor,
        right: LightColor,
        now: Ticks,
    ) {
        let light = self.light_mut(class);
        let before = (light.left(), light.main(), light.right());
        light.set_colors(left, main, right);
        if before != (light.left(), light.main(), light.right()) {
            self.last_change = now;
        }
    }

    /// Show `color` on every arrow of every light.
    pub fn set_all(&mut self, color: LightColor) {
        for light in self.lights_mut() {
            light.set_colors(color, color, color);
        }
    }

    pub fn make_red(&mut self) {
        self.set_all(LightColor::Red);
        if let Some(p) = self.pedestrian.as_mut() {
            *p = LightColor::Red;
        }
    }

    /// Snap every light (and the pedestrian signal) to a steady color.
    pub fn make_red_or_green(&mut self) {
        for light in self.lights_mut() {
            light.snap_to_steady();
        }
        if let Some(p) = self.pedestrian.as_mut() {
            *p = p.steady();
        }
    }

    /// Copy modes and colors from another group, resolving each of this
    /// group's classes through the other group's two-tier lookup.
    pub fn copy_states_from(&mut self, other: &SegmentEndLightGroup) {
        for class in self.classes() {
            let source = other.light(class).clone();
            let target = self.light_mut(class);
            target.set_mode(source.mode());
            target.set_colors(source.left(), source.main(), source.right());
        }
        if self.pedestrian.is_some() {
            self.manual_pedestrian = other.manual_pedestrian;
            if other.manual_pedestrian {
                self.pedestrian = other.pedestrian;
            }
        }
    }

    fn lights_mut(&mut self) -> impl Iterator<Item = &mut SegmentLightState> {
        std::iter::once(&mut self.default_light).chain(self.dedicated.iter_mut().map(|d| &mut d.light))
    }

    /// Set the mode of every light at this segment end.
    pub fn set_mode(&mut self, mode: Mode) {
        for light in self.lights_mut() {
            light.set_mode(mode);
        }
    }

    // -----------------------------------------------------------------------
    // Pedestrians
    // -----------------------------------------------------------------------

    pub fn pedestrian(&self) -> Option<LightColor> {
        self.pedestrian
    }

    pub fn is_manual_pedestrian(&self) -> bool {
        self.manual_pedestrian
    }

    /// Pin the pedestrian signal to `color`, or hand it back to automatic
    /// derivation with `None`. Ignored when the segment end has no crossing.
    pub fn set_manual_pedestrian(&mut self, color: Option<LightColor>) {
        if self.pedestrian.is_none() {
            return;
        }
        match color {
            Some(c) => {
                self.manual_pedestrian = true;
                self.pedestrian = Some(c);
            }
            None => self.manual_pedestrian = false,
        }
    }

    /// Pin or release the pedestrian signal from a running step, recording
    /// `now` when the shown color changes.
    pub(crate) fn write_manual_pedestrian(&mut self, color: Option<LightColor>, now: Ticks) {
        let before = self.pedestrian;
        self.set_manual_pedestrian(color);
        if self.pedestrian != before {
            self.last_change = now;
        }
    }

    /// Write a pedestrian color. Only takes effect when a crossing exists.
    pub(crate) fn write_pedestrian(&mut self, color: LightColor, now: Ticks) {
        if let Some(p) = self.pedestrian.as_mut() {
            if *p != color {
                *p = color;
                self.last_change = now;
            }
        }
    }

    /// Whether any vehicle light shows a non-red arrow for `direction`.
    pub fn any_non_red_toward(&self, direction: ArrowDirection) -> bool {
        self.lights().any(|(_, l)| !l.color_for(direction).is_red())
    }

    /// Tick of the most recent color change, for blink effects.
    pub fn last_change_tick(&self) -> Ticks {
        self.last_change
    }

    pub(crate) fn hash_into(&self, hash: &mut StateHash) {
        hash.write_u16(self.end.segment.0);
        for (class, light) in self.lights() {
            hash.write_u16(class.bits());
            hash.write_u8(light.left().code());
            hash.write_u8(light.main().code());
            hash.write_u8(light.right().code());
        }
        hash.write_u8(self.pedestrian.map_or(0xFF, LightColor::code));
    }
}
