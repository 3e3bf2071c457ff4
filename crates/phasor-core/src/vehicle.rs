//! Vehicle classes that may be signaled independently.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// A set of vehicle categories. Lanes carry an allowed-class mask and
    /// segment ends may give some classes their own signal head.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct VehicleClass: u16 {
        const PASSENGER_CAR = 1 << 0;
        const BUS = 1 << 1;
        const TAXI = 1 << 2;
        const CARGO_TRUCK = 1 << 3;
        const SERVICE = 1 << 4;
        const EMERGENCY = 1 << 5;
        const PASSENGER_TRAIN = 1 << 6;
        const CARGO_TRAIN = 1 << 7;
        const TRAM = 1 << 8;
        const BICYCLE = 1 << 9;

        const ROAD_VEHICLE = Self::PASSENGER_CAR.bits()
            | Self::BUS.bits()
            | Self::TAXI.bits()
            | Self::CARGO_TRUCK.bits()
            | Self::SERVICE.bits()
            | Self::EMERGENCY.bits();
        const RAIL_VEHICLE = Self::PASSENGER_TRAIN.bits() | Self::CARGO_TRAIN.bits();
        const ROAD_PUBLIC_TRANSPORT = Self::BUS.bits() | Self::TAXI.bits();
        /// The general class served by every segment end's default light.
        const GENERAL = Self::ROAD_VEHICLE.bits() | Self::BICYCLE.bits();
    }
}

/// Classes that receive a dedicated light when a lane allows nothing else
/// (emergency vehicles aside). Earlier entries win.
pub const EXCLUSIVE_CLASSES: [VehicleClass; 5] = [
    VehicleClass::TRAM,
    VehicleClass::SERVICE,
    VehicleClass::CARGO_TRUCK,
    VehicleClass::ROAD_PUBLIC_TRANSPORT.union(VehicleClass::SERVICE),
    VehicleClass::RAIL_VEHICLE,
];

impl VehicleClass {
    /// The exclusive class a lane with this allowed mask is dedicated to, if any.
    pub fn exclusive_class(self) -> Option<VehicleClass> {
        EXCLUSIVE_CLASSES.iter().copied().find(|&class| {
            self.intersects(class) && (self - (class | VehicleClass::EMERGENCY)).is_empty()
        })
    }

    /// Whether every class in the mask runs on rails.
    pub fn is_rail_only(self) -> bool {
        !self.is_empty() && (self - VehicleClass::RAIL_VEHICLE).is_empty()
    }

    /// Short lowercase name used in logs and data files.
    pub fn name(self) -> &'static str {
        match self {
            c if c == VehicleClass::GENERAL => "general",
            c if c == VehicleClass::TRAM => "tram",
            c if c == VehicleClass::SERVICE => "service",
            c if c == VehicleClass::CARGO_TRUCK => "cargo",
            c if c == VehicleClass::ROAD_PUBLIC_TRANSPORT | VehicleClass::SERVICE => "public_transport",
            c if c == VehicleClass::RAIL_VEHICLE => "rail",
            _ => "mixed",
        }
    }

    /// Resolve a name produced by [`VehicleClass::name`].
    pub fn parse_name(name: &str) -> Option<VehicleClass> {
        match name {
            "general" | "default" => Some(VehicleClass::GENERAL),
            "tram" => Some(VehicleClass::TRAM),
            "service" => Some(VehicleClass::SERVICE),
            "cargo" => Some(VehicleClass::CARGO_TRUCK),
            "public_transport" => Some(VehicleClass::ROAD_PUBLIC_TRANSPORT | VehicleClass::SERVICE),
            "rail" => Some(VehicleClass::RAIL_VEHICLE),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tram_only_lane_is_exclusive() {
        assert_eq!(VehicleClass::TRAM.exclusive_class(), Some(VehicleClass::TRAM));
    }

    #[test]
    fn emergency_does_not_break_exclusivity() {
        let mask = VehicleClass::TRAM | VehicleClass::EMERGENCY;
        assert_eq!(mask.exclusive_class(), Some(VehicleClass::TRAM));
    }

    #[test]
    fn mixed_lane_is_not_exclusive() {
        let mask = VehicleClass::PASSENGER_CAR | VehicleClass::TRAM;
        assert_eq!(mask.exclusive_class(), None);
        assert_eq!(VehicleClass::ROAD_VEHICLE.exclusive_class(), None);
    }

    #[test]
    fn bus_lane_maps_to_public_transport() {
        let bus_lane = VehicleClass::BUS | VehicleClass::TAXI | VehicleClass::EMERGENCY;
        assert_eq!(
            bus_lane.exclusive_class(),
            Some(VehicleClass::ROAD_PUBLIC_TRANSPORT | VehicleClass::SERVICE)
        );
    }

    #[test]
    fn service_only_prefers_service_over_public_transport() {
        assert_eq!(VehicleClass::SERVICE.exclusive_class(), Some(VehicleClass::SERVICE));
    }

    #[test]
    fn rail_only_detection() {
        assert!(VehicleClass::PASSENGER_TRAIN.is_rail_only());
        assert!(VehicleClass::RAIL_VEHICLE.is_rail_only());
        assert!(!(VehicleClass::RAIL_VEHICLE | VehicleClass::TRAM).is_rail_only());
        assert!(!VehicleClass::empty().is_rail_only());
    }

    #[test]
    fn names_round_trip() {
        for class in EXCLUSIVE_CLASSES.iter().copied().chain([VehicleClass::GENERAL]) {
            assert_eq!(VehicleClass::parse_name(class.name()), Some(class));
        }
    }
}
