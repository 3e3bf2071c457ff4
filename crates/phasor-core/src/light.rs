//! The colors shown to one vehicle class at one segment end.

use crate::id::SegmentEndId;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Colors, modes, directions
// ---------------------------------------------------------------------------

/// The color of a single signal arrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LightColor {
    #[default]
    Red,
    Green,
    /// Shown for one phase tick when a red arrow turns green.
    RedToGreen,
    /// Shown for one phase tick when a green arrow turns red.
    GreenToRed,
}

impl LightColor {
    /// The steady color a transient color settles on.
    pub fn steady(self) -> LightColor {
        match self {
            LightColor::Red | LightColor::GreenToRed => LightColor::Red,
            LightColor::Green | LightColor::RedToGreen => LightColor::Green,
        }
    }

    /// Red <-> Green. Transient colors flip their steady endpoint.
    pub fn inverted(self) -> LightColor {
        match self.steady() {
            LightColor::Red => LightColor::Green,
            _ => LightColor::Red,
        }
    }

    pub fn is_red(self) -> bool {
        self == LightColor::Red
    }

    pub fn is_green(self) -> bool {
        self == LightColor::Green
    }

    pub fn is_transient(self) -> bool {
        matches!(self, LightColor::RedToGreen | LightColor::GreenToRed)
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            LightColor::Red => 0,
            LightColor::Green => 1,
            LightColor::RedToGreen => 2,
            LightColor::GreenToRed => 3,
        }
    }
}

/// Which turn directions of a segment end get their own color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// One color for every direction.
    #[default]
    Simple,
    /// Left is independent; right follows main.
    SingleLeft,
    /// Right is independent; left follows main.
    SingleRight,
    /// Left, main and right are independent.
    All,
}

/// Direction of travel from one segment end to another at the same junction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArrowDirection {
    Left,
    Forward,
    Right,
    /// U-turn back onto the same segment. Signaled by the left arrow.
    Turn,
}

/// Which exits a segment end physically has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnAvailability {
    pub left: bool,
    pub forward: bool,
    pub right: bool,
}

impl TurnAvailability {
    pub fn all() -> Self {
        Self {
            left: true,
            forward: true,
            right: true,
        }
    }
}

// ---------------------------------------------------------------------------
// SegmentLightState
// ---------------------------------------------------------------------------

/// Left/main/right colors for one vehicle class at one segment end.
///
/// Setters keep the mode's mirror rules: under [`Mode::Simple`] all three
/// colors are equal after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLightState {
    pub end: SegmentEndId,
    mode: Mode,
    left: LightColor,
    main: LightColor,
    right: LightColor,
}

impl SegmentLightState {
    /// A simple-mode light showing red in every direction.
    pub fn new(end: SegmentEndId) -> Self {
        Self {
            end,
            mode: Mode::Simple,
            left: LightColor::Red,
            main: LightColor::Red,
            right: LightColor::Red,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn left(&self) -> LightColor {
        self.left
    }

    pub fn main(&self) -> LightColor {
        self.main
    }

    pub fn right(&self) -> LightColor {
        self.right
    }

    /// The arrow color that governs travel in `direction`.
    pub fn color_for(&self, direction: ArrowDirection) -> LightColor {
        match direction {
            ArrowDirection::Left | ArrowDirection::Turn => self.left,
            ArrowDirection::Forward => self.main,
            ArrowDirection::Right => self.right,
        }
    }

    /// Set all three colors, then apply the mode's mirror rules.
    pub fn set_colors(&mut self, left: LightColor, main: LightColor, right: LightColor) {
        self.left = left;
        self.main = main;
        self.right = right;
        self.normalize();
    }

    /// Set the mode directly and re-apply mirror rules.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.normalize();
    }

    /// Advance to the next mode permitted by the exits the segment end has.
    pub fn toggle_mode(&mut self, turns: TurnAvailability) {
        self.mode = match self.mode {
            Mode::Simple if turns.left => Mode::SingleLeft,
            Mode::Simple if turns.right => Mode::SingleRight,
            Mode::Simple => Mode::Simple,
            Mode::SingleLeft if turns.right => Mode::All,
            Mode::SingleRight if turns.left => Mode::All,
            Mode::SingleLeft | Mode::SingleRight | Mode::All => Mode::Simple,
        };
        self.normalize();
    }

    /// Flip the channel that drives `direction` between red and green.
    pub fn invert(&mut self, direction: ArrowDirection) {
        let left_independent = matches!(self.mode, Mode::SingleLeft | Mode::All);
        let right_independent = matches!(self.mode, Mode::SingleRight | Mode::All);
        match direction {
            ArrowDirection::Left | ArrowDirection::Turn if left_independent => {
                self.left = self.left.inverted();
            }
            ArrowDirection::Right if right_independent => {
                self.right = self.right.inverted();
            }
            _ => self.main = self.main.inverted(),
        }
        self.normalize();
    }

    /// Merge the three arrows into the single color a plain signal head shows.
    pub fn visual_color(&self) -> LightColor {
        let colors = [self.left, self.main, self.right];
        if colors.iter().any(|c| c.is_green()) {
            LightColor::Green
        } else if colors.iter().all(|c| c.is_red()) {
            LightColor::Red
        } else if colors.contains(&LightColor::RedToGreen) {
            LightColor::RedToGreen
        } else {
            LightColor::GreenToRed
        }
    }

    /// Replace transient colors with their steady endpoint.
    pub fn snap_to_steady(&mut self) {
        self.left = self.left.steady();
        self.main = self.main.steady();
        self.right = self.right.steady();
    }

    /// Whether any arrow shows something other than red.
    pub fn any_non_red(&self) -> bool {
        !(self.left.is_red() && self.main.is_red() && self.right.is_red())
    }

    fn normalize(&mut self) {
        match self.mode {
            Mode::Simple => {
                self.left = self.main;
                self.right = self.main;
            }
            Mode::SingleLeft => self.right = self.main,
            Mode::SingleRight => self.left = self.main,
            Mode::All => {}
        }
    }
}

/// Interpolate the color shown at a phase boundary.
///
/// A transient color is injected only where the arrow actually changes
/// across the boundary, so lights that stay green never flash.
pub fn calc_light_state(
    prev: LightColor,
    current: LightColor,
    next: LightColor,
    at_start: bool,
    at_end: bool,
) -> LightColor {
    if at_start && current == LightColor::Green && prev == LightColor::Red {
        LightColor::RedToGreen
    } else if at_end && current == LightColor::Green && next == LightColor::Red {
        LightColor::GreenToRed
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{JunctionId, SegmentId};
    use LightColor::*;

    fn light() -> SegmentLightState {
        SegmentLightState::new(SegmentEndId::new(JunctionId(1), SegmentId(1)))
    }

    fn with_colors(left: LightColor, main: LightColor, right: LightColor) -> SegmentLightState {
        let mut l = light();
        l.set_mode(Mode::All);
        l.set_colors(left, main, right);
        l
    }

    #[test]
    fn visual_color_truth_table() {
        assert_eq!(with_colors(Green, Red, Red).visual_color(), Green);
        assert_eq!(with_colors(Red, Red, Red).visual_color(), Red);
        assert_eq!(with_colors(Red, RedToGreen, Red).visual_color(), RedToGreen);
        assert_eq!(with_colors(Red, GreenToRed, Red).visual_color(), GreenToRed);
    }

    #[test]
    fn visual_color_prefers_red_to_green_over_green_to_red() {
        assert_eq!(with_colors(GreenToRed, RedToGreen, Red).visual_color(), RedToGreen);
    }

    #[test]
    fn simple_mode_mirrors_main() {
        let mut l = light();
        l.set_colors(Red, Green, Red);
        assert_eq!((l.left(), l.main(), l.right()), (Green, Green, Green));
    }

    #[test]
    fn single_left_keeps_left_independent() {
        let mut l = light();
        l.set_mode(Mode::SingleLeft);
        l.set_colors(Green, Red, Green);
        assert_eq!((l.left(), l.main(), l.right()), (Green, Red, Red));
    }

    #[test]
    fn single_right_keeps_right_independent() {
        let mut l = light();
        l.set_mode(Mode::SingleRight);
        l.set_colors(Green, Red, Green);
        assert_eq!((l.left(), l.main(), l.right()), (Red, Red, Green));
    }

    #[test]
    fn toggle_cycles_through_single_left_when_left_exists() {
        let mut l = light();
        l.toggle_mode(TurnAvailability::all());
        assert_eq!(l.mode(), Mode::SingleLeft);
        l.toggle_mode(TurnAvailability::all());
        assert_eq!(l.mode(), Mode::All);
        l.toggle_mode(TurnAvailability::all());
        assert_eq!(l.mode(), Mode::Simple);
    }

    #[test]
    fn toggle_skips_single_left_without_left_exit() {
        let turns = TurnAvailability {
            left: false,
            forward: true,
            right: true,
        };
        let mut l = light();
        l.toggle_mode(turns);
        assert_eq!(l.mode(), Mode::SingleRight);
        l.toggle_mode(turns);
        assert_eq!(l.mode(), Mode::Simple);
    }

    #[test]
    fn toggle_stays_simple_without_turns() {
        let turns = TurnAvailability {
            left: false,
            forward: true,
            right: false,
        };
        let mut l = light();
        l.toggle_mode(turns);
        assert_eq!(l.mode(), Mode::Simple);
    }

    #[test]
    fn toggle_back_to_simple_resynchronizes_colors() {
        let mut l = light();
        l.set_mode(Mode::All);
        l.set_colors(Green, Red, Green);
        l.toggle_mode(TurnAvailability::all());
        assert_eq!(l.mode(), Mode::Simple);
        assert_eq!((l.left(), l.main(), l.right()), (Red, Red, Red));
    }

    #[test]
    fn invert_under_simple_propagates() {
        let mut l = light();
        l.invert(ArrowDirection::Left);
        assert_eq!((l.left(), l.main(), l.right()), (Green, Green, Green));
    }

    #[test]
    fn invert_single_left_flips_only_left() {
        let mut l = light();
        l.set_mode(Mode::SingleLeft);
        l.invert(ArrowDirection::Left);
        assert_eq!((l.left(), l.main(), l.right()), (Green, Red, Red));
        l.invert(ArrowDirection::Right);
        assert_eq!((l.left(), l.main(), l.right()), (Green, Green, Green));
    }

    #[test]
    fn invert_all_flips_one_arrow() {
        let mut l = light();
        l.set_mode(Mode::All);
        l.invert(ArrowDirection::Right);
        assert_eq!((l.left(), l.main(), l.right()), (Red, Red, Green));
    }

    #[test]
    fn invert_transient_flips_steady_endpoint() {
        assert_eq!(RedToGreen.inverted(), Red);
        assert_eq!(GreenToRed.inverted(), Green);
    }

    #[test]
    fn snap_to_steady_resolves_transients() {
        let mut l = with_colors(RedToGreen, GreenToRed, Green);
        l.snap_to_steady();
        assert_eq!((l.left(), l.main(), l.right()), (Green, Red, Green));
    }

    #[test]
    fn u_turn_uses_left_arrow() {
        let l = with_colors(Green, Red, Red);
        assert_eq!(l.color_for(ArrowDirection::Turn), Green);
        assert_eq!(l.color_for(ArrowDirection::Forward), Red);
    }

    #[test]
    fn calc_light_state_transitions() {
        assert_eq!(calc_light_state(Red, Green, Green, true, false), RedToGreen);
        assert_eq!(calc_light_state(Green, Green, Red, false, true), GreenToRed);
        assert_eq!(calc_light_state(Green, Green, Green, true, false), Green);
        assert_eq!(calc_light_state(Red, Green, Green, false, true), Green);
        assert_eq!(calc_light_state(Green, Red, Green, true, true), Red);
    }

    #[test]
    fn calc_light_state_start_wins_over_end() {
        assert_eq!(calc_light_state(Red, Green, Red, true, true), RedToGreen);
    }
}
