//! Position model.
//!
//! Two frames are used throughout the crate:
//!
//! - **relative**: offset from the rig origin (where the transmitter and receiver are
//!   nominally aligned). All scan-path math happens here.
//! - **absolute**: relative + origin, the machine coordinates the motion controller
//!   understands. Conversion happens only at the motion-command boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Tolerance (mm) used to decide whether two z heights belong to the same layer.
pub const LAYER_Z_TOLERANCE: f64 = 0.01;

/// A point in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    /// The origin of whatever frame the position lives in.
    pub const ZERO: Position = Position {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn from_array(values: [f64; 3]) -> Self {
        Self::new(values[0], values[1], values[2])
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// Distance from the z axis.
    pub fn horizontal_radius(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Sum of absolute per-axis differences.
    pub fn l1_distance(&self, other: &Position) -> f64 {
        (self.x - other.x).abs() + (self.y - other.y).abs() + (self.z - other.z).abs()
    }

    /// Whether `other` is within `tolerance` of `self` (L1 norm, inclusive).
    ///
    /// Any NaN component never matches.
    pub fn matches(&self, other: &Position, tolerance: f64) -> bool {
        self.l1_distance(other) <= tolerance
    }

    /// Same x and y, different height.
    pub fn with_z(self, z: f64) -> Self {
        Self { z, ..self }
    }

    /// Convert a relative position into machine coordinates.
    pub fn to_absolute(self, origin: Position) -> Self {
        self + origin
    }

    /// Convert machine coordinates back into the relative frame.
    pub fn to_relative(self, origin: Position) -> Self {
        self - origin
    }

    /// Multiply each axis by the matching factor.
    pub fn scaled(self, factors: [f64; 3]) -> Self {
        Self::new(self.x * factors[0], self.y * factors[1], self.z * factors[2])
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.2}, {:.2}, {:.2}]", self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_passes_on_boundary() {
        let desired = Position::new(1.0, 2.0, 3.0);
        let reported = Position::new(1.02, 1.99, 3.01);
        assert!(desired.matches(&reported, 0.04));
        assert!((desired.l1_distance(&reported) - 0.04).abs() < 1e-9);
    }

    #[test]
    fn gate_fails_when_off_by_a_tenth() {
        let desired = Position::new(1.0, 2.0, 3.0);
        let reported = Position::new(1.1, 2.0, 3.0);
        assert!(!desired.matches(&reported, 0.04));
    }

    #[test]
    fn nan_never_matches() {
        let nan = Position::new(f64::NAN, 0.0, 0.0);
        assert!(!Position::ZERO.matches(&nan, 1e9));
    }

    #[test]
    fn relative_absolute_round_trip() {
        let origin = Position::new(116.5, 108.0, 11.25);
        let rel = Position::new(-1.5, 0.25, 2.0);
        let abs = rel.to_absolute(origin);
        assert_eq!(abs, Position::new(115.0, 108.25, 13.25));
        assert_eq!(abs.to_relative(origin), rel);
    }

    #[test]
    fn horizontal_radius_ignores_z() {
        assert_eq!(Position::new(3.0, 4.0, 100.0).horizontal_radius(), 5.0);
    }
}
