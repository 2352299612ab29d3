//! Planar positions and the world bounding box.
//!
//! Sites, AOI centers and cell vertices all live in the same 2D plane.
//! Coordinates are `f64`; equality is exact, tolerance-based comparisons
//! go through the engine's configured epsilon.

use std::ops::{Add, Mul, Neg, Sub};

/// A point in the plane.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Position {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

impl Position {
    /// Origin of the coordinate system.
    pub const ORIGIN: Self = Self { x: 0.0, y: 0.0 };

    /// Create a new position.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another position.
    pub fn distance(&self, other: &Self) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Squared Euclidean distance (no square root).
    pub fn distance_squared(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    /// Dot product, treating both positions as vectors.
    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y
    }

    /// Z component of the 2D cross product.
    pub fn cross(&self, other: &Self) -> f64 {
        self.x * other.y - self.y * other.x
    }

    /// Midpoint between two positions.
    pub fn midpoint(&self, other: &Self) -> Self {
        Self::new((self.x + other.x) * 0.5, (self.y + other.y) * 0.5)
    }

    /// Both coordinates are finite numbers.
    ///
    /// An undefined position (NaN or infinite) is never accepted as a site.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Position {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y)
    }
}

impl Sub for Position {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y)
    }
}

impl Neg for Position {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

impl Mul<f64> for Position {
    type Output = Self;

    #[inline]
    fn mul(self, k: f64) -> Self {
        Self::new(self.x * k, self.y * k)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Axis-aligned rectangle every site must lie in.
///
/// `min` is the top-left corner and `max` the bottom-right one; both bounds
/// are inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoundingBox {
    /// Smallest x and y
    pub min: Position,
    /// Largest x and y
    pub max: Position,
}

impl BoundingBox {
    /// Create a box from two opposite corners (in any order).
    pub fn new(a: Position, b: Position) -> Self {
        Self {
            min: Position::new(a.x.min(b.x), a.y.min(b.y)),
            max: Position::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// Square box `[0, size] x [0, size]`.
    pub fn square(size: f64) -> Self {
        Self::new(Position::ORIGIN, Position::new(size, size))
    }

    /// Width of the box.
    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    /// Height of the box.
    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    /// A box with non-zero area and finite bounds.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.width() > 0.0 && self.height() > 0.0
    }

    /// Inclusive containment test.
    pub fn contains(&self, p: &Position) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// Pull a position inside the box, keeping `margin` away from each side.
    pub fn clamp(&self, p: Position, margin: f64) -> Position {
        let margin = margin.min(self.width() * 0.5).min(self.height() * 0.5).max(0.0);
        Position::new(
            p.x.clamp(self.min.x + margin, self.max.x - margin),
            p.y.clamp(self.min.y + margin, self.max.y - margin),
        )
    }

    /// The four corners, counter-clockwise starting at `min`.
    pub fn corners(&self) -> [Position; 4] {
        [
            self.min,
            Position::new(self.max.x, self.min.y),
            self.max,
            Position::new(self.min.x, self.max.y),
        ]
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::square(crate::DEFAULT_WORLD_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(3.0, 4.0);
        assert_eq!(a.distance(&b), 5.0);
        assert_eq!(b.distance(&a), 5.0);
        assert_eq!(a.distance_squared(&b), 25.0);
    }

    #[test]
    fn arithmetic() {
        let a = Position::new(1.0, 2.0);
        let b = Position::new(4.0, -1.0);

        assert_eq!(a + b, Position::new(5.0, 1.0));
        assert_eq!(a - b, Position::new(-3.0, 3.0));
        assert_eq!(a + (-b), a - b);
        assert_eq!(a * 2.0, Position::new(2.0, 4.0));
        assert_eq!(a.midpoint(&b), Position::new(2.5, 0.5));
    }

    #[test]
    fn undefined_positions_are_not_finite() {
        assert!(Position::new(1.0, 2.0).is_finite());
        assert!(!Position::new(f64::NAN, 2.0).is_finite());
        assert!(!Position::new(1.0, f64::INFINITY).is_finite());
    }

    #[test]
    fn bbox_contains_is_inclusive() {
        let bbox = BoundingBox::square(100.0);
        assert!(bbox.contains(&Position::new(0.0, 0.0)));
        assert!(bbox.contains(&Position::new(100.0, 100.0)));
        assert!(!bbox.contains(&Position::new(100.1, 50.0)));
        assert!(!bbox.contains(&Position::new(50.0, -0.1)));
    }

    #[test]
    fn bbox_normalizes_corners() {
        let bbox = BoundingBox::new(Position::new(10.0, 0.0), Position::new(0.0, 10.0));
        assert_eq!(bbox.min, Position::new(0.0, 0.0));
        assert_eq!(bbox.max, Position::new(10.0, 10.0));
        assert!(bbox.is_valid());
    }

    #[test]
    fn clamp_keeps_margin() {
        let bbox = BoundingBox::square(100.0);
        let p = bbox.clamp(Position::new(-5.0, 120.0), 0.5);
        assert_eq!(p, Position::new(0.5, 99.5));

        let inside = Position::new(40.0, 60.0);
        assert_eq!(bbox.clamp(inside, 0.5), inside);
    }

    #[test]
    fn corners_are_counter_clockwise() {
        let corners = BoundingBox::square(10.0).corners();
        let mut area = 0.0;
        for i in 0..4 {
            area += corners[i].cross(&corners[(i + 1) % 4]);
        }
        assert!(area > 0.0);
    }
}
