//! Line segments and their intersection with circles.

use crate::Position;

/// A closed line segment between two positions.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Segment {
    /// First endpoint
    pub a: Position,
    /// Second endpoint
    pub b: Position,
}

impl Segment {
    /// Create a segment.
    pub const fn new(a: Position, b: Position) -> Self {
        Self { a, b }
    }

    /// Length of the segment.
    pub fn length(&self) -> f64 {
        self.a.distance(&self.b)
    }

    /// The point on the segment closest to `p`.
    ///
    /// Projects `p` onto the supporting line and clamps the parameter to
    /// `[0, 1]`. A degenerate segment returns its single point.
    pub fn closest_point(&self, p: &Position) -> Position {
        let d = self.b - self.a;
        let len2 = d.dot(&d);
        if len2 == 0.0 {
            return self.a;
        }
        let u = ((*p - self.a).dot(&d) / len2).clamp(0.0, 1.0);
        self.a + d * u
    }

    /// Shortest distance from `p` to any point of the segment.
    pub fn distance_to(&self, p: &Position) -> f64 {
        self.closest_point(p).distance(p)
    }

    /// Whether the segment touches the disc of `radius` around `center`.
    pub fn intersects_circle(&self, center: &Position, radius: f64) -> bool {
        self.distance_to(center) <= radius
    }
}
