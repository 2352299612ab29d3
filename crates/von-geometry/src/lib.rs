//! VON Geometry
//!
//! Voronoi partitioning of a rectangular world into one cell per site.
//!
//! # Model
//!
//! Every overlay peer is a site, keyed by its numeric id. A site's cell is
//! the set of points closer to it than to any other site, clipped to the
//! world bounding box. Two sites are *enclosing neighbors* when their cells
//! share an edge (Delaunay adjacency).
//!
//! The engine is meant for small site sets (the local view of one peer, in
//! the tens) and favors a simple, exact construction over asymptotic speed.
//!
//! # Example
//!
//! ```
//! use von_geometry::{Position, Voronoi};
//!
//! let mut voro = Voronoi::default();
//! voro.insert(1, Position::new(0.0, 0.0));
//! voro.insert(2, Position::new(100.0, 0.0));
//! voro.insert(3, Position::new(50.0, 100.0));
//!
//! assert!(voro.is_enclosing(2, 1));
//! assert_eq!(voro.closest_to(&Position::new(90.0, 10.0)), Some(2));
//! ```

mod cell;
mod point;
mod segment;
mod voronoi;

pub use cell::{Cell, Side};
pub use point::{BoundingBox, Position};
pub use segment::Segment;
pub use voronoi::{Edge, Voronoi, VoronoiConfig};

/// Identifier of a site (the owning peer's id)
pub type SiteId = u64;

/// Side length of the default square world
pub const DEFAULT_WORLD_SIZE: f64 = 1000.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_world_is_square() {
        let bbox = BoundingBox::default();
        assert_eq!(bbox.width(), DEFAULT_WORLD_SIZE);
        assert_eq!(bbox.height(), DEFAULT_WORLD_SIZE);
        assert_eq!(VoronoiConfig::default().bbox, bbox);
    }
}
