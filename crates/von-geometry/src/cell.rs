//! Voronoi cells as convex polygons clipped to the world box.
//!
//! A cell starts out as the whole bounding box and is cut down by the
//! perpendicular bisector between its site and every other site, nearest
//! first. Every polygon edge remembers what lies on its far side (another
//! site, or the box border), which is what adjacency queries read.
//!
//! Clipping stops early once the next site is farther than twice the
//! distance from the site to its farthest vertex: no bisector beyond that
//! radius can cut the polygon any more.

use crate::{BoundingBox, Position, Segment, SiteId};

/// What lies across one edge of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Side {
    /// The edge lies on the bisector with this site.
    Site(SiteId),
    /// The edge lies on the bounding box.
    Border,
}

/// The Voronoi region of one site.
///
/// `vertices` are counter-clockwise; `sides[i]` describes the edge from
/// `vertices[i]` to `vertices[(i + 1) % n]`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cell {
    /// Owner of this cell
    pub site: SiteId,
    /// Position of the owning site
    pub position: Position,
    /// Polygon corners, counter-clockwise
    pub vertices: Vec<Position>,
    /// Far side of each edge
    pub sides: Vec<Side>,
}

impl Cell {
    /// Cell covering the whole bounding box.
    pub(crate) fn from_bbox(site: SiteId, position: Position, bbox: &BoundingBox) -> Self {
        Self {
            site,
            position,
            vertices: bbox.corners().to_vec(),
            sides: vec![Side::Border; 4],
        }
    }

    /// Build the cell of `site` against a set of other sites.
    ///
    /// `others` must not contain `site` itself; it is sorted in place by
    /// distance so the security radius check can stop early.
    pub(crate) fn build(
        site: SiteId,
        position: Position,
        others: &mut [(SiteId, Position)],
        bbox: &BoundingBox,
        eps: f64,
    ) -> Self {
        let mut cell = Self::from_bbox(site, position, bbox);

        others.sort_by(|a, b| {
            position
                .distance_squared(&a.1)
                .total_cmp(&position.distance_squared(&b.1))
                .then(a.0.cmp(&b.0))
        });

        for &(other, other_pos) in others.iter() {
            if cell.vertices.is_empty() {
                break;
            }
            let reach = 2.0 * cell.max_vertex_distance();
            if position.distance(&other_pos) > reach + eps {
                break;
            }
            cell.clip(other, &other_pos, eps);
        }

        cell
    }

    /// Number of edges (and vertices).
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// The cell was clipped away entirely.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Edges with what lies across each one.
    pub fn edges(&self) -> impl Iterator<Item = (Segment, Side)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| {
            (
                Segment::new(self.vertices[i], self.vertices[(i + 1) % n]),
                self.sides[i],
            )
        })
    }

    /// Sites sharing an edge longer than `min_edge` with this cell.
    pub fn neighbor_ids(&self, min_edge: f64) -> Vec<SiteId> {
        let mut ids = Vec::new();
        for (seg, side) in self.edges() {
            if let Side::Site(id) = side {
                if seg.length() > min_edge && !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Point-in-polygon test (crossing number).
    pub fn contains(&self, p: &Position) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let vi = self.vertices[i];
            let vj = self.vertices[j];
            if (vi.y > p.y) != (vj.y > p.y)
                && p.x < (vj.x - vi.x) * (p.y - vi.y) / (vj.y - vi.y) + vi.x
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Whether the disc of `radius` around `center` overlaps this polygon.
    pub fn intersects_circle(&self, center: &Position, radius: f64) -> bool {
        if self.contains(center) {
            return true;
        }
        self.edges().any(|(seg, _)| seg.intersects_circle(center, radius))
    }

    /// Every vertex lies strictly inside the disc.
    pub fn enclosed_by(&self, center: &Position, radius: f64) -> bool {
        !self.is_empty() && self.vertices.iter().all(|v| center.distance(v) < radius)
    }

    /// Some vertex reaches beyond the disc.
    pub fn reaches_beyond(&self, center: &Position, radius: f64) -> bool {
        self.vertices.iter().any(|v| center.distance(v) > radius)
    }

    fn max_vertex_distance(&self) -> f64 {
        self.vertices
            .iter()
            .map(|v| self.position.distance(v))
            .fold(0.0, f64::max)
    }

    /// Keep the half-plane closer to our site than to `other`.
    fn clip(&mut self, other: SiteId, other_pos: &Position, eps: f64) {
        let normal = *other_pos - self.position;
        if normal.dot(&normal) == 0.0 {
            return;
        }
        let mid = self.position.midpoint(other_pos);
        let offset = normal.dot(&mid);
        let side_of = |p: &Position| normal.dot(p) - offset;

        let n = self.vertices.len();
        let mut vertices = Vec::with_capacity(n + 1);
        let mut sides = Vec::with_capacity(n + 1);

        for i in 0..n {
            let cur = self.vertices[i];
            let next = self.vertices[(i + 1) % n];
            let d_cur = side_of(&cur);
            let d_next = side_of(&next);
            let cur_in = d_cur <= 0.0;
            let next_in = d_next <= 0.0;

            match (cur_in, next_in) {
                (true, true) => {
                    vertices.push(cur);
                    sides.push(self.sides[i]);
                }
                (true, false) => {
                    // Leaving the half-plane: the new edge runs along the bisector
                    vertices.push(cur);
                    sides.push(self.sides[i]);
                    vertices.push(intersect(cur, next, d_cur, d_next));
                    sides.push(Side::Site(other));
                }
                (false, true) => {
                    vertices.push(intersect(cur, next, d_cur, d_next));
                    sides.push(self.sides[i]);
                }
                (false, false) => {}
            }
        }

        self.vertices = vertices;
        self.sides = sides;
        self.drop_degenerate_edges(eps);
    }

    /// Remove edges shorter than `eps`, keeping the polygon closed.
    fn drop_degenerate_edges(&mut self, eps: f64) {
        let mut i = 0;
        while self.vertices.len() > 1 && i < self.vertices.len() {
            let n = self.vertices.len();
            let next = (i + 1) % n;
            if self.vertices[i].distance(&self.vertices[next]) <= eps {
                // The previous edge now ends at `next`, which is the same point
                self.vertices.remove(i);
                self.sides.remove(i);
            } else {
                i += 1;
            }
        }
        if self.vertices.len() < 3 {
            self.vertices.clear();
            self.sides.clear();
        }
    }
}

fn intersect(a: Position, b: Position, da: f64, db: f64) -> Position {
    let t = da / (da - db);
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn bbox() -> BoundingBox {
        BoundingBox::square(100.0)
    }

    #[test]
    fn lone_site_owns_the_box() {
        let cell = Cell::build(1, Position::new(50.0, 50.0), &mut [], &bbox(), EPS);
        assert_eq!(cell.len(), 4);
        assert!(cell.sides.iter().all(|s| *s == Side::Border));
        assert!(cell.neighbor_ids(EPS).is_empty());
    }

    #[test]
    fn two_sites_split_the_box() {
        let mut others = [(2, Position::new(75.0, 50.0))];
        let cell = Cell::build(1, Position::new(25.0, 50.0), &mut others, &bbox(), EPS);

        assert_eq!(cell.neighbor_ids(EPS), vec![2]);
        assert!(cell.contains(&Position::new(10.0, 10.0)));
        assert!(cell.contains(&Position::new(49.0, 90.0)));
        assert!(!cell.contains(&Position::new(51.0, 90.0)));

        // Bisector is the vertical line x = 50
        for v in &cell.vertices {
            assert!(v.x <= 50.0 + EPS);
        }
    }

    #[test]
    fn far_site_is_not_a_neighbor() {
        // 3 is shielded from 1 by 2
        let mut others = [
            (2, Position::new(50.0, 50.0)),
            (3, Position::new(90.0, 50.0)),
        ];
        let cell = Cell::build(1, Position::new(10.0, 50.0), &mut others, &bbox(), EPS);
        assert_eq!(cell.neighbor_ids(EPS), vec![2]);
    }

    #[test]
    fn circle_intersection() {
        let mut others = [(2, Position::new(75.0, 50.0))];
        let cell = Cell::build(1, Position::new(25.0, 50.0), &mut others, &bbox(), EPS);

        // Center inside
        assert!(cell.intersects_circle(&Position::new(25.0, 50.0), 1.0));
        // Center outside, circle reaches across the bisector
        assert!(cell.intersects_circle(&Position::new(60.0, 50.0), 11.0));
        assert!(!cell.intersects_circle(&Position::new(60.0, 50.0), 9.0));
    }

    #[test]
    fn enclosure_and_reach() {
        let cell = Cell::build(1, Position::new(50.0, 50.0), &mut [], &bbox(), EPS);
        let center = Position::new(50.0, 50.0);
        // Corners are ~70.7 away
        assert!(cell.enclosed_by(&center, 80.0));
        assert!(!cell.enclosed_by(&center, 60.0));
        assert!(cell.reaches_beyond(&center, 60.0));
        assert!(!cell.reaches_beyond(&center, 80.0));
    }

    #[test]
    fn square_of_four_has_no_diagonal_edge() {
        // Cocircular sites: diagonal pairs meet at a single point only
        let mut others = [
            (2, Position::new(75.0, 25.0)),
            (3, Position::new(25.0, 75.0)),
            (4, Position::new(75.0, 75.0)),
        ];
        let cell = Cell::build(1, Position::new(25.0, 25.0), &mut others, &bbox(), EPS);
        let mut ids = cell.neighbor_ids(1e-6);
        ids.sort();
        assert_eq!(ids, vec![2, 3]);
    }
}
