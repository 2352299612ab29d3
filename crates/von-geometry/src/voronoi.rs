//! The Voronoi engine: a dynamic site set with memoized cells.
//!
//! Mutations (`insert`, `remove`, `update`, `clear`) only touch the site map
//! and drop the cached diagram. The next query rebuilds every cell from the
//! current sites, so the diagram is always a pure function of the site set.
//!
//! Queries that need a *different* site set (level-k enclosing neighbors,
//! boundary checks) build a throwaway diagram from a filtered copy and
//! leave the cached one alone.
//!
//! # Failure semantics
//!
//! Bad input never panics and never errors: it yields `false`, `None` or an
//! empty list, and callers are expected to check.

use std::cell::OnceCell;
use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::{BoundingBox, Cell, Position, Segment, Side, SiteId};

/// Maximum number of random nudges tried when a site lands on another.
const MAX_PERTURB_ATTEMPTS: usize = 64;

/// Tunable constants of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct VoronoiConfig {
    /// Region every site must lie in
    pub bbox: BoundingBox,
    /// Two distances closer than this are considered equal (tie-breaks, collisions)
    pub equal_distance: f64,
    /// Cell edges no longer than this do not make two sites adjacent
    pub min_edge_length: f64,
    /// Largest per-axis offset applied when a site collides with another
    pub collision_jitter: f64,
    /// Distance kept from the box sides when re-clamping a perturbed site
    pub bound_margin: f64,
    /// Extra radius added in accurate overlap mode
    pub accurate_pad: f64,
}

impl Default for VoronoiConfig {
    fn default() -> Self {
        Self {
            bbox: BoundingBox::default(),
            equal_distance: 1e-9,
            min_edge_length: 1e-6,
            collision_jitter: 0.5,
            bound_margin: 0.5,
            accurate_pad: 5.0,
        }
    }
}

/// One edge of the diagram.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Edge {
    /// Geometry of the edge
    pub segment: Segment,
    /// Site on one side
    pub left: SiteId,
    /// Site on the other side, `None` on the bounding box
    pub right: Option<SiteId>,
}

/// Cells for one particular site set.
#[derive(Debug, Default)]
struct Diagram {
    cells: HashMap<SiteId, Cell>,
}

impl Diagram {
    fn compute(sites: &BTreeMap<SiteId, Position>, config: &VoronoiConfig) -> Self {
        let mut cells = HashMap::with_capacity(sites.len());
        for (&id, &pos) in sites {
            let mut others: Vec<_> = sites
                .iter()
                .filter(|(other, _)| **other != id)
                .map(|(&other, &p)| (other, p))
                .collect();
            let cell = Cell::build(id, pos, &mut others, &config.bbox, config.equal_distance);
            cells.insert(id, cell);
        }
        Self { cells }
    }
}

/// Voronoi diagram over `(SiteId, Position)` sites inside a fixed box.
#[derive(Debug)]
pub struct Voronoi {
    config: VoronoiConfig,
    sites: BTreeMap<SiteId, Position>,
    diagram: OnceCell<Diagram>,
    rng: StdRng,
}

impl Default for Voronoi {
    fn default() -> Self {
        Self::new(VoronoiConfig::default())
    }
}

impl Voronoi {
    /// Create an empty engine.
    pub fn new(config: VoronoiConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create an empty engine with a fixed perturbation seed.
    pub fn with_seed(config: VoronoiConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: VoronoiConfig, rng: StdRng) -> Self {
        Self {
            config,
            sites: BTreeMap::new(),
            diagram: OnceCell::new(),
            rng,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &VoronoiConfig {
        &self.config
    }

    /// Current bounding box.
    pub fn bounding_box(&self) -> BoundingBox {
        self.config.bbox
    }

    /// Replace the bounding box.
    ///
    /// Sites already outside the new box are kept; only later inserts are
    /// checked against it.
    pub fn set_bounding_box(&mut self, bbox: BoundingBox) -> bool {
        if !bbox.is_valid() {
            return false;
        }
        self.config.bbox = bbox;
        self.invalidate();
        true
    }

    // ---------------------------------------------------------------------
    // Mutation
    // ---------------------------------------------------------------------

    /// Add a new site.
    ///
    /// Fails when `id` is already present or `pos` is undefined or outside
    /// the box. A position exactly on another site is nudged by a small
    /// random offset first.
    pub fn insert(&mut self, id: SiteId, pos: Position) -> bool {
        if self.sites.contains_key(&id) {
            debug!("voronoi: duplicate site {}", id);
            return false;
        }
        let pos = match self.admit(id, pos) {
            Some(p) => p,
            None => return false,
        };
        self.sites.insert(id, pos);
        self.invalidate();
        true
    }

    /// Remove a site. Returns `false` if it was unknown.
    pub fn remove(&mut self, id: SiteId) -> bool {
        if self.sites.remove(&id).is_none() {
            return false;
        }
        self.invalidate();
        true
    }

    /// Move a site, or insert it if unknown.
    pub fn update(&mut self, id: SiteId, pos: Position) -> bool {
        if !self.sites.contains_key(&id) {
            return self.insert(id, pos);
        }
        let pos = match self.admit(id, pos) {
            Some(p) => p,
            None => return false,
        };
        self.sites.insert(id, pos);
        self.invalidate();
        true
    }

    /// Drop every site.
    pub fn clear(&mut self) {
        self.sites.clear();
        self.invalidate();
    }

    /// Validate a position for `id` and resolve collisions.
    fn admit(&mut self, id: SiteId, pos: Position) -> Option<Position> {
        if !pos.is_finite() {
            warn!("voronoi: undefined position for site {}", id);
            return None;
        }
        if !self.config.bbox.contains(&pos) {
            warn!("voronoi: site {} at {} outside bounding box", id, pos);
            return None;
        }
        if !self.collides(id, &pos) {
            return Some(pos);
        }
        self.perturb(id, pos)
    }

    fn collides(&self, id: SiteId, pos: &Position) -> bool {
        self.sites.iter().any(|(&other, p)| {
            other != id && p.distance(pos) <= self.config.equal_distance
        })
    }

    fn perturb(&mut self, id: SiteId, mut pos: Position) -> Option<Position> {
        let jitter = self.config.collision_jitter.max(self.config.equal_distance * 16.0);
        for _ in 0..MAX_PERTURB_ATTEMPTS {
            let dx = self.rng.gen_range(-jitter..=jitter);
            let dy = self.rng.gen_range(-jitter..=jitter);
            pos = self
                .config
                .bbox
                .clamp(pos + Position::new(dx, dy), self.config.bound_margin);
            if !self.collides(id, &pos) {
                debug!("voronoi: site {} perturbed to {}", id, pos);
                return Some(pos);
            }
        }
        warn!("voronoi: could not separate site {} from its neighbors", id);
        None
    }

    fn invalidate(&mut self) {
        self.diagram = OnceCell::new();
    }

    fn diagram(&self) -> &Diagram {
        self.diagram
            .get_or_init(|| Diagram::compute(&self.sites, &self.config))
    }

    // ---------------------------------------------------------------------
    // Site access
    // ---------------------------------------------------------------------

    /// Stored position of a site.
    pub fn get(&self, id: SiteId) -> Option<Position> {
        self.sites.get(&id).copied()
    }

    /// Number of sites.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// No sites stored.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// All sites in id order.
    pub fn sites(&self) -> impl Iterator<Item = (SiteId, Position)> + '_ {
        self.sites.iter().map(|(&id, &p)| (id, p))
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// The cell of a site.
    pub fn region(&self, id: SiteId) -> Option<&Cell> {
        self.diagram().cells.get(&id)
    }

    /// Whether `pos` lies inside the cell of `id`.
    pub fn contains(&self, id: SiteId, pos: &Position) -> bool {
        self.region(id).is_some_and(|cell| cell.contains(pos))
    }

    /// Site nearest to `pos`; equal distances go to the smaller id.
    pub fn closest_to(&self, pos: &Position) -> Option<SiteId> {
        let mut best: Option<(SiteId, f64)> = None;
        for (&id, p) in &self.sites {
            let d = pos.distance(p);
            best = match best {
                None => Some((id, d)),
                Some((best_id, best_d)) => {
                    let tie = (d - best_d).abs() <= self.config.equal_distance;
                    if (d < best_d && !tie) || (tie && id < best_id) {
                        Some((id, d))
                    } else {
                        Some((best_id, best_d))
                    }
                }
            };
        }
        best.map(|(id, _)| id)
    }

    /// Whether the cells of `id` and `center` share an edge.
    pub fn is_enclosing(&self, id: SiteId, center: SiteId) -> bool {
        self.region(center)
            .is_some_and(|cell| cell.neighbor_ids(self.config.min_edge_length).contains(&id))
    }

    /// Level-k enclosing neighbors of `id`.
    ///
    /// Level 1 is the plain Delaunay neighborhood. Each further level
    /// removes the neighbors found so far and recomputes, collecting the
    /// next ring.
    pub fn get_en(&self, id: SiteId, level: usize) -> Vec<SiteId> {
        let pos = match self.get(id) {
            Some(p) => p,
            None => return Vec::new(),
        };

        let mut found = match self.region(id) {
            Some(cell) => cell.neighbor_ids(self.config.min_edge_length),
            None => return Vec::new(),
        };

        for _ in 1..level {
            let mut others: Vec<_> = self
                .sites
                .iter()
                .filter(|(other, _)| **other != id && !found.contains(other))
                .map(|(&other, &p)| (other, p))
                .collect();
            if others.is_empty() {
                break;
            }
            let cell = Cell::build(id, pos, &mut others, &self.config.bbox, self.config.equal_distance);
            found.extend(cell.neighbor_ids(self.config.min_edge_length));
        }

        found
    }

    /// Whether the circle touches the site of `id`.
    ///
    /// Fast mode only compares the site position against the circle.
    /// Accurate mode tests the whole cell polygon, with the radius padded
    /// by `accurate_pad`.
    pub fn overlaps(&self, id: SiteId, pos: &Position, radius: f64, accurate: bool) -> bool {
        if accurate {
            self.region(id)
                .is_some_and(|cell| cell.intersects_circle(pos, radius + self.config.accurate_pad))
        } else {
            self.get(id).is_some_and(|site| site.distance(pos) <= radius)
        }
    }

    /// Sites whose cells still reach past the circle once every site
    /// outside it is ignored.
    pub fn boundary_sites(&self, pos: &Position, radius: f64) -> Vec<SiteId> {
        let trimmed: BTreeMap<_, _> = self
            .sites
            .iter()
            .filter(|(_, p)| p.distance(pos) <= radius)
            .map(|(&id, &p)| (id, p))
            .collect();

        let diagram = Diagram::compute(&trimmed, &self.config);
        let mut ids: Vec<_> = diagram
            .cells
            .values()
            .filter(|cell| cell.reaches_beyond(pos, radius))
            .map(|cell| cell.site)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Whether `id` is a boundary site for the circle.
    pub fn is_boundary(&self, id: SiteId, pos: &Position, radius: f64) -> bool {
        if !self.sites.contains_key(&id) {
            return false;
        }
        self.boundary_sites(pos, radius).contains(&id)
    }

    /// Sites within `radius` of the site of `id`.
    pub fn aoi_sites(&self, id: SiteId, radius: f64) -> Vec<SiteId> {
        let center = match self.get(id) {
            Some(p) => p,
            None => return Vec::new(),
        };
        self.sites
            .iter()
            .filter(|(&other, p)| other != id && p.distance(&center) <= radius)
            .map(|(&other, _)| other)
            .collect()
    }

    /// Enclosing neighbors plus sites within `radius`.
    pub fn neighbors_of(&self, id: SiteId, radius: f64) -> Vec<SiteId> {
        let mut ids = self.get_en(id, 1);
        for other in self.aoi_sites(id, radius) {
            if !ids.contains(&other) {
                ids.push(other);
            }
        }
        ids
    }

    /// Every edge of the diagram, each reported once.
    pub fn edges(&self) -> Vec<Edge> {
        let diagram = self.diagram();
        let mut ids: Vec<_> = diagram.cells.keys().copied().collect();
        ids.sort_unstable();

        let mut edges = Vec::new();
        for id in ids {
            let cell = &diagram.cells[&id];
            for (segment, side) in cell.edges() {
                match side {
                    Side::Border => edges.push(Edge { segment, left: id, right: None }),
                    Side::Site(other) if id < other => edges.push(Edge {
                        segment,
                        left: id,
                        right: Some(other),
                    }),
                    Side::Site(_) => {}
                }
            }
        }
        edges
    }
}

impl std::fmt::Display for Voronoi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (id, p) in &self.sites {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "[{}] {}", id, p)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn engine() -> Voronoi {
        Voronoi::with_seed(VoronoiConfig::default(), 7)
    }

    fn p(x: f64, y: f64) -> Position {
        Position::new(x, y)
    }

    fn sorted(mut v: Vec<SiteId>) -> Vec<SiteId> {
        v.sort_unstable();
        v
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut v = engine();
        assert!(v.insert(5, p(10.0, 10.0)));
        assert!(!v.insert(5, p(20.0, 20.0)));
        assert_eq!(v.get(5), Some(p(10.0, 10.0)));
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn invalid_positions_are_rejected() {
        let mut v = engine();
        assert!(!v.insert(1, p(f64::NAN, 10.0)));
        assert!(!v.insert(2, p(-1.0, 10.0)));
        assert!(!v.insert(3, p(10.0, 1000.5)));
        assert!(v.is_empty());
    }

    #[test]
    fn update_unknown_behaves_as_insert() {
        let mut a = engine();
        let mut b = engine();
        assert_eq!(a.update(9, p(30.0, 40.0)), b.insert(9, p(30.0, 40.0)));
        assert_eq!(a.get(9), b.get(9));

        // Out of bounds fails for both
        assert_eq!(a.update(10, p(-5.0, 0.0)), b.insert(10, p(-5.0, 0.0)));
        assert_eq!(a.get(10), None);
    }

    #[test]
    fn update_relocates() {
        let mut v = engine();
        v.insert(1, p(10.0, 10.0));
        v.insert(2, p(900.0, 900.0));
        assert!(v.update(1, p(800.0, 800.0)));
        assert_eq!(v.get(1), Some(p(800.0, 800.0)));
        assert_eq!(v.closest_to(&p(0.0, 0.0)), Some(1));
    }

    #[test]
    fn remove_unknown_is_false() {
        let mut v = engine();
        assert!(!v.remove(3));
        v.insert(3, p(1.0, 1.0));
        assert!(v.remove(3));
        assert!(v.get(3).is_none());
    }

    #[test]
    fn colliding_insert_is_perturbed() {
        let mut v = engine();
        v.insert(1, p(500.0, 500.0));
        assert!(v.insert(2, p(500.0, 500.0)));

        let moved = v.get(2).unwrap();
        assert_ne!(moved, p(500.0, 500.0));
        assert!(moved.distance(&p(500.0, 500.0)) <= 0.5 * 2f64.sqrt() + 1e-9);
        assert!(v.bounding_box().contains(&moved));
    }

    #[test]
    fn colliding_insert_at_corner_stays_inside() {
        let mut v = engine();
        v.insert(1, p(0.0, 0.0));
        assert!(v.insert(2, p(0.0, 0.0)));
        let moved = v.get(2).unwrap();
        assert!(moved.x >= 0.5 && moved.y >= 0.5);
    }

    #[test]
    fn closest_to_breaks_ties_by_id() {
        let mut v = engine();
        v.insert(7, p(100.0, 0.0));
        v.insert(3, p(0.0, 100.0));
        v.insert(9, p(300.0, 300.0));
        // (0, 0) is exactly 100 away from both 3 and 7
        assert_eq!(v.closest_to(&p(0.0, 0.0)), Some(3));
        assert_eq!(v.closest_to(&p(100.0, 10.0)), Some(7));
    }

    #[test]
    fn closest_to_on_empty_engine() {
        assert_eq!(engine().closest_to(&p(1.0, 1.0)), None);
    }

    #[test]
    fn triangle_is_mutually_enclosing() {
        let mut v = engine();
        v.insert(1, p(0.0, 0.0));
        v.insert(2, p(100.0, 0.0));
        v.insert(3, p(50.0, 100.0));

        assert_eq!(sorted(v.get_en(1, 1)), vec![2, 3]);
        assert_eq!(sorted(v.get_en(2, 1)), vec![1, 3]);
        assert_eq!(sorted(v.get_en(3, 1)), vec![1, 2]);
        assert!(v.is_enclosing(2, 1));
        assert!(v.is_enclosing(1, 2));
    }

    #[test]
    fn enclosing_excludes_shielded_sites() {
        let mut v = engine();
        v.insert(1, p(100.0, 500.0));
        v.insert(2, p(500.0, 500.0));
        v.insert(3, p(900.0, 500.0));
        assert!(!v.is_enclosing(3, 1));
        assert_eq!(v.get_en(1, 1), vec![2]);
    }

    #[test]
    fn second_level_enclosing_neighbors() {
        let mut v = engine();
        v.insert(1, p(100.0, 500.0));
        v.insert(2, p(500.0, 500.0));
        v.insert(3, p(900.0, 500.0));

        assert_eq!(sorted(v.get_en(1, 2)), vec![2, 3]);
        // Queries leave the site set untouched
        assert_eq!(v.len(), 3);
        assert_eq!(v.get_en(1, 1), vec![2]);
    }

    #[test]
    fn contains_uses_cells() {
        let mut v = engine();
        v.insert(1, p(250.0, 500.0));
        v.insert(2, p(750.0, 500.0));
        assert!(v.contains(1, &p(499.0, 10.0)));
        assert!(!v.contains(1, &p(501.0, 10.0)));
        assert!(v.contains(2, &p(501.0, 10.0)));
        assert!(!v.contains(3, &p(1.0, 1.0)));
    }

    #[test]
    fn overlap_modes() {
        let mut v = engine();
        v.insert(1, p(250.0, 500.0));
        v.insert(2, p(750.0, 500.0));

        // Site 1 is 300 away from (550, 500), its cell edge only 50
        let q = p(550.0, 500.0);
        assert!(!v.overlaps(1, &q, 100.0, false));
        assert!(v.overlaps(1, &q, 100.0, true));
        assert!(v.overlaps(1, &q, 300.0, false));
        assert!(!v.overlaps(4, &q, 1000.0, false));
    }

    #[test]
    fn boundary_sites_reach_past_the_circle() {
        let mut v = engine();
        v.insert(1, p(500.0, 500.0));
        v.insert(2, p(520.0, 500.0));
        v.insert(3, p(480.0, 500.0));
        v.insert(4, p(500.0, 520.0));
        v.insert(5, p(500.0, 480.0));
        v.insert(6, p(900.0, 900.0));

        let center = p(500.0, 500.0);
        // 6 is outside the circle and ignored entirely
        assert!(!v.is_boundary(6, &center, 100.0));
        // The outer ring reaches the box once 6 is dropped
        assert!(v.is_boundary(2, &center, 100.0));
        // The middle cell is a small diamond inside the circle
        assert!(!v.is_boundary(1, &center, 100.0));
        assert!(!v.is_boundary(42, &center, 100.0));
        // Nothing changed
        assert_eq!(v.len(), 6);
    }

    #[test]
    fn aoi_and_neighbor_sets() {
        let mut v = engine();
        v.insert(1, p(100.0, 500.0));
        v.insert(2, p(500.0, 500.0));
        v.insert(3, p(900.0, 500.0));

        assert_eq!(v.aoi_sites(1, 450.0), vec![2]);
        assert_eq!(sorted(v.neighbors_of(1, 850.0)), vec![2, 3]);
        assert!(v.aoi_sites(99, 1000.0).is_empty());
    }

    #[test]
    fn edges_are_reported_once() {
        let mut v = engine();
        v.insert(1, p(250.0, 500.0));
        v.insert(2, p(750.0, 500.0));

        let edges = v.edges();
        let shared: Vec<_> = edges.iter().filter(|e| e.right.is_some()).collect();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].left, 1);
        assert_eq!(shared[0].right, Some(2));
        assert!((shared[0].segment.length() - 1000.0).abs() < 1e-6);
        // Each half has 3 border edges
        assert_eq!(edges.len(), 7);
    }

    #[test]
    fn display_lists_sites() {
        let mut v = engine();
        v.insert(2, p(1.0, 2.0));
        v.insert(1, p(3.0, 4.0));
        assert_eq!(v.to_string(), "[1] (3, 4) [2] (1, 2)");
    }

    #[test]
    fn bounding_box_can_be_replaced() {
        let mut v = engine();
        assert!(!v.set_bounding_box(BoundingBox::square(0.0)));
        assert!(v.set_bounding_box(BoundingBox::square(10.0)));
        assert!(!v.insert(1, p(50.0, 50.0)));
        assert!(v.insert(1, p(5.0, 5.0)));
    }

    fn site_set() -> impl Strategy<Value = Vec<(f64, f64)>> {
        prop::collection::vec((1.0f64..999.0, 1.0f64..999.0), 2..24)
    }

    proptest! {
        #[test]
        fn closest_is_order_independent(points in site_set(), qx in 0.0f64..1000.0, qy in 0.0f64..1000.0) {
            let mut forward = engine();
            let mut backward = engine();
            for (i, (x, y)) in points.iter().enumerate() {
                forward.insert(i as SiteId + 1, p(*x, *y));
            }
            for (i, (x, y)) in points.iter().enumerate().rev() {
                backward.insert(i as SiteId + 1, p(*x, *y));
            }
            let q = p(qx, qy);
            prop_assert_eq!(forward.closest_to(&q), backward.closest_to(&q));
        }

        #[test]
        fn enclosing_is_symmetric(points in site_set()) {
            let mut v = engine();
            for (i, (x, y)) in points.iter().enumerate() {
                v.insert(i as SiteId + 1, p(*x, *y));
            }
            let ids: Vec<_> = v.sites().map(|(id, _)| id).collect();
            for &a in &ids {
                for &b in &ids {
                    if a != b {
                        prop_assert_eq!(v.is_enclosing(a, b), v.is_enclosing(b, a));
                    }
                }
            }
        }

        #[test]
        fn sites_never_coincide(points in prop::collection::vec((0u8..4, 0u8..4), 2..16)) {
            let mut v = engine();
            for (i, (x, y)) in points.iter().enumerate() {
                v.insert(i as SiteId + 1, p(f64::from(*x) * 10.0, f64::from(*y) * 10.0));
            }
            let all: Vec<_> = v.sites().collect();
            for (i, (_, a)) in all.iter().enumerate() {
                for (_, b) in &all[i + 1..] {
                    prop_assert!(a != b);
                }
            }
        }

        #[test]
        fn closest_site_contains_query(points in site_set(), qx in 1.0f64..999.0, qy in 1.0f64..999.0) {
            let mut v = engine();
            for (i, (x, y)) in points.iter().enumerate() {
                v.insert(i as SiteId + 1, p(*x, *y));
            }
            let q = p(qx, qy);
            let closest = v.closest_to(&q).unwrap();
            let owner = v.sites().map(|(id, _)| id).find(|&id| v.contains(id, &q));
            // Points exactly on an edge may belong to no polygon
            if let Some(owner) = owner {
                let d_owner = v.get(owner).unwrap().distance(&q);
                let d_closest = v.get(closest).unwrap().distance(&q);
                prop_assert!((d_owner - d_closest).abs() < 1e-6);
            }
        }
    }
}
