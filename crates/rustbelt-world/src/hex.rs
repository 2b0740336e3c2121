//! Axial hex coordinates and the neighbor-lookup capability.
//!
//! Rust spread only needs to know which cells border a given cell. That
//! question is behind the [`NeighborLookup`] trait so the spread pass can be
//! tested with hand-built adjacency and run in production over
//! [`AxialGrid`], which derives adjacency from axial `(q, r)` coordinates.

use std::collections::BTreeMap;

use rustbelt_types::{HexCell, HexId};

/// Offsets of the six neighbors of an axial hex.
pub const AXIAL_DIRECTIONS: [(i32, i32); 6] = [(1, 0), (1, -1), (0, -1), (-1, 0), (-1, 1), (0, 1)];

/// An axial hex coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Axial {
    /// Column.
    pub q: i32,
    /// Row.
    pub r: i32,
}

impl Axial {
    /// Create a coordinate.
    pub const fn new(q: i32, r: i32) -> Self {
        Self { q, r }
    }

    /// The six bordering coordinates.
    pub fn neighbors(self) -> [Self; 6] {
        AXIAL_DIRECTIONS.map(|(dq, dr)| Self::new(self.q.saturating_add(dq), self.r.saturating_add(dr)))
    }

    /// Hex distance in steps (the ring index around `other`).
    pub fn distance(self, other: Self) -> u32 {
        let dq = i64::from(self.q) - i64::from(other.q);
        let dr = i64::from(self.r) - i64::from(other.r);
        let ds = -dq - dr;
        let steps = dq.abs().max(dr.abs()).max(ds.abs());
        u32::try_from(steps).unwrap_or(u32::MAX)
    }
}

/// Answers "which cells border this cell".
pub trait NeighborLookup {
    /// IDs of cells adjacent to `hex`. Unknown cells have no neighbors.
    fn neighbors_of(&self, hex: HexId) -> Vec<HexId>;
}

/// Adjacency derived from axial coordinates of a set of cells.
#[derive(Debug, Clone, Default)]
pub struct AxialGrid {
    by_coord: BTreeMap<Axial, HexId>,
    by_id: BTreeMap<HexId, Axial>,
}

impl AxialGrid {
    /// Index the given cells. Later duplicates of a coordinate win.
    pub fn from_cells<'a>(cells: impl IntoIterator<Item = &'a HexCell>) -> Self {
        let mut grid = Self::default();
        for cell in cells {
            let coord = Axial::new(cell.q, cell.r);
            grid.by_coord.insert(coord, cell.id);
            grid.by_id.insert(cell.id, coord);
        }
        grid
    }

    /// Number of indexed cells.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether no cells are indexed.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Coordinate of a cell, if indexed.
    pub fn coord_of(&self, hex: HexId) -> Option<Axial> {
        self.by_id.get(&hex).copied()
    }
}

impl NeighborLookup for AxialGrid {
    fn neighbors_of(&self, hex: HexId) -> Vec<HexId> {
        let Some(coord) = self.by_id.get(&hex) else {
            return Vec::new();
        };
        coord
            .neighbors()
            .iter()
            .filter_map(|n| self.by_coord.get(n).copied())
            .collect()
    }
}

impl NeighborLookup for BTreeMap<HexId, Vec<HexId>> {
    fn neighbors_of(&self, hex: HexId) -> Vec<HexId> {
        self.get(&hex).cloned().unwrap_or_default()
    }
}
