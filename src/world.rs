//! Host world boundary.
//!
//! The engine never owns world state. It reads cells through the [`World`]
//! trait, which the host implements over its own chunk storage. A `None`
//! from [`World::cell`] means the region is not resident; matching treats
//! that as a failure rather than guessing.
//!
//! [`GridWorld`] is a small in-memory implementation used by tests, the
//! benchmark, and hosts that want to stage a structure before placing it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::geom::{CellPos, Facing, WorldId};

/// Cell kind the host reports for empty space.
pub const AIR: &str = "air";

/// Property name carrying a cell's intrinsic direction, if any.
pub const FACING_PROPERTY: &str = "facing";

/// Snapshot of a single world cell as seen by predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Lowercase type key, e.g. `iron_block`.
    pub kind: String,
    /// Data properties (`facing=north`, `waterlogged=false`, ...), lowercase.
    pub properties: BTreeMap<String, String>,
    /// Type groups this kind belongs to (host tags).
    pub groups: BTreeSet<String>,
}

impl Cell {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into().trim().to_ascii_lowercase(),
            properties: BTreeMap::new(),
            groups: BTreeSet::new(),
        }
    }

    pub fn air() -> Self {
        Self::new(AIR)
    }

    pub fn with_property(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.properties.insert(
            key.as_ref().trim().to_ascii_lowercase(),
            value.as_ref().trim().to_ascii_lowercase(),
        );
        self
    }

    pub fn with_group(mut self, group: impl AsRef<str>) -> Self {
        self.groups
            .insert(group.as_ref().trim().to_ascii_lowercase());
        self
    }

    pub fn is_air(&self) -> bool {
        self.kind == AIR
    }

    /// Intrinsic cardinal direction, when the cell exposes one.
    pub fn facing(&self) -> Option<Facing> {
        self.properties
            .get(FACING_PROPERTY)
            .and_then(|v| Facing::from_property(v))
    }
}

/// Read-only view of the host world.
pub trait World {
    /// The cell at `pos`, or `None` if its region is not loaded.
    fn cell(&self, pos: CellPos) -> Option<Cell>;

    /// Whether the region containing `pos` is resident.
    fn is_loaded(&self, pos: CellPos) -> bool {
        self.cell(pos).is_some()
    }
}

/// Side length of the square column regions [`GridWorld`] loads and unloads.
pub const REGION_SIZE: i32 = 16;

/// Sparse in-memory world. Unset cells in loaded regions read as air.
#[derive(Debug, Default, Clone)]
pub struct GridWorld {
    cells: HashMap<CellPos, Cell>,
    unloaded: HashSet<(WorldId, i32, i32)>,
}

impl GridWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, pos: CellPos, cell: Cell) {
        if cell.is_air() {
            self.cells.remove(&pos);
        } else {
            self.cells.insert(pos, cell);
        }
    }

    pub fn clear(&mut self, pos: CellPos) {
        self.cells.remove(&pos);
    }

    /// Mark the region containing `pos` as not resident.
    pub fn unload_region(&mut self, pos: CellPos) {
        self.unloaded.insert(Self::region_of(pos));
    }

    pub fn load_region(&mut self, pos: CellPos) {
        self.unloaded.remove(&Self::region_of(pos));
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn region_of(pos: CellPos) -> (WorldId, i32, i32) {
        (
            pos.world,
            pos.x.div_euclid(REGION_SIZE),
            pos.z.div_euclid(REGION_SIZE),
        )
    }
}

impl World for GridWorld {
    fn cell(&self, pos: CellPos) -> Option<Cell> {
        if self.unloaded.contains(&Self::region_of(pos)) {
            return None;
        }
        Some(self.cells.get(&pos).cloned().unwrap_or_else(Cell::air))
    }
}
