//! World coordinates, pattern offsets, and the four cardinal facings.
//!
//! Rotation happens only about the vertical axis, in 90° steps, so the four
//! [`Facing`] values form a cyclic group acting on [`Offset`]s.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Host-assigned identifier of a world (dimension).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct WorldId(pub u32);

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Relative offset from a controller cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Offset {
    pub dx: i32,
    pub dy: i32,
    pub dz: i32,
}

impl Offset {
    pub const ZERO: Offset = Offset::new(0, 0, 0);

    pub const fn new(dx: i32, dy: i32, dz: i32) -> Self {
        Self { dx, dy, dz }
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl From<[i32; 3]> for Offset {
    fn from([dx, dy, dz]: [i32; 3]) -> Self {
        Self::new(dx, dy, dz)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.dx, self.dy, self.dz)
    }
}

/// Absolute cell coordinate in a specific world.
///
/// Ordering is world-major then x/y/z, which gives candidate sets a stable
/// iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    pub world: WorldId,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellPos {
    pub const fn new(world: WorldId, x: i32, y: i32, z: i32) -> Self {
        Self { world, x, y, z }
    }

    /// Stable string form used as a storage key: `w<world>:<x>,<y>,<z>`.
    pub fn storage_key(&self) -> String {
        format!("{}:{},{},{}", self.world, self.x, self.y, self.z)
    }
}

impl Add<Offset> for CellPos {
    type Output = CellPos;

    fn add(self, o: Offset) -> CellPos {
        CellPos::new(self.world, self.x + o.dx, self.y + o.dy, self.z + o.dz)
    }
}

impl Sub<Offset> for CellPos {
    type Output = CellPos;

    fn sub(self, o: Offset) -> CellPos {
        CellPos::new(self.world, self.x - o.dx, self.y - o.dy, self.z - o.dz)
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {}, {})", self.world, self.x, self.y, self.z)
    }
}

/// One of the four cardinal directions a structure can face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    North,
    East,
    South,
    West,
}

impl Facing {
    /// Fixed search order for rotation candidates.
    pub const ALL: [Facing; 4] = [Facing::North, Facing::East, Facing::South, Facing::West];

    /// Rotate a template offset into world space.
    ///
    /// North is the identity; each step clockwise maps `(x, y, z)` to `(-z, y, x)`.
    pub fn rotate(self, o: Offset) -> Offset {
        match self {
            Facing::North => o,
            Facing::East => Offset::new(-o.dz, o.dy, o.dx),
            Facing::South => Offset::new(-o.dx, o.dy, -o.dz),
            Facing::West => Offset::new(o.dz, o.dy, -o.dx),
        }
    }

    /// Inverse of [`rotate`](Self::rotate): maps a world-space offset back
    /// into template space.
    pub fn unrotate(self, o: Offset) -> Offset {
        self.opposite_turn().rotate(o)
    }

    fn opposite_turn(self) -> Facing {
        match self {
            Facing::North => Facing::North,
            Facing::East => Facing::West,
            Facing::South => Facing::South,
            Facing::West => Facing::East,
        }
    }

    /// Parse a host directional property value (`"north"`, `"EAST"`, ...).
    ///
    /// Non-cardinal values such as `up` or `down` yield `None`.
    pub fn from_property(value: &str) -> Option<Facing> {
        match value.trim().to_ascii_lowercase().as_str() {
            "north" => Some(Facing::North),
            "east" => Some(Facing::East),
            "south" => Some(Facing::South),
            "west" => Some(Facing::West),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Facing::North => "north",
            Facing::East => "east",
            Facing::South => "south",
            Facing::West => "west",
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_matches_cardinal_table() {
        let o = Offset::new(1, 2, 3);
        assert_eq!(Facing::North.rotate(o), Offset::new(1, 2, 3));
        assert_eq!(Facing::East.rotate(o), Offset::new(-3, 2, 1));
        assert_eq!(Facing::South.rotate(o), Offset::new(-1, 2, -3));
        assert_eq!(Facing::West.rotate(o), Offset::new(3, 2, -1));
    }

    #[test]
    fn unrotate_inverts_rotate() {
        let offsets = [
            Offset::new(1, 0, 0),
            Offset::new(0, 0, 1),
            Offset::new(-2, 5, 7),
            Offset::new(4, -1, -3),
        ];
        for facing in Facing::ALL {
            for o in offsets {
                assert_eq!(facing.unrotate(facing.rotate(o)), o, "{facing} {o}");
                assert_eq!(facing.rotate(facing.unrotate(o)), o, "{facing} {o}");
            }
        }
    }

    #[test]
    fn four_east_turns_are_identity() {
        let o = Offset::new(3, 1, -2);
        let turned = (0..4).fold(o, |acc, _| Facing::East.rotate(acc));
        assert_eq!(turned, o);
    }

    #[test]
    fn facing_from_property_is_case_insensitive() {
        assert_eq!(Facing::from_property("EAST"), Some(Facing::East));
        assert_eq!(Facing::from_property(" west "), Some(Facing::West));
        assert_eq!(Facing::from_property("up"), None);
    }

    #[test]
    fn position_arithmetic() {
        let p = CellPos::new(WorldId(0), 10, 64, -5);
        let o = Offset::new(1, -1, 2);
        assert_eq!(p + o, CellPos::new(WorldId(0), 11, 63, -3));
        assert_eq!((p + o) - o, p);
        assert_eq!(p.storage_key(), "w0:10,64,-5");
    }
}
