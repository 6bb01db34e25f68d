//! Shared data contracts for the block location store.
//!
//! Everything here is plain data: coordinates, the canonical key used to index
//! blocks, the change records handed to the writer thread and the rows that
//! come back out of the database.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest type identifier accepted by the `blocks` table.
pub const MAX_TYPE_ID_LEN: usize = 32;

/// Number of bits dropped from a block coordinate to get its region coordinate.
pub const REGION_SHIFT: u32 = 4;

/// Identifier of a world, stored verbatim in the `world_id` column.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorldId(pub String);

impl WorldId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorldId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Integer block coordinate within a world.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn region(&self) -> RegionPos {
        RegionPos::containing(*self)
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

/// Column of blocks that the host loads and unloads as a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Arithmetic shift, so negative coordinates floor towards negative infinity.
    pub fn containing(pos: BlockPos) -> Self {
        Self {
            x: pos.x >> REGION_SHIFT,
            z: pos.z >> REGION_SHIFT,
        }
    }

    pub fn contains(&self, pos: BlockPos) -> bool {
        Self::containing(pos) == *self
    }
}

impl fmt::Display for RegionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.z)
    }
}

/// Canonical coordinate key: one block position in one world.
///
/// Renders as `world,x,y,z` and parses back from the same form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationKey {
    pub world: WorldId,
    pub pos: BlockPos,
}

impl LocationKey {
    pub fn new(world: impl Into<WorldId>, pos: BlockPos) -> Self {
        Self {
            world: world.into(),
            pos,
        }
    }

    pub fn at(world: &WorldId, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.clone(),
            pos: BlockPos::new(x, y, z),
        }
    }

    pub fn region(&self) -> RegionPos {
        self.pos.region()
    }
}

impl From<String> for WorldId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.world, self.pos)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseKeyError {
    #[error("location key `{0}` must have the form world,x,y,z")]
    Shape(String),
    #[error("location key `{input}` has a non-integer coordinate `{part}`")]
    Coordinate { input: String, part: String },
}

impl FromStr for LocationKey {
    type Err = ParseKeyError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // World ids may themselves contain commas, so split coordinates off the right.
        let mut parts = input.rsplitn(4, ',');
        let z = parts.next();
        let y = parts.next();
        let x = parts.next();
        let world = parts.next();
        let (Some(world), Some(x), Some(y), Some(z)) = (world, x, y, z) else {
            return Err(ParseKeyError::Shape(input.to_string()));
        };
        if world.is_empty() {
            return Err(ParseKeyError::Shape(input.to_string()));
        }
        let coord = |part: &str| {
            part.trim()
                .parse::<i32>()
                .map_err(|_| ParseKeyError::Coordinate {
                    input: input.to_string(),
                    part: part.to_string(),
                })
        };
        Ok(Self {
            world: WorldId::from(world),
            pos: BlockPos::new(coord(x)?, coord(y)?, coord(z)?),
        })
    }
}

/// Durable operation for a single coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resolved block change, ready to be applied by the writer.
///
/// `type_id` and `data` are filled in at flush time from the live object; a
/// delete of a block that is already gone carries neither.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChange {
    pub op: ChangeOp,
    pub key: LocationKey,
    pub type_id: Option<String>,
    pub data: Option<String>,
}

impl BlockChange {
    pub fn new(op: ChangeOp, key: LocationKey) -> Self {
        Self {
            op,
            key,
            type_id: None,
            data: None,
        }
    }

    pub fn with_state(mut self, type_id: impl Into<String>, data: impl Into<String>) -> Self {
        self.type_id = Some(type_id.into());
        self.data = Some(data.into());
        self
    }
}

/// Work item passed from the simulation thread to the writer thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeRecord {
    Apply(BlockChange),
    /// Commit the open transaction; the preceding records form one batch.
    Commit,
    /// Commit anything outstanding and stop the writer.
    Shutdown,
}

/// A row of the `blocks` table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRow {
    pub world: WorldId,
    pub pos: BlockPos,
    pub type_id: String,
    pub data: String,
}

impl BlockRow {
    pub fn key(&self) -> LocationKey {
        LocationKey {
            world: self.world.clone(),
            pos: self.pos,
        }
    }
}

pub fn rows_to_json(rows: &[BlockRow]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_uses_floor_division() {
        assert_eq!(BlockPos::new(0, 64, 0).region(), RegionPos::new(0, 0));
        assert_eq!(BlockPos::new(15, 0, 16).region(), RegionPos::new(0, 1));
        assert_eq!(BlockPos::new(-1, 0, -16).region(), RegionPos::new(-1, -1));
        assert_eq!(BlockPos::new(-17, 0, 5).region(), RegionPos::new(-2, 0));
    }

    #[test]
    fn location_key_text_form() {
        let key = LocationKey::new("w1", BlockPos::new(0, 64, -3));
        assert_eq!(key.to_string(), "w1,0,64,-3");
        assert_eq!("w1,0,64,-3".parse::<LocationKey>().unwrap(), key);
    }

    #[test]
    fn location_key_world_may_contain_commas() {
        let key: LocationKey = "a,b,1,2,3".parse().unwrap();
        assert_eq!(key.world.as_str(), "a,b");
        assert_eq!(key.pos, BlockPos::new(1, 2, 3));
    }

    #[test]
    fn location_key_rejects_bad_input() {
        assert!(matches!(
            "1,2,3".parse::<LocationKey>(),
            Err(ParseKeyError::Shape(_))
        ));
        assert!(matches!(
            "w,1,two,3".parse::<LocationKey>(),
            Err(ParseKeyError::Coordinate { .. })
        ));
    }

    #[test]
    fn rows_json_keeps_blob_verbatim() {
        let rows = vec![BlockRow {
            world: WorldId::new("w1"),
            pos: BlockPos::new(0, 64, 0),
            type_id: "lamp".into(),
            data: "on=true".into(),
        }];
        let json = rows_to_json(&rows).unwrap();
        let parsed: Vec<BlockRow> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rows);
    }
}
