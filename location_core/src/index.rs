use ahash::AHashMap;
use location_schema::{BlockPos, LocationKey, RegionPos, WorldId};
use tracing::warn;

use crate::object::WorldObject;

type WorldIndex = AHashMap<BlockPos, Box<dyn WorldObject>>;

/// Live blocks by world and position. Owns every registered object.
#[derive(Debug, Default)]
pub struct SpatialIndex {
    worlds: AHashMap<WorldId, WorldIndex>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty index for `world` if it has none. Returns `true` if one was created.
    pub fn ensure_world(&mut self, world: &WorldId) -> bool {
        if self.worlds.contains_key(world) {
            return false;
        }
        self.worlds.insert(world.clone(), WorldIndex::default());
        true
    }

    pub fn has_world(&self, world: &WorldId) -> bool {
        self.worlds.contains_key(world)
    }

    pub fn remove_world(&mut self, world: &WorldId) -> Vec<Box<dyn WorldObject>> {
        self.worlds
            .remove(world)
            .map(|index| index.into_values().collect())
            .unwrap_or_default()
    }

    pub fn worlds(&self) -> Vec<WorldId> {
        let mut worlds: Vec<WorldId> = self.worlds.keys().cloned().collect();
        worlds.sort();
        worlds
    }

    /// Inserts `object` at `key`. An occupied key is left untouched and the object is handed back.
    pub fn put(
        &mut self,
        key: &LocationKey,
        object: Box<dyn WorldObject>,
    ) -> Result<(), Box<dyn WorldObject>> {
        let index = self.worlds.entry(key.world.clone()).or_default();
        if let Some(existing) = index.get(&key.pos) {
            warn!(
                target: "block_store::location",
                %key,
                existing = existing.block_type(),
                rejected = object.block_type(),
                "index.put_rejected=occupied"
            );
            return Err(object);
        }
        index.insert(key.pos, object);
        Ok(())
    }

    pub fn remove(&mut self, key: &LocationKey) -> Option<Box<dyn WorldObject>> {
        self.worlds.get_mut(&key.world)?.remove(&key.pos)
    }

    pub fn get(&self, key: &LocationKey) -> Option<&dyn WorldObject> {
        self.worlds
            .get(&key.world)?
            .get(&key.pos)
            .map(|object| object.as_ref())
    }

    pub fn get_mut(&mut self, key: &LocationKey) -> Option<&mut dyn WorldObject> {
        self.worlds
            .get_mut(&key.world)?
            .get_mut(&key.pos)
            .map(|object| object.as_mut())
    }

    pub(crate) fn get_mut_at(&mut self, world: &WorldId, pos: BlockPos) -> Option<&mut dyn WorldObject> {
        self.worlds
            .get_mut(world)?
            .get_mut(&pos)
            .map(|object| object.as_mut())
    }

    pub fn contains(&self, key: &LocationKey) -> bool {
        self.get(key).is_some()
    }

    pub fn list_all(&self, world: &WorldId) -> Vec<&dyn WorldObject> {
        self.worlds
            .get(world)
            .map(|index| index.values().map(|object| object.as_ref()).collect())
            .unwrap_or_default()
    }

    /// All blocks in `world`, ordered by block type and then position.
    pub fn list_sorted(&self, world: &WorldId) -> Vec<&dyn WorldObject> {
        let Some(index) = self.worlds.get(world) else {
            return Vec::new();
        };
        let mut entries: Vec<(&BlockPos, &Box<dyn WorldObject>)> = index.iter().collect();
        entries.sort_by(|(pos_a, a), (pos_b, b)| {
            a.block_type()
                .cmp(b.block_type())
                .then_with(|| pos_a.cmp(pos_b))
        });
        entries
            .into_iter()
            .map(|(_, object)| object.as_ref())
            .collect()
    }

    /// Linear scan of the world; only used when a region is loaded or inspected.
    pub fn list_in_region(&self, world: &WorldId, region: RegionPos) -> Vec<&dyn WorldObject> {
        self.worlds
            .get(world)
            .map(|index| {
                index
                    .iter()
                    .filter(|(pos, _)| region.contains(**pos))
                    .map(|(_, object)| object.as_ref())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.worlds.values().map(|index| index.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::test_support::Stub;

    fn world() -> WorldId {
        WorldId::new("w1")
    }

    #[test]
    fn put_get_remove() {
        let mut index = SpatialIndex::new();
        let key = LocationKey::at(&world(), 1, 2, 3);
        index.put(&key, Stub::new("lamp", "on=true").boxed()).unwrap();
        assert_eq!(index.get(&key).unwrap().freeze(), "on=true");
        assert_eq!(index.len(), 1);

        let removed = index.remove(&key).unwrap();
        assert_eq!(removed.block_type(), "lamp");
        assert!(index.get(&key).is_none());
        assert!(index.remove(&key).is_none());
    }

    #[test]
    fn put_over_occupied_key_keeps_original() {
        let mut index = SpatialIndex::new();
        let key = LocationKey::at(&world(), 0, 0, 0);
        index.put(&key, Stub::new("lamp", "first").boxed()).unwrap();
        let rejected = index
            .put(&key, Stub::new("widget", "second").boxed())
            .unwrap_err();
        assert_eq!(rejected.freeze(), "second");
        assert_eq!(index.get(&key).unwrap().freeze(), "first");
        assert_eq!(index.list_all(&world()).len(), 1);
    }

    #[test]
    fn worlds_are_separate() {
        let mut index = SpatialIndex::new();
        let other = WorldId::new("w2");
        index
            .put(&LocationKey::at(&world(), 0, 0, 0), Stub::new("a", "1").boxed())
            .unwrap();
        index
            .put(&LocationKey::at(&other, 0, 0, 0), Stub::new("b", "2").boxed())
            .unwrap();
        assert_eq!(index.list_all(&world()).len(), 1);
        assert_eq!(index.list_all(&other)[0].block_type(), "b");
        assert_eq!(index.worlds(), vec![world(), other]);
    }

    #[test]
    fn region_listing_filters_by_region() {
        let mut index = SpatialIndex::new();
        for (x, z) in [(0, 0), (15, 15), (16, 0), (-1, 0)] {
            index
                .put(&LocationKey::at(&world(), x, 64, z), Stub::new("lamp", "").boxed())
                .unwrap();
        }
        assert_eq!(index.list_in_region(&world(), RegionPos::new(0, 0)).len(), 2);
        assert_eq!(index.list_in_region(&world(), RegionPos::new(1, 0)).len(), 1);
        assert_eq!(index.list_in_region(&world(), RegionPos::new(-1, 0)).len(), 1);
        assert!(index
            .list_in_region(&WorldId::new("nowhere"), RegionPos::new(0, 0))
            .is_empty());
    }

    #[test]
    fn sorted_listing_orders_by_type_then_position() {
        let mut index = SpatialIndex::new();
        index
            .put(&LocationKey::at(&world(), 5, 0, 0), Stub::new("widget", "w5").boxed())
            .unwrap();
        index
            .put(&LocationKey::at(&world(), 9, 0, 0), Stub::new("lamp", "l9").boxed())
            .unwrap();
        index
            .put(&LocationKey::at(&world(), 1, 0, 0), Stub::new("lamp", "l1").boxed())
            .unwrap();
        let states: Vec<String> = index
            .list_sorted(&world())
            .iter()
            .map(|object| object.freeze())
            .collect();
        assert_eq!(states, vec!["l1", "l9", "w5"]);
    }

    #[test]
    fn empty_world_counts_as_loaded() {
        let mut index = SpatialIndex::new();
        assert!(!index.has_world(&world()));
        assert!(index.ensure_world(&world()));
        assert!(!index.ensure_world(&world()));
        assert!(index.has_world(&world()));
        assert!(index.is_empty());
        assert!(index.remove_world(&world()).is_empty());
        assert!(!index.has_world(&world()));
    }
}
