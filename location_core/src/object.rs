//! Capabilities the location manager needs from the objects it stores, and
//! the collaborators that create them and report which regions are loaded.

use std::any::Any;
use std::fmt;

use ahash::{AHashMap, AHashSet};
use location_schema::{BlockPos, LocationKey, RegionPos, WorldId, MAX_TYPE_ID_LEN};
use thiserror::Error;

/// Per-cycle scratchpad handed to [`WorldObject::tick`] and [`WorldObject::on_server_tick`].
///
/// Objects cannot reach the manager while it is ticking them, so they report
/// state changes here and the manager records them once the visit is over.
#[derive(Debug)]
pub struct TickContext<'a> {
    world: &'a WorldId,
    pos: BlockPos,
    dirty: bool,
}

impl<'a> TickContext<'a> {
    pub(crate) fn new(world: &'a WorldId, pos: BlockPos) -> Self {
        Self {
            world,
            pos,
            dirty: false,
        }
    }

    pub fn world(&self) -> &WorldId {
        self.world
    }

    pub fn pos(&self) -> BlockPos {
        self.pos
    }

    pub fn location(&self) -> LocationKey {
        LocationKey::new(self.world.clone(), self.pos)
    }

    /// Persist this object's state at the next save.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// A stateful block registered with the location manager.
pub trait WorldObject: fmt::Debug + 'static {
    /// Registry identifier; at most [`MAX_TYPE_ID_LEN`] bytes.
    fn block_type(&self) -> &str;

    /// Cycles between [`WorldObject::on_server_tick`] calls; 0 means the object never ticks.
    fn tick_rate(&self) -> u32 {
        0
    }

    /// Number of times [`WorldObject::tick`] has run.
    fn ticks_lived(&self) -> u64;

    fn is_pending_removal(&self) -> bool {
        false
    }

    fn location(&self) -> Option<&LocationKey>;

    fn bind_location(&mut self, key: LocationKey);

    fn on_registered(&mut self, _key: &LocationKey, _is_placing: bool) {}

    fn on_unregistered(&mut self, _key: &LocationKey) {}

    /// Runs every cycle the object's region is loaded. Must advance [`WorldObject::ticks_lived`].
    fn tick(&mut self, ctx: &mut TickContext<'_>);

    fn on_server_tick(&mut self, _ctx: &mut TickContext<'_>) {}

    /// Opaque state blob stored in the `data` column.
    fn freeze(&self) -> String;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn WorldObject {
    pub fn downcast_ref<T: WorldObject>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: WorldObject>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConstructError {
    #[error("no factory registered for block type `{0}`")]
    UnknownType(String),
    #[error("cannot decode `{type_id}` block state: {reason}")]
    Decode { type_id: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeIdError {
    #[error("block type id must not be empty")]
    Empty,
    #[error("block type id `{0}` is longer than {MAX_TYPE_ID_LEN} bytes")]
    TooLong(String),
}

pub fn validate_type_id(type_id: &str) -> Result<(), TypeIdError> {
    if type_id.is_empty() {
        return Err(TypeIdError::Empty);
    }
    if type_id.len() > MAX_TYPE_ID_LEN {
        return Err(TypeIdError::TooLong(type_id.to_string()));
    }
    Ok(())
}

/// Builds an object from its persisted state blob.
pub type BlockFactory = Box<dyn Fn(&str) -> Result<Box<dyn WorldObject>, String> + Send>;

/// Maps type identifiers to factories supplied by the host application.
#[derive(Default)]
pub struct TypeRegistry {
    factories: AHashMap<String, BlockFactory>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a previous factory for the same type was replaced.
    pub fn register<F>(&mut self, type_id: &str, factory: F) -> Result<bool, TypeIdError>
    where
        F: Fn(&str) -> Result<Box<dyn WorldObject>, String> + Send + 'static,
    {
        validate_type_id(type_id)?;
        Ok(self
            .factories
            .insert(type_id.to_string(), Box::new(factory))
            .is_some())
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.factories.contains_key(type_id)
    }

    pub fn construct(&self, type_id: &str, data: &str) -> Result<Box<dyn WorldObject>, ConstructError> {
        let factory = self
            .factories
            .get(type_id)
            .ok_or_else(|| ConstructError::UnknownType(type_id.to_string()))?;
        factory(data).map_err(|reason| ConstructError::Decode {
            type_id: type_id.to_string(),
            reason,
        })
    }

    pub fn type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_ids())
            .finish()
    }
}

/// The environment the blocks live in.
pub trait WorldHost {
    /// Worlds currently loaded, in the order they should be ticked.
    fn worlds(&self) -> Vec<WorldId>;

    fn is_region_loaded(&self, world: &WorldId, region: RegionPos) -> bool;
}

/// [`WorldHost`] backed by explicit lists, for headless hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticWorldHost {
    worlds: Vec<WorldId>,
    loaded: AHashSet<(WorldId, RegionPos)>,
    unloaded: AHashSet<(WorldId, RegionPos)>,
    everything_loaded: bool,
}

impl StaticWorldHost {
    pub fn new(worlds: impl IntoIterator<Item = WorldId>) -> Self {
        Self {
            worlds: worlds.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Treat every region as loaded unless it is explicitly unloaded.
    pub fn all_loaded(mut self) -> Self {
        self.everything_loaded = true;
        self
    }

    pub fn load_region(&mut self, world: &WorldId, region: RegionPos) {
        self.unloaded.remove(&(world.clone(), region));
        self.loaded.insert((world.clone(), region));
    }

    pub fn unload_region(&mut self, world: &WorldId, region: RegionPos) {
        self.loaded.remove(&(world.clone(), region));
        self.unloaded.insert((world.clone(), region));
    }

    pub fn add_world(&mut self, world: WorldId) {
        if !self.worlds.contains(&world) {
            self.worlds.push(world);
        }
    }

    pub fn remove_world(&mut self, world: &WorldId) {
        self.worlds.retain(|w| w != world);
    }
}

impl WorldHost for StaticWorldHost {
    fn worlds(&self) -> Vec<WorldId> {
        self.worlds.clone()
    }

    fn is_region_loaded(&self, world: &WorldId, region: RegionPos) -> bool {
        if !self.worlds.contains(world) {
            return false;
        }
        let entry = (world.clone(), region);
        if self.everything_loaded {
            !self.unloaded.contains(&entry)
        } else {
            self.loaded.contains(&entry)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal block used by unit tests across the crate.
    #[derive(Debug, Default)]
    pub struct Stub {
        pub type_id: String,
        pub state: String,
        pub tick_rate: u32,
        pub ticks: u64,
        pub server_ticks: u64,
        pub removed: bool,
        pub dirty_every: Option<u64>,
        pub location: Option<LocationKey>,
        pub registered: Vec<bool>,
        pub unregistered: usize,
    }

    impl Stub {
        pub fn new(type_id: &str, state: &str) -> Self {
            Self {
                type_id: type_id.to_string(),
                state: state.to_string(),
                ..Self::default()
            }
        }

        pub fn ticking(mut self, rate: u32) -> Self {
            self.tick_rate = rate;
            self
        }

        pub fn boxed(self) -> Box<dyn WorldObject> {
            Box::new(self)
        }
    }

    impl WorldObject for Stub {
        fn block_type(&self) -> &str {
            &self.type_id
        }

        fn tick_rate(&self) -> u32 {
            self.tick_rate
        }

        fn ticks_lived(&self) -> u64 {
            self.ticks
        }

        fn is_pending_removal(&self) -> bool {
            self.removed
        }

        fn location(&self) -> Option<&LocationKey> {
            self.location.as_ref()
        }

        fn bind_location(&mut self, key: LocationKey) {
            self.location = Some(key);
        }

        fn on_registered(&mut self, _key: &LocationKey, is_placing: bool) {
            self.registered.push(is_placing);
        }

        fn on_unregistered(&mut self, _key: &LocationKey) {
            self.unregistered += 1;
        }

        fn tick(&mut self, ctx: &mut TickContext<'_>) {
            self.ticks += 1;
            if let Some(every) = self.dirty_every {
                if self.ticks % every == 0 {
                    self.state = format!("ticks={}", self.ticks);
                    ctx.mark_dirty();
                }
            }
        }

        fn on_server_tick(&mut self, _ctx: &mut TickContext<'_>) {
            self.server_ticks += 1;
        }

        fn freeze(&self) -> String {
            self.state.clone()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    pub fn stub_factory(type_id: &'static str) -> impl Fn(&str) -> Result<Box<dyn WorldObject>, String> + Send {
        move |data: &str| {
            if data.starts_with("corrupt") {
                return Err(format!("unreadable state `{data}`"));
            }
            Ok(Stub::new(type_id, data).boxed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{stub_factory, Stub};
    use super::*;

    #[test]
    fn registry_constructs_known_types() {
        let mut registry = TypeRegistry::new();
        assert!(!registry.register("lamp", stub_factory("lamp")).unwrap());
        let object = registry.construct("lamp", "on=true").unwrap();
        assert_eq!(object.block_type(), "lamp");
        assert_eq!(object.freeze(), "on=true");
        assert!(object.downcast_ref::<Stub>().is_some());
    }

    #[test]
    fn registry_reports_unknown_and_undecodable() {
        let mut registry = TypeRegistry::new();
        registry.register("lamp", stub_factory("lamp")).unwrap();
        assert_eq!(
            registry.construct("widget", "x").unwrap_err(),
            ConstructError::UnknownType("widget".into())
        );
        assert!(matches!(
            registry.construct("lamp", "corrupt!"),
            Err(ConstructError::Decode { .. })
        ));
    }

    #[test]
    fn type_ids_are_bounded() {
        let mut registry = TypeRegistry::new();
        let long = "x".repeat(MAX_TYPE_ID_LEN + 1);
        assert_eq!(
            registry.register(&long, stub_factory("x")).unwrap_err(),
            TypeIdError::TooLong(long.clone())
        );
        assert_eq!(validate_type_id(""), Err(TypeIdError::Empty));
        assert!(validate_type_id(&"x".repeat(MAX_TYPE_ID_LEN)).is_ok());
    }

    #[test]
    fn static_host_tracks_regions_per_world() {
        let w1 = WorldId::new("w1");
        let region = RegionPos::new(0, 0);

        let mut explicit = StaticWorldHost::new([w1.clone()]);
        assert!(!explicit.is_region_loaded(&w1, region));
        explicit.load_region(&w1, region);
        assert!(explicit.is_region_loaded(&w1, region));
        assert!(!explicit.is_region_loaded(&WorldId::new("w2"), region));

        let mut open = StaticWorldHost::new([w1.clone()]).all_loaded();
        assert!(open.is_region_loaded(&w1, RegionPos::new(9, -9)));
        open.unload_region(&w1, region);
        assert!(!open.is_region_loaded(&w1, region));
        open.remove_world(&w1);
        assert!(open.worlds().is_empty());
        assert!(!open.is_region_loaded(&w1, RegionPos::new(9, -9)));
    }

    #[test]
    fn reregistering_replaces_factory() {
        let mut registry = TypeRegistry::new();
        registry.register("lamp", stub_factory("lamp")).unwrap();
        assert!(registry.register("lamp", stub_factory("lamp")).unwrap());
        assert_eq!(registry.type_ids(), vec!["lamp"]);
    }
}
