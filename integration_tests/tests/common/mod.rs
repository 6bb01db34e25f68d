#![allow(dead_code)]

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use location_core::{
    load_location_config_from_env, LocationConfig, LocationKey, LocationManager, TickContext,
    TypeRegistry, WorldId, WorldObject, LOCATION_CONFIG_ENV,
};

static INIT: Once = Once::new();

pub fn ensure_test_config() {
    INIT.call_once(|| {
        let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("test_location_config.json");

        debug_assert!(
            config_path.exists(),
            "missing test location config at {}",
            config_path.display()
        );

        std::env::set_var(LOCATION_CONFIG_ENV, &config_path);
    });
}

/// Test config pointed at a database inside `dir`.
pub fn test_config(dir: &Path) -> LocationConfig {
    ensure_test_config();
    load_location_config_from_env().with_database_path(dir.join("blocks.db"))
}

pub fn open_manager(dir: &Path, types: &[&'static str]) -> LocationManager {
    LocationManager::open(test_config(dir), registry(types)).expect("open location manager")
}

pub fn registry(types: &[&'static str]) -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    for &type_id in types {
        registry
            .register(type_id, tagged_factory(type_id))
            .expect("valid type id");
    }
    registry
}

pub fn tagged_factory(
    type_id: &'static str,
) -> impl Fn(&str) -> Result<Box<dyn WorldObject>, String> + Send + 'static {
    move |data: &str| {
        if data.starts_with("corrupt") {
            return Err(format!("cannot read `{data}`"));
        }
        Ok(Tagged::new(type_id, data).boxed())
    }
}

pub fn world() -> WorldId {
    WorldId::new("w1")
}

pub fn key(x: i32, y: i32, z: i32) -> LocationKey {
    LocationKey::at(&world(), x, y, z)
}

/// Block with a fixed state string and optional ticking.
#[derive(Debug)]
pub struct Tagged {
    pub type_id: &'static str,
    pub state: String,
    pub tick_rate: u32,
    pub ticks: u64,
    pub location: Option<LocationKey>,
}

impl Tagged {
    pub fn new(type_id: &'static str, state: &str) -> Self {
        Self {
            type_id,
            state: state.to_string(),
            tick_rate: 0,
            ticks: 0,
            location: None,
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

impl WorldObject for Tagged {
    fn block_type(&self) -> &str {
        self.type_id
    }

    fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    fn ticks_lived(&self) -> u64 {
        self.ticks
    }

    fn location(&self) -> Option<&LocationKey> {
        self.location.as_ref()
    }

    fn bind_location(&mut self, key: LocationKey) {
        self.location = Some(key);
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) {
        self.ticks += 1;
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

/// Lamp that flips every `tick_rate` cycles and asks to be saved.
#[derive(Debug)]
pub struct Lamp {
    pub lit: bool,
    pub tick_rate: u32,
    pub ticks: u64,
    pub location: Option<LocationKey>,
}

impl Lamp {
    pub fn new(lit: bool, tick_rate: u32) -> Self {
        Self {
            lit,
            tick_rate,
            ticks: 0,
            location: None,
        }
    }
}

impl WorldObject for Lamp {
    fn block_type(&self) -> &str {
        "lamp"
    }

    fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    fn ticks_lived(&self) -> u64 {
        self.ticks
    }

    fn location(&self) -> Option<&LocationKey> {
        self.location.as_ref()
    }

    fn bind_location(&mut self, key: LocationKey) {
        self.location = Some(key);
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) {
        self.ticks += 1;
    }

    fn on_server_tick(&mut self, ctx: &mut TickContext<'_>) {
        self.lit = !self.lit;
        ctx.mark_dirty();
    }

    fn freeze(&self) -> String {
        format!("on={}", self.lit)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub type StoredBlocks = BTreeMap<(i32, i32, i32), (String, String)>;

/// Committed rows of `world`, keyed by coordinate.
pub fn stored(manager: &LocationManager, world: &WorldId) -> StoredBlocks {
    manager
        .stored_rows(world)
        .expect("read stored rows")
        .into_iter()
        .map(|row| ((row.pos.x, row.pos.y, row.pos.z), (row.type_id, row.data)))
        .collect()
}

/// In-memory blocks of `world`, in the same shape as [`stored`].
pub fn indexed(manager: &LocationManager, world: &WorldId) -> StoredBlocks {
    manager
        .list_all(world)
        .into_iter()
        .map(|object| {
            let pos = object.location().expect("registered blocks are bound").pos;
            (
                (pos.x, pos.y, pos.z),
                (object.block_type().to_string(), object.freeze()),
            )
        })
        .collect()
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Waits until the writer has committed everything handed to it so far.
pub fn wait_for_writer(manager: &LocationManager) -> bool {
    let target = manager.metrics().flushes;
    wait_until(Duration::from_secs(5), || {
        manager.metrics().writer.batches >= target
    })
}
