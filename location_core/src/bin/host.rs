use std::any::Any;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::{info, warn, Level};
use tracing_subscriber::prelude::*;

use location_core::{
    load_location_config_from_env, load_location_config_from_path, log_channel, BlockStore,
    LocationKey, LocationManager, LogEnvelope, RegisterError, StaticWorldHost, TickContext,
    TypeIdError, TypeRegistry, WorldId, WorldObject,
};
use location_schema::{rows_to_json, BlockPos};

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless host for the block location store", long_about = None)]
struct Args {
    /// SQLite database path (overrides the config file)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Location config JSON (defaults to $LOCATION_CONFIG_PATH or the builtin)
    #[arg(long)]
    config: Option<PathBuf>,

    /// World to load; may be repeated
    #[arg(long = "world", default_value = "overworld")]
    worlds: Vec<String>,

    /// Number of simulation cycles to run
    #[arg(long, default_value_t = 100)]
    cycles: u32,

    /// Delay between cycles (milliseconds)
    #[arg(long, default_value_t = 50)]
    cycle_ms: u64,

    /// Save interval override (milliseconds)
    #[arg(long)]
    save_ms: Option<u64>,

    /// Place this many demo lamps plus one counter in the first world
    #[arg(long, default_value_t = 0)]
    place_demo: u32,

    /// Emit logs as JSON lines instead of formatted text
    #[arg(long)]
    log_json: bool,

    /// Print the stored rows of every world after shutdown
    #[arg(long)]
    dump: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let logs = init_logging(args.log_json);

    let mut config = match &args.config {
        Some(path) => load_location_config_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => load_location_config_from_env(),
    };
    if let Some(db) = &args.db {
        config = config.with_database_path(db);
    }
    if let Some(save_ms) = args.save_ms {
        config = config.with_save_interval(Duration::from_millis(save_ms));
    }
    let db_path = config.database_path.clone();
    let busy_timeout = config.busy_timeout();

    let registry = demo_registry().context("Failed to build the demo type registry")?;
    let mut manager =
        LocationManager::open(config, registry).context("Failed to open block store")?;
    let worlds: Vec<WorldId> = args.worlds.iter().map(WorldId::new).collect();
    let host = StaticWorldHost::new(worlds.clone()).all_loaded();
    let loaded = manager
        .load_all(&host)
        .context("Failed to load stored blocks")?;
    info!(
        target: "block_store::host",
        worlds = worlds.len(),
        loaded,
        "host.ready"
    );
    drain_logs(logs.as_ref());

    if let Some(world) = worlds.first() {
        place_demo(&mut manager, world, args.place_demo);
    }

    for _ in 0..args.cycles {
        manager.tick(&host);
        drain_logs(logs.as_ref());
        thread::sleep(Duration::from_millis(args.cycle_ms));
    }

    let metrics = manager.metrics();
    println!("{}", metrics.to_json()?);

    let summary = manager.shutdown();
    if !summary.drained {
        warn!(target: "block_store::host", "host.shutdown=writer_not_drained");
    }
    drain_logs(logs.as_ref());

    if args.dump {
        let store = BlockStore::open(&db_path, busy_timeout)
            .with_context(|| format!("Failed to reopen {}", db_path.display()))?;
        for world in &worlds {
            let rows = store.rows_for_world(world)?;
            println!("=== {world} ===");
            println!("{}", rows_to_json(&rows)?);
        }
    }

    Ok(())
}

fn init_logging(json: bool) -> Option<Receiver<LogEnvelope>> {
    if json {
        let (layer, receiver) = log_channel();
        tracing_subscriber::registry()
            .with(layer.with_min_level(Level::INFO))
            .init();
        Some(receiver)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
        None
    }
}

fn drain_logs(receiver: Option<&Receiver<LogEnvelope>>) {
    let Some(receiver) = receiver else {
        return;
    };
    for envelope in receiver.try_iter() {
        match serde_json::to_string(&envelope) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("unserializable log event: {err}"),
        }
    }
}

fn place_demo(manager: &mut LocationManager, world: &WorldId, lamps: u32) {
    if lamps == 0 {
        return;
    }
    let mut placed = 0;
    let lamps = (0..lamps).map(|i| {
        let pos = BlockPos::new(i as i32 * 2, 64, 0);
        (LocationKey::new(world.clone(), pos), Lamp::new(false).boxed())
    });
    let counter = LocationKey::new(world.clone(), BlockPos::new(0, 64, 8));
    for (key, object) in lamps.chain(std::iter::once((counter, Counter::new(0).boxed()))) {
        match manager.register(key, object, true) {
            Ok(()) => placed += 1,
            // Already there from an earlier run.
            Err(RegisterError::Occupied { key, existing }) => {
                info!(target: "block_store::host", %key, %existing, "host.place_demo=kept");
            }
            Err(err) => {
                warn!(target: "block_store::host", error = %err, "host.place_demo_failed");
            }
        }
    }
    info!(target: "block_store::host", placed, "host.place_demo=done");
}

fn demo_registry() -> Result<TypeRegistry, TypeIdError> {
    let mut registry = TypeRegistry::new();
    registry.register(Lamp::TYPE, |data: &str| Lamp::thaw(data).map(Lamp::boxed))?;
    registry.register(Counter::TYPE, |data: &str| {
        Counter::thaw(data).map(Counter::boxed)
    })?;
    Ok(registry)
}

/// Toggles every `TOGGLE_EVERY` cycles and asks to be saved when it does.
#[derive(Debug)]
struct Lamp {
    lit: bool,
    ticks: u64,
    location: Option<LocationKey>,
}

impl Lamp {
    const TYPE: &'static str = "lamp";
    const TOGGLE_EVERY: u32 = 20;

    fn new(lit: bool) -> Self {
        Self {
            lit,
            ticks: 0,
            location: None,
        }
    }

    fn thaw(data: &str) -> Result<Self, String> {
        match data {
            "on=true" => Ok(Self::new(true)),
            "on=false" => Ok(Self::new(false)),
            other => Err(format!("expected on=true|false, got `{other}`")),
        }
    }

    fn boxed(self) -> Box<dyn WorldObject> {
        Box::new(self)
    }
}

impl WorldObject for Lamp {
    fn block_type(&self) -> &str {
        Self::TYPE
    }

    fn tick_rate(&self) -> u32 {
        Self::TOGGLE_EVERY
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

/// Counts cycles; saved every 20 cycles.
#[derive(Debug)]
struct Counter {
    count: u64,
    location: Option<LocationKey>,
}

impl Counter {
    const TYPE: &'static str = "counter";

    fn new(count: u64) -> Self {
        Self {
            count,
            location: None,
        }
    }

    fn thaw(data: &str) -> Result<Self, String> {
        data.strip_prefix("count=")
            .and_then(|n| n.parse().ok())
            .map(Self::new)
            .ok_or_else(|| format!("expected count=<n>, got `{data}`"))
    }

    fn boxed(self) -> Box<dyn WorldObject> {
        Box::new(self)
    }
}

impl WorldObject for Counter {
    fn block_type(&self) -> &str {
        Self::TYPE
    }

    fn tick_rate(&self) -> u32 {
        20
    }

    fn ticks_lived(&self) -> u64 {
        self.count
    }

    fn location(&self) -> Option<&LocationKey> {
        self.location.as_ref()
    }

    fn bind_location(&mut self, key: LocationKey) {
        self.location = Some(key);
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) {
        self.count += 1;
    }

    fn on_server_tick(&mut self, ctx: &mut TickContext<'_>) {
        ctx.mark_dirty();
    }

    fn freeze(&self) -> String {
        format!("count={}", self.count)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
