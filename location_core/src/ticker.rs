use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use location_schema::{BlockPos, LocationKey, WorldId};
use tracing::debug;

use crate::index::SpatialIndex;
use crate::object::{TickContext, WorldHost};

/// Outcome of one scheduler cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub ticked: usize,
    pub periodic: usize,
    pub skipped_unloaded: usize,
    pub pruned: usize,
    /// Blocks that asked for their state to be saved.
    pub dirty: Vec<LocationKey>,
}

/// Per-world sets of blocks that want per-cycle updates.
///
/// Holds positions only; the objects themselves stay in the [`SpatialIndex`].
#[derive(Debug, Default)]
pub struct TickScheduler {
    active: AHashMap<WorldId, AHashSet<BlockPos>>,
    cycles: u64,
    total_time: Duration,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &LocationKey) -> bool {
        let added = self
            .active
            .entry(key.world.clone())
            .or_default()
            .insert(key.pos);
        if added {
            debug!(target: "block_store::location", %key, "ticker.added");
        }
        added
    }

    pub fn remove(&mut self, key: &LocationKey) -> bool {
        self.active
            .get_mut(&key.world)
            .is_some_and(|set| set.remove(&key.pos))
    }

    pub fn contains(&self, key: &LocationKey) -> bool {
        self.active
            .get(&key.world)
            .is_some_and(|set| set.contains(&key.pos))
    }

    pub fn remove_world(&mut self, world: &WorldId) -> usize {
        self.active.remove(world).map_or(0, |set| set.len())
    }

    pub fn active_len(&self) -> usize {
        self.active.values().map(|set| set.len()).sum()
    }

    /// Visits the active blocks of every world the host reports, in host order.
    pub fn run_cycle(&mut self, index: &mut SpatialIndex, host: &dyn WorldHost) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        for world in host.worlds() {
            if let Some(active) = self.active.get_mut(&world) {
                tick_world(&world, active, index, host, &mut report);
            }
        }

        self.cycles += 1;
        self.total_time += started.elapsed();
        report
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn average_cycle_time(&self) -> Duration {
        if self.cycles == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_time.as_nanos() / u128::from(self.cycles);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

fn tick_world(
    world: &WorldId,
    active: &mut AHashSet<BlockPos>,
    index: &mut SpatialIndex,
    host: &dyn WorldHost,
    report: &mut CycleReport,
) {
    active.retain(|pos| {
        let Some(object) = index.get_mut_at(world, *pos) else {
            report.pruned += 1;
            return false;
        };
        let rate = object.tick_rate();
        if object.is_pending_removal() || rate == 0 {
            debug!(
                target: "block_store::location",
                %world,
                %pos,
                block_type = object.block_type(),
                "ticker.removed"
            );
            report.pruned += 1;
            return false;
        }
        if !host.is_region_loaded(world, pos.region()) {
            report.skipped_unloaded += 1;
            return true;
        }

        let mut ctx = TickContext::new(world, *pos);
        object.tick(&mut ctx);
        report.ticked += 1;
        if object.ticks_lived() % u64::from(rate) == 0 {
            object.on_server_tick(&mut ctx);
            report.periodic += 1;
        }
        if ctx.is_dirty() {
            report.dirty.push(LocationKey::new(world.clone(), *pos));
        }
        true
    });
}
