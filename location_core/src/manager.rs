//! The location manager ties the in-memory index to the database.
//!
//! Every mutation lands in the [`SpatialIndex`] immediately and in the
//! [`PendingChanges`] log; [`LocationManager::flush`] resolves the log against
//! the live objects and queues the result for the writer thread. All methods
//! run on the simulation thread.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use location_schema::{
    BlockChange, BlockRow, ChangeOp, ChangeRecord, LocationKey, RegionPos, WorldId,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::LocationConfig;
use crate::index::SpatialIndex;
use crate::metrics::LocationMetrics;
use crate::object::{
    validate_type_id, ConstructError, TypeIdError, TypeRegistry, WorldHost, WorldObject,
};
use crate::pending::PendingChanges;
use crate::store::{BlockStore, StoreError};
use crate::ticker::{CycleReport, TickScheduler};
use crate::writer::{spawn_writer, WriterCounters, WriterHandle};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("{key} is already occupied by a `{existing}` block")]
    Occupied { key: LocationKey, existing: String },
    #[error("no block is registered at {0}")]
    Vacant(LocationKey),
    #[error("cannot register a block at {key}: {source}")]
    InvalidType {
        key: LocationKey,
        #[source]
        source: TypeIdError,
    },
}

#[derive(Debug, Error)]
pub enum LocationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    TypeId(#[from] TypeIdError),
}

/// Result of [`LocationManager::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Whether the writer finished draining within the configured timeout.
    pub drained: bool,
    pub writer: WriterCounters,
}

pub struct LocationManager {
    config: LocationConfig,
    index: SpatialIndex,
    pending: PendingChanges,
    ticker: TickScheduler,
    registry: TypeRegistry,
    deferred: BTreeSet<String>,
    /// Stored rows of deferred types, by position. Nothing may be placed on them.
    reserved: AHashMap<LocationKey, String>,
    reader: BlockStore,
    writer: WriterHandle,
    save_interval: Duration,
    last_save: Instant,
    flushes: u64,
}

impl LocationManager {
    /// Opens the database named in `config` and starts the writer thread.
    ///
    /// Fails if the database cannot be opened; the caller should then disable
    /// everything that depends on stored blocks.
    pub fn open(config: LocationConfig, registry: TypeRegistry) -> Result<Self, StoreError> {
        let path = config.database_path.clone();
        let open = || BlockStore::open(&path, config.busy_timeout());
        let (writer_store, reader) = match open().and_then(|w| Ok((w, open()?))) {
            Ok(stores) => stores,
            Err(err) => {
                error!(
                    target: "block_store::location",
                    path = %path.display(),
                    error = %err,
                    "location_manager.open_failed"
                );
                return Err(err);
            }
        };
        let writer = spawn_writer(writer_store, &config.writer_thread_name)?;

        info!(
            target: "block_store::location",
            path = %path.display(),
            save_interval_ms = config.save_interval_ms,
            "location_manager.opened"
        );

        Ok(Self {
            save_interval: config.save_interval(),
            config,
            index: SpatialIndex::new(),
            pending: PendingChanges::new(),
            ticker: TickScheduler::new(),
            registry,
            deferred: BTreeSet::new(),
            reserved: AHashMap::new(),
            reader,
            writer,
            last_save: Instant::now(),
            flushes: 0,
        })
    }

    pub fn config(&self) -> &LocationConfig {
        &self.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Registers a block at `key`.
    ///
    /// `is_placing` is true for a freshly placed block, which is queued for
    /// insertion; blocks loaded from the database are already stored.
    pub fn register(
        &mut self,
        key: LocationKey,
        mut object: Box<dyn WorldObject>,
        is_placing: bool,
    ) -> Result<(), RegisterError> {
        if let Err(source) = validate_type_id(object.block_type()) {
            warn!(
                target: "block_store::location",
                %key,
                error = %source,
                "register.rejected=invalid_type"
            );
            return Err(RegisterError::InvalidType { key, source });
        }
        if let Some(existing) = self.occupant(&key) {
            warn!(
                target: "block_store::location",
                %key,
                existing = %existing,
                rejected = object.block_type(),
                "register.rejected=occupied"
            );
            return Err(RegisterError::Occupied { key, existing });
        }

        object.bind_location(key.clone());
        if let Err(rejected) = self.index.put(&key, object) {
            return Err(RegisterError::Occupied {
                existing: rejected.block_type().to_string(),
                key,
            });
        }

        let mut tick_rate = 0;
        if let Some(object) = self.index.get_mut(&key) {
            object.on_registered(&key, is_placing);
            tick_rate = object.tick_rate();
        }
        if is_placing {
            self.pending.record(ChangeOp::Insert, &key);
        }
        if tick_rate > 0 {
            self.ticker.add(&key);
        }

        debug!(
            target: "block_store::location",
            %key,
            is_placing,
            tick_rate,
            "location.registered"
        );
        Ok(())
    }

    /// Queues the current state of the block at `key` to be saved.
    pub fn update(&mut self, key: &LocationKey) -> bool {
        if !self.index.contains(key) {
            warn!(
                target: "block_store::location",
                %key,
                "update.ignored=vacant"
            );
            return false;
        }
        self.pending.record(ChangeOp::Update, key);
        true
    }

    /// Removes the block at `key` and queues its deletion.
    ///
    /// Unregistering an empty location only logs a warning.
    pub fn unregister(&mut self, key: &LocationKey) -> Option<Box<dyn WorldObject>> {
        let Some(object) = self.index.get_mut(key) else {
            warn!(
                target: "block_store::location",
                %key,
                "unregister.ignored=vacant"
            );
            return None;
        };
        object.on_unregistered(key);
        self.pending.record(ChangeOp::Delete, key);
        let removed = self.index.remove(key);
        self.ticker.remove(key);

        debug!(target: "block_store::location", %key, "location.unregistered");
        removed
    }

    /// Moves the block at `from` to `to`, which must be vacant.
    pub fn move_object(&mut self, from: &LocationKey, to: &LocationKey) -> Result<(), RegisterError> {
        if from == to {
            return Ok(());
        }
        if let Some(existing) = self.occupant(to) {
            warn!(
                target: "block_store::location",
                %from,
                %to,
                existing = %existing,
                "move.rejected=occupied"
            );
            return Err(RegisterError::Occupied {
                key: to.clone(),
                existing,
            });
        }
        let Some(mut object) = self.index.remove(from) else {
            warn!(
                target: "block_store::location",
                %from,
                %to,
                "move.rejected=vacant"
            );
            return Err(RegisterError::Vacant(from.clone()));
        };

        self.pending.record(ChangeOp::Delete, from);
        let was_ticking = self.ticker.remove(from);

        object.bind_location(to.clone());
        let tick_rate = object.tick_rate();
        self.pending.record(ChangeOp::Insert, to);
        if let Err(rejected) = self.index.put(to, object) {
            error!(
                target: "block_store::location",
                %to,
                block_type = rejected.block_type(),
                "move.lost_block"
            );
            return Err(RegisterError::Occupied {
                key: to.clone(),
                existing: rejected.block_type().to_string(),
            });
        }
        if was_ticking || tick_rate > 0 {
            self.ticker.add(to);
        }

        debug!(target: "block_store::location", %from, %to, "location.moved");
        Ok(())
    }

    pub fn get(&self, key: &LocationKey) -> Option<&dyn WorldObject> {
        self.index.get(key)
    }

    pub fn get_mut(&mut self, key: &LocationKey) -> Option<&mut dyn WorldObject> {
        self.index.get_mut(key)
    }

    /// The block at `key`, if there is one and it is a `T`.
    pub fn get_as<T: WorldObject>(&self, key: &LocationKey) -> Option<&T> {
        self.index.get(key)?.downcast_ref::<T>()
    }

    pub fn list_all(&self, world: &WorldId) -> Vec<&dyn WorldObject> {
        self.index.list_all(world)
    }

    pub fn list_sorted(&self, world: &WorldId) -> Vec<&dyn WorldObject> {
        self.index.list_sorted(world)
    }

    pub fn list_in_region(&self, world: &WorldId, region: RegionPos) -> Vec<&dyn WorldObject> {
        self.index.list_in_region(world, region)
    }

    pub fn is_world_loaded(&self, world: &WorldId) -> bool {
        self.index.has_world(world)
    }

    pub fn pending_op(&self, key: &LocationKey) -> Option<ChangeOp> {
        self.pending.get(key)
    }

    /// Hands every pending change to the writer, followed by a commit marker.
    ///
    /// Returns the number of block changes queued.
    pub fn flush(&mut self) -> usize {
        self.last_save = Instant::now();
        if self.pending.is_empty() {
            return 0;
        }

        let mut queued = 0;
        for (key, op) in self.pending.drain() {
            let state = self
                .index
                .get(&key)
                .map(|object| (object.block_type().to_string(), object.freeze()));
            let change = match state {
                Some((block_type, data)) => BlockChange::new(op, key).with_state(block_type, data),
                None if op == ChangeOp::Delete => BlockChange::new(op, key),
                None => {
                    error!(
                        target: "block_store::location",
                        %key,
                        %op,
                        "flush.skipped=missing_block"
                    );
                    continue;
                }
            };
            if self.writer.send(ChangeRecord::Apply(change)) {
                queued += 1;
            }
        }
        self.writer.send(ChangeRecord::Commit);
        self.flushes += 1;

        debug!(
            target: "block_store::location",
            queued,
            backlog = self.writer.queue_len(),
            "location.flushed"
        );
        queued
    }

    /// Runs one simulation cycle and saves if the save interval has elapsed.
    pub fn tick(&mut self, host: &dyn WorldHost) -> CycleReport {
        let report = self.ticker.run_cycle(&mut self.index, host);
        for key in &report.dirty {
            self.pending.record(ChangeOp::Update, key);
        }
        if self.last_save.elapsed() >= self.save_interval {
            self.flush();
        }
        report
    }

    /// Loads the stored blocks of `world` unless it is already loaded.
    ///
    /// Returns the number of blocks registered.
    pub fn load_world(&mut self, world: &WorldId) -> Result<usize, StoreError> {
        if self.index.has_world(world) {
            return Ok(0);
        }
        let rows = self.reader.rows_for_world(world)?;
        self.index.ensure_world(world);
        let loaded = self.register_rows(rows, None);
        info!(
            target: "block_store::location",
            %world,
            loaded,
            "location.world_loaded"
        );
        Ok(loaded)
    }

    pub fn load_all(&mut self, host: &dyn WorldHost) -> Result<usize, StoreError> {
        let mut loaded = 0;
        for world in host.worlds() {
            loaded += self.load_world(&world)?;
        }
        Ok(loaded)
    }

    /// Loads blocks of a type that was unknown when their worlds were loaded.
    pub fn load_deferred(&mut self, type_id: &str) -> Result<usize, StoreError> {
        if !self.deferred.contains(type_id) {
            return Ok(0);
        }
        if !self.registry.contains(type_id) {
            debug!(
                target: "block_store::location",
                type_id,
                "load_deferred.skipped=no_factory"
            );
            return Ok(0);
        }

        let mut loaded = 0;
        for world in self.index.worlds() {
            let rows = self.reader.rows_for_world_type(&world, type_id)?;
            loaded += self.register_rows(rows, Some(type_id));
        }
        self.deferred.remove(type_id);
        self.reserved.retain(|_, reserved_type| reserved_type.as_str() != type_id);

        info!(
            target: "block_store::location",
            type_id,
            loaded,
            "location.deferred_loaded"
        );
        Ok(loaded)
    }

    /// Adds a block type to the registry and loads any of its blocks that were deferred.
    pub fn register_type<F>(&mut self, type_id: &str, factory: F) -> Result<usize, LocationError>
    where
        F: Fn(&str) -> Result<Box<dyn WorldObject>, String> + Send + 'static,
    {
        self.registry.register(type_id, factory)?;
        Ok(self.load_deferred(type_id)?)
    }

    pub fn deferred_types(&self) -> Vec<String> {
        self.deferred.iter().cloned().collect()
    }

    /// Saves pending changes and drops `world` from memory. Stored rows are kept.
    pub fn unload_world(&mut self, world: &WorldId) -> usize {
        self.flush();
        self.ticker.remove_world(world);
        self.reserved.retain(|key, _| &key.world != world);
        let dropped = self.index.remove_world(world).len();
        info!(
            target: "block_store::location",
            %world,
            dropped,
            "location.world_unloaded"
        );
        dropped
    }

    /// Rows currently committed for `world`.
    pub fn stored_rows(&self, world: &WorldId) -> Result<Vec<BlockRow>, StoreError> {
        self.reader.rows_for_world(world)
    }

    pub fn set_save_interval(&mut self, interval: Duration) {
        self.save_interval = interval;
    }

    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }

    pub fn average_cycle_time(&self) -> Duration {
        self.ticker.average_cycle_time()
    }

    pub fn writer_counters(&self) -> WriterCounters {
        self.writer.counters()
    }

    pub fn metrics(&self) -> LocationMetrics {
        let clamp = |d: Duration| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        LocationMetrics {
            cycles: self.ticker.cycles(),
            total_cycle_nanos: clamp(self.ticker.total_time()),
            avg_cycle_nanos: clamp(self.ticker.average_cycle_time()),
            loaded_worlds: self.index.worlds().len(),
            registered_blocks: self.index.len(),
            active_tickers: self.ticker.active_len(),
            pending_changes: self.pending.len(),
            queued_records: self.writer.queue_len(),
            flushes: self.flushes,
            deferred_types: self.deferred_types(),
            writer: self.writer.counters(),
        }
    }

    /// Saves everything, stops the writer thread and closes the database.
    ///
    /// Waits at most `shutdown_timeout_ms` for the writer to drain.
    pub fn shutdown(mut self) -> ShutdownSummary {
        let queued = self.flush();
        let timeout = self.config.shutdown_timeout();
        let drained = self.writer.shutdown(timeout);
        let writer = self.writer.counters();

        if let Err(err) = self.reader.close() {
            warn!(
                target: "block_store::location",
                error = %err,
                "location_manager.close_failed"
            );
        }
        info!(
            target: "block_store::location",
            queued,
            drained,
            applied = writer.applied,
            commits = writer.commits,
            "location_manager.shutdown"
        );
        ShutdownSummary { drained, writer }
    }

    /// Type of whatever holds `key`: a live block or a stored row of a deferred type.
    fn occupant(&self, key: &LocationKey) -> Option<String> {
        match self.index.get(key) {
            Some(existing) => Some(existing.block_type().to_string()),
            None => self.reserved.get(key).cloned(),
        }
    }

    fn register_rows(&mut self, rows: Vec<BlockRow>, wanted: Option<&str>) -> usize {
        let mut loaded = 0;
        for row in rows {
            let key = row.key();
            if wanted == Some(row.type_id.as_str()) {
                self.reserved.remove(&key);
            } else if self.deferred.contains(&row.type_id) {
                self.reserved.insert(key, row.type_id);
                continue;
            }
            match self.registry.construct(&row.type_id, &row.data) {
                Ok(object) => {
                    if self.register(key, object, false).is_ok() {
                        loaded += 1;
                    }
                }
                Err(ConstructError::UnknownType(type_id)) => {
                    debug!(
                        target: "block_store::location",
                        %type_id,
                        "load.deferred=unknown_type"
                    );
                    self.reserved.insert(key, type_id.clone());
                    self.deferred.insert(type_id);
                }
                Err(err) => {
                    error!(
                        target: "block_store::location",
                        world = %row.world,
                        x = row.pos.x,
                        y = row.pos.y,
                        z = row.pos.z,
                        error = %err,
                        "load.skipped=decode_failed"
                    );
                }
            }
        }
        loaded
    }
}
