//! Persistent registry for stateful blocks in a voxel world.
//!
//! [`LocationManager`] keeps every registered block in an in-memory
//! [`SpatialIndex`], ticks the ones that asked for it, and persists changes to
//! SQLite through a write-behind log drained by a dedicated writer thread.

pub mod config;
pub mod index;
pub mod log_stream;
pub mod manager;
pub mod metrics;
pub mod object;
pub mod pending;
pub mod store;
pub mod ticker;
pub mod writer;

pub use config::{
    load_location_config_from_env, load_location_config_from_path, LocationConfig,
    LocationConfigError, LOCATION_CONFIG_ENV,
};
pub use index::SpatialIndex;
pub use log_stream::{log_channel, LogEnvelope, LogForwardLayer};
pub use manager::{LocationError, LocationManager, RegisterError, ShutdownSummary};
pub use metrics::LocationMetrics;
pub use object::{
    validate_type_id, BlockFactory, ConstructError, StaticWorldHost, TickContext, TypeIdError,
    TypeRegistry, WorldHost, WorldObject,
};
pub use pending::{coalesce, PendingChanges, Transition};
pub use store::{BlockStore, StoreError};
pub use ticker::{CycleReport, TickScheduler};
pub use writer::{spawn_writer, WriterCounters, WriterHandle};

pub use location_schema::{
    BlockChange, BlockPos, BlockRow, ChangeOp, ChangeRecord, LocationKey, RegionPos, WorldId,
};
