use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use location_schema::{BlockChange, BlockPos, BlockRow, ChangeOp, LocationKey, WorldId};
use rusqlite::{params, Connection, Row};
use thiserror::Error;
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blocks (
    world_id TEXT NOT NULL,
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    z INTEGER NOT NULL,
    type TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (world_id, x, y, z)
);
CREATE INDEX IF NOT EXISTS blocks_world_type ON blocks (world_id, type);
";

const SELECT_WORLD: &str =
    "SELECT x, y, z, type, data FROM blocks WHERE world_id = ?1 ORDER BY x, y, z";
const SELECT_WORLD_TYPE: &str =
    "SELECT x, y, z, type, data FROM blocks WHERE world_id = ?1 AND type = ?2 ORDER BY x, y, z";
const INSERT_ROW: &str = "INSERT INTO blocks (world_id, x, y, z, type, data)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
     ON CONFLICT (world_id, x, y, z) DO UPDATE SET type = excluded.type, data = excluded.data";
const UPDATE_ROW: &str =
    "UPDATE blocks SET type = ?5, data = ?6 WHERE world_id = ?1 AND x = ?2 AND y = ?3 AND z = ?4";
const DELETE_ROW: &str = "DELETE FROM blocks WHERE world_id = ?1 AND x = ?2 AND y = ?3 AND z = ?4";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open block database at {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{op} for {key} is missing the block type or data")]
    MissingState { op: ChangeOp, key: LocationKey },
    #[error("failed to spawn database writer thread: {0}")]
    WriterSpawn(#[source] io::Error),
}

/// Connection to the `blocks` table.
///
/// One instance lives on the writer thread and applies changes; a second one
/// stays with the location manager for world loads.
pub struct BlockStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl BlockStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.ensure_schema()?;
        debug!(
            target: "block_store::store",
            path = %path.display(),
            journal_mode = %mode,
            "store.opened"
        );
        Ok(store)
    }

    /// Private database that disappears when the connection closes.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        let store = Self { conn, path: None };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn rows_for_world(&self, world: &WorldId) -> Result<Vec<BlockRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(SELECT_WORLD)?;
        let rows = stmt
            .query_map(params![world.as_str()], |row| read_row(world, row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn rows_for_world_type(
        &self,
        world: &WorldId,
        type_id: &str,
    ) -> Result<Vec<BlockRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(SELECT_WORLD_TYPE)?;
        let rows = stmt
            .query_map(params![world.as_str(), type_id], |row| read_row(world, row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert(&self, key: &LocationKey, type_id: &str, data: &str) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(INSERT_ROW)?;
        stmt.execute(params![
            key.world.as_str(),
            key.pos.x,
            key.pos.y,
            key.pos.z,
            type_id,
            data
        ])?;
        Ok(())
    }

    /// Rewrites the row at `key`, creating it if the table has no row there.
    pub fn update(&self, key: &LocationKey, type_id: &str, data: &str) -> Result<(), StoreError> {
        let changed = {
            let mut stmt = self.conn.prepare_cached(UPDATE_ROW)?;
            stmt.execute(params![
                key.world.as_str(),
                key.pos.x,
                key.pos.y,
                key.pos.z,
                type_id,
                data
            ])?
        };
        if changed == 0 {
            warn!(
                target: "block_store::store",
                %key,
                "store.update_missing_row=inserting"
            );
            self.insert(key, type_id, data)?;
        }
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, key: &LocationKey) -> Result<bool, StoreError> {
        let mut stmt = self.conn.prepare_cached(DELETE_ROW)?;
        let removed = stmt.execute(params![
            key.world.as_str(),
            key.pos.x,
            key.pos.y,
            key.pos.z
        ])?;
        Ok(removed > 0)
    }

    pub fn apply(&self, change: &BlockChange) -> Result<(), StoreError> {
        match change.op {
            ChangeOp::Delete => {
                self.delete(&change.key)?;
            }
            op @ (ChangeOp::Insert | ChangeOp::Update) => {
                let (Some(type_id), Some(data)) = (&change.type_id, &change.data) else {
                    return Err(StoreError::MissingState {
                        op,
                        key: change.key.clone(),
                    });
                };
                if op == ChangeOp::Insert {
                    self.insert(&change.key, type_id, data)?;
                } else {
                    self.update(&change.key, type_id, data)?;
                }
            }
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    pub fn begin(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN DEFERRED")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Closes the connection, surfacing any error SQLite reports on close.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, err)| StoreError::Sqlite(err))
    }
}

fn read_row(world: &WorldId, row: &Row<'_>) -> rusqlite::Result<BlockRow> {
    Ok(BlockRow {
        world: world.clone(),
        pos: BlockPos::new(row.get(0)?, row.get(1)?, row.get(2)?),
        type_id: row.get(3)?,
        data: row.get(4)?,
    })
}
