//! Configuration for the location store.
//!
//! Loaded from `location_config.json` with support for an environment variable override.

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

pub const BUILTIN_LOCATION_CONFIG: &str = include_str!("data/location_config.json");

pub const LOCATION_CONFIG_ENV: &str = "LOCATION_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// How often pending changes are handed to the writer thread.
    pub save_interval_ms: u64,
    /// How long shutdown waits for the writer thread to drain.
    pub shutdown_timeout_ms: u64,
    pub database_path: PathBuf,
    /// SQLite busy timeout for both connections.
    pub busy_timeout_ms: u64,
    pub writer_thread_name: String,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            save_interval_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            database_path: PathBuf::from("blocks.db"),
            busy_timeout_ms: 5_000,
            writer_thread_name: "location-db-writer".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LocationConfigError {
    #[error("failed to parse location config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read location config from {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LocationConfig {
    pub fn builtin() -> Self {
        Self::from_json_str(BUILTIN_LOCATION_CONFIG)
            .expect("builtin location config should parse")
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, LocationConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|source| LocationConfigError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_json_str(&contents)?;
        Ok(config)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval_ms = interval.as_millis() as u64;
        self
    }
}

/// Load the location configuration from `LOCATION_CONFIG_PATH`, falling back to the builtin.
pub fn load_location_config_from_env() -> LocationConfig {
    if let Some(path) = env::var(LOCATION_CONFIG_ENV).ok().map(PathBuf::from) {
        match load_location_config_from_path(&path) {
            Ok(config) => return config,
            Err(err) => {
                tracing::warn!(
                    target: "block_store::config",
                    path = %path.display(),
                    error = %err,
                    "location_config.load_failed"
                );
            }
        }
    }

    tracing::info!(
        target: "block_store::config",
        "location_config.loaded=builtin"
    );
    LocationConfig::builtin()
}

pub fn load_location_config_from_path(path: &Path) -> Result<LocationConfig, LocationConfigError> {
    let config = LocationConfig::from_file(path)?;
    tracing::info!(
        target: "block_store::config",
        path = %path.display(),
        "location_config.loaded=file"
    );
    Ok(config)
}
