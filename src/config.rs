//! Engine and storage configuration, persisted as TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working in-memory engine.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::IdMode;
use crate::template::DEFAULT_TICK_INTERVAL;

/// Errors from loading or saving configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(multiblock::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(multiblock::config::parse),
        help("Check the TOML syntax and field names in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(multiblock::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Storage service tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Seconds between background flushes.
    pub flush_interval_secs: u64,
    /// Upper bound on the graceful drain at shutdown.
    pub shutdown_timeout_ms: u64,
    /// Pending writes a single store accepts before rejecting more.
    pub max_pending_writes: usize,
    /// Consecutive failed flushes before a store is disabled.
    pub max_consecutive_failures: u32,
    pub id_mode: IdMode,
    /// Log lenient identifier rewrites.
    pub log_normalization: bool,
    /// Recorded in every envelope this process writes.
    pub producer_id: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
            shutdown_timeout_ms: 5_000,
            max_pending_writes: 10_000,
            max_consecutive_failures: 3,
            id_mode: IdMode::Lenient,
            log_normalization: true,
            producer_id: "multiblock".into(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for the redb database. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Directory of `*.toml` template definitions loaded at startup.
    pub templates_dir: Option<PathBuf>,
    /// Tick interval for templates that do not declare one.
    pub default_tick_interval: u32,
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            templates_dir: None,
            default_tick_interval: DEFAULT_TICK_INTERVAL,
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// In-memory configuration with defaults.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Defaults with a persistent data directory.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Default::default()
        }
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Save to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}
