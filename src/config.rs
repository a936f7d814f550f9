//! Engine configuration loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointOptions;
use crate::errors::{Result, StorageError};
use crate::storage::{file::DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "LODESTONE_CONFIG";

/// Config file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "lodestone.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    File,
    Mmap,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub poll_interval_ms: u64,
    pub max_wal_bytes: u64,
    pub max_wal_entries: u64,
    pub on_shutdown: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        let defaults = CheckpointOptions::default();
        Self {
            enabled: true,
            interval_ms: defaults.interval.as_millis() as u64,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            max_wal_bytes: defaults.max_wal_bytes,
            max_wal_entries: defaults.max_wal_entries,
            on_shutdown: defaults.checkpoint_on_shutdown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log directory; logging stays unconfigured when absent.
    pub dir: Option<PathBuf>,
    pub level: Option<String>,
    pub retention: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_path: PathBuf,
    /// Defaults to `data_path` with a `.wal` extension.
    pub wal_path: Option<PathBuf>,
    pub backend: BackendKind,
    pub page_size: usize,
    /// Pages kept in the file backend's read cache.
    pub cache_capacity: usize,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("lodestone.db"),
            wal_path: None,
            backend: BackendKind::default(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: DEFAULT_CACHE_PAGES,
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Config with `data_path` set and everything else defaulted.
    #[must_use]
    pub fn for_path(data_path: impl Into<PathBuf>) -> Self {
        Self { data_path: data_path.into(), ..Self::default() }
    }

    /// # Errors
    /// `Config` when the TOML does not parse or fails validation.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s).map_err(|e| StorageError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// `Config` when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&s)
    }

    /// Loads with precedence: `explicit`, then `$LODESTONE_CONFIG`, then `./lodestone.toml`,
    /// then defaults.
    ///
    /// # Errors
    /// `Config` when a named file is missing or invalid.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::from_file(local);
        }
        Ok(Self::default())
    }

    /// # Errors
    /// `Config` for a page size that is not a power of two >= 512 or a zero interval.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(StorageError::Config(format!(
                "page_size {} must be a power of two >= {MIN_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.checkpoint.interval_ms == 0 || self.checkpoint.poll_interval_ms == 0 {
            return Err(StorageError::Config("checkpoint intervals must be non-zero".into()));
        }
        if self.data_path.as_os_str().is_empty() && self.backend != BackendKind::Memory {
            return Err(StorageError::Config("data_path is required for persistent backends".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.wal_path.clone().unwrap_or_else(|| self.data_path.with_extension("wal"))
    }

    #[must_use]
    pub const fn checkpoint_options(&self) -> CheckpointOptions {
        CheckpointOptions {
            interval: Duration::from_millis(self.checkpoint.interval_ms),
            poll_interval: Duration::from_millis(self.checkpoint.poll_interval_ms),
            max_wal_bytes: self.checkpoint.max_wal_bytes,
            max_wal_entries: self.checkpoint.max_wal_entries,
            checkpoint_on_shutdown: self.checkpoint.on_shutdown,
        }
    }
}
