//! Configuration management
//!
//! Paths of the instance root, datastore, rule directory and observation log,
//! plus the detection schedule and datastore lock wait.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// File locations
    #[serde(default)]
    pub paths: PathsConfig,
    /// Detection schedule
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Datastore settings
    #[serde(default)]
    pub store: StoreConfig,
}

/// File locations; unset entries derive from the instance root
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root that installed capabilities are confined to
    #[serde(default)]
    pub instance_root: Option<PathBuf>,
    /// SQLite database file
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// Directory of detector rule YAML files
    #[serde(default)]
    pub rules_dir: Option<PathBuf>,
    /// Append-only JSONL observation log
    #[serde(default)]
    pub observations: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum minutes between periodic detection runs
    #[serde(default = "default_periodic_minutes")]
    pub periodic_minutes: i64,
    /// Maximum observations considered per pass
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

fn default_periodic_minutes() -> i64 {
    30
}

fn default_batch_limit() -> usize {
    100
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            periodic_minutes: default_periodic_minutes(),
            batch_limit: default_batch_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bounded wait for the database write lock (milliseconds)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it when absent
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent().context("Config path has no parent")?;
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn instance_root(&self) -> Result<PathBuf> {
        match &self.paths.instance_root {
            Some(root) => Ok(root.clone()),
            None => data_dir(),
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        self.resolve(&self.paths.database, "capsmith.db")
    }

    pub fn rules_dir(&self) -> Result<PathBuf> {
        self.resolve(&self.paths.rules_dir, "rules")
    }

    pub fn observations_path(&self) -> Result<PathBuf> {
        self.resolve(&self.paths.observations, "observations.jsonl")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.store.lock_timeout_ms)
    }

    fn resolve(&self, configured: &Option<PathBuf>, default_name: &str) -> Result<PathBuf> {
        match configured {
            Some(path) => Ok(path.clone()),
            None => Ok(self.instance_root()?.join(default_name)),
        }
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("dev", "capsmith", "capsmith")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("dev", "capsmith", "capsmith")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}
