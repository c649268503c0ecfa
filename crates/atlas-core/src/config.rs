//! Runtime configuration
//!
//! Builder-style configs for the scheduler and the engine, plus an
//! `AtlasConfig` aggregate that round-trips through a TOML file for
//! embedders that configure from disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scan tick interval in seconds
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

fn default_check_interval() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan tick interval
    pub fn with_check_interval(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }

    /// Tick interval as a [`Duration`]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrent collector invocations
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum duration of one collector invocation in seconds
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_run_timeout() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            run_timeout_secs: default_run_timeout(),
        }
    }
}

impl EngineConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max concurrent collector invocations
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Set the per-invocation timeout
    pub fn with_run_timeout(mut self, secs: u64) -> Self {
        self.run_timeout_secs = secs;
        self
    }

    /// Per-invocation timeout as a [`Duration`]
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// Aggregate file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasConfig {
    /// Path of the shared SQLite database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("atlas.db")
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AtlasConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config {}", path.as_ref().display()))?;
        toml::from_str(&content).context("Failed to parse config")
    }

    /// Write configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }
}
