//! Engine configuration (TOML).
//!
//! ```toml
//! [engine]
//! cascade_depth = 3
//! root_policy = "global_pool"
//! scheduler_interval_secs = 60
//! stuck_after_secs = 900
//!
//! [[level]]
//! level = 1
//! price = 10000
//! width = 2
//! depth = 2
//! referral_bonus_pct = 10
//! matrix_bonus_pct = 30
//! reentry = true
//! ```
//!
//! Validation is fail-closed: a config that parses but violates level
//! invariants (zero width, percentage over 100, duplicate level)
//! refuses to start the daemon.

use std::path::Path;

use fmx_core::level::{LevelConfig, LevelError, LevelRegistry};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML failed to parse.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A level row violates a domain invariant.
    #[error("invalid level config: {0}")]
    Level(#[from] LevelError),

    /// Engine-level validation failure.
    #[error("invalid engine config: {0}")]
    Validation(String),
}

/// Where the allocator searches when the sponsor has no position at
/// the target level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootPolicy {
    /// Fall back to the level's root pool (oldest root first); a new
    /// root is only created when the pool is empty.
    #[default]
    GlobalPool,
    /// Always give a sponsorless entrant a fresh root position.
    FreshRoot,
}

/// `[engine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// How many sponsor-chain ancestors receive referral credits.
    #[serde(default = "default_cascade_depth")]
    pub cascade_depth: u32,

    /// Placement fallback when the sponsor has no tree at the level.
    #[serde(default)]
    pub root_policy: RootPolicy,

    /// Seconds between scheduler-driven queue drains.
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_secs: u64,

    /// A run holding the lock longer than this is reported stuck.
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,

    /// Entries fetched per drain iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

const fn default_cascade_depth() -> u32 {
    1
}

const fn default_scheduler_interval() -> u64 {
    60
}

const fn default_stuck_after() -> u64 {
    900
}

const fn default_batch_size() -> u32 {
    100
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cascade_depth: default_cascade_depth(),
            root_policy: RootPolicy::default(),
            scheduler_interval_secs: default_scheduler_interval(),
            stuck_after_secs: default_stuck_after(),
            batch_size: default_batch_size(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine tunables.
    #[serde(default)]
    pub engine: EngineSettings,

    /// Matrix level table.
    #[serde(default, rename = "level")]
    pub levels: Vec<LevelConfig>,
}

impl EngineConfig {
    /// Loads and validates a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on read, parse, or validation
    /// failure.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Parses and validates a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on parse or validation failure.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.levels.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [[level]] is required".to_string(),
            ));
        }
        if self.engine.cascade_depth == 0 {
            return Err(ConfigError::Validation(
                "engine.cascade_depth must be at least 1".to_string(),
            ));
        }
        if self.engine.batch_size == 0 {
            return Err(ConfigError::Validation(
                "engine.batch_size must be at least 1".to_string(),
            ));
        }
        // Level invariants are enforced by the registry constructor.
        LevelRegistry::new(self.levels.clone())?;
        Ok(())
    }

    /// Builds the validated level registry.
    ///
    /// # Errors
    ///
    /// Returns [`LevelError`] if a level row is invalid (already
    /// rejected by [`Self::from_toml`] for loaded configs).
    pub fn registry(&self) -> Result<LevelRegistry, LevelError> {
        LevelRegistry::new(self.levels.clone())
    }
}
