//! Matrix level configuration and the level registry.
//!
//! Each level of the compensation plan is a forced matrix with a fixed
//! width `w` and depth `d`. A position at that level cycles when its
//! subtree holds `w^d` descendants. All monetary amounts are integer
//! minor units (cents); percentages are whole percents applied with
//! integer division, truncating toward zero.
//!
//! # Contracts
//!
//! - Width and depth must be at least 1; `w^d` must fit in `u64`.
//! - Bonus percentages must not exceed 100.
//! - Level numbers are unique within a registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on configured matrix depth. Keeps subtree walks and
/// capacity arithmetic bounded on untrusted configuration.
pub const MAX_DEPTH: u32 = 12;

/// Upper bound on configured matrix width.
pub const MAX_WIDTH: u32 = 64;

/// Errors raised while validating or querying level configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LevelError {
    /// The requested level is not present in the registry.
    #[error("unknown matrix level: {level}")]
    UnknownLevel {
        /// The level number that was requested.
        level: u32,
    },

    /// The same level number was configured twice.
    #[error("duplicate matrix level: {level}")]
    DuplicateLevel {
        /// The level number that appeared more than once.
        level: u32,
    },

    /// Width or depth is zero or exceeds the configured bounds.
    #[error("level {level} has invalid geometry: width={width}, depth={depth}")]
    InvalidGeometry {
        /// The offending level number.
        level: u32,
        /// Configured matrix width.
        width: u32,
        /// Configured matrix depth.
        depth: u32,
    },

    /// A bonus percentage exceeds 100.
    #[error("level {level} has invalid percentage {pct} for {field}")]
    InvalidPercentage {
        /// The offending level number.
        level: u32,
        /// Name of the percentage field.
        field: &'static str,
        /// The rejected value.
        pct: u32,
    },

    /// The configured price is negative.
    #[error("level {level} has negative price {price}")]
    NegativePrice {
        /// The offending level number.
        level: u32,
        /// The rejected price in minor units.
        price: i64,
    },
}

/// Configuration for a single matrix level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Level number (registry key).
    pub level: u32,

    /// Entry price in minor currency units.
    pub price: i64,

    /// Matrix width `w`: maximum direct children per position.
    pub width: u32,

    /// Matrix depth `d`: subtree depth that must fill before the
    /// position cycles.
    pub depth: u32,

    /// Flat referral bonus percentage, applied at every cascade depth
    /// unless [`Self::referral_depth_table`] overrides it.
    pub referral_bonus_pct: u32,

    /// Cycle (matrix) bonus percentage paid to a completed position's
    /// owner.
    pub matrix_bonus_pct: u32,

    /// Optional per-depth referral percentages. Index 0 is the direct
    /// sponsor (cascade depth 1). Depths beyond the table receive
    /// nothing. Empty means "flat `referral_bonus_pct` at all depths".
    #[serde(default)]
    pub referral_depth_table: Vec<u32>,

    /// Whether a completed position's owner is re-enqueued into a
    /// fresh position at the same level.
    #[serde(default)]
    pub reentry: bool,
}

impl LevelConfig {
    /// Total subtree capacity `w^d` for this level.
    ///
    /// Validated at registry construction, so this cannot overflow for
    /// configs that made it into a [`LevelRegistry`].
    #[must_use]
    pub fn capacity(&self) -> u64 {
        u64::from(self.width).saturating_pow(self.depth)
    }

    /// Referral percentage at the given cascade depth (1 = direct
    /// sponsor).
    ///
    /// Returns 0 for depth 0 and for depths beyond a configured
    /// per-depth table.
    #[must_use]
    pub fn referral_pct_at(&self, cascade_depth: u32) -> u32 {
        if cascade_depth == 0 {
            return 0;
        }
        if self.referral_depth_table.is_empty() {
            return self.referral_bonus_pct;
        }
        self.referral_depth_table
            .get(cascade_depth as usize - 1)
            .copied()
            .unwrap_or(0)
    }

    /// Referral payout in minor units at the given cascade depth.
    #[must_use]
    pub fn referral_payout(&self, cascade_depth: u32) -> i64 {
        self.price * i64::from(self.referral_pct_at(cascade_depth)) / 100
    }

    /// Flat cycle payout in minor units, paid once per completion.
    #[must_use]
    pub fn cycle_payout(&self) -> i64 {
        self.price * i64::from(self.matrix_bonus_pct) / 100
    }

    fn validate(&self) -> Result<(), LevelError> {
        if self.width == 0 || self.depth == 0 || self.width > MAX_WIDTH || self.depth > MAX_DEPTH {
            return Err(LevelError::InvalidGeometry {
                level: self.level,
                width: self.width,
                depth: self.depth,
            });
        }
        if u64::from(self.width).checked_pow(self.depth).is_none() {
            return Err(LevelError::InvalidGeometry {
                level: self.level,
                width: self.width,
                depth: self.depth,
            });
        }
        if self.price < 0 {
            return Err(LevelError::NegativePrice {
                level: self.level,
                price: self.price,
            });
        }
        if self.referral_bonus_pct > 100 {
            return Err(LevelError::InvalidPercentage {
                level: self.level,
                field: "referral_bonus_pct",
                pct: self.referral_bonus_pct,
            });
        }
        if self.matrix_bonus_pct > 100 {
            return Err(LevelError::InvalidPercentage {
                level: self.level,
                field: "matrix_bonus_pct",
                pct: self.matrix_bonus_pct,
            });
        }
        if let Some(&pct) = self.referral_depth_table.iter().find(|&&p| p > 100) {
            return Err(LevelError::InvalidPercentage {
                level: self.level,
                field: "referral_depth_table",
                pct,
            });
        }
        Ok(())
    }
}

/// Validated, immutable collection of level configurations.
///
/// Built once at startup from the engine configuration; lookups during
/// queue processing go through [`Self::get`] so an entry referencing a
/// missing level fails with a typed error instead of a panic.
#[derive(Debug, Clone)]
pub struct LevelRegistry {
    levels: BTreeMap<u32, LevelConfig>,
}

impl LevelRegistry {
    /// Builds a registry, rejecting duplicate levels and invalid
    /// per-level configuration (fail-closed).
    ///
    /// # Errors
    ///
    /// Returns the first [`LevelError`] encountered.
    pub fn new(configs: Vec<LevelConfig>) -> Result<Self, LevelError> {
        let mut levels = BTreeMap::new();
        for cfg in configs {
            cfg.validate()?;
            let level = cfg.level;
            if levels.insert(level, cfg).is_some() {
                return Err(LevelError::DuplicateLevel { level });
            }
        }
        Ok(Self { levels })
    }

    /// Looks up a level's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LevelError::UnknownLevel`] if the level is not
    /// configured.
    pub fn get(&self, level: u32) -> Result<&LevelConfig, LevelError> {
        self.levels
            .get(&level)
            .ok_or(LevelError::UnknownLevel { level })
    }

    /// Returns all configured levels in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &LevelConfig> {
        self.levels.values()
    }

    /// Number of configured levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Whether the registry holds no levels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}
