//! Bridge configuration (replica.toml)
//!
//! Two sections are recognised:
//!
//! ```toml
//! [debugging]
//! enable_debug_logs = false
//!
//! [performance]
//! enable_type_size_estimation = false
//! type_caching_limit = 600
//! member_access_caching_limit = 450
//! ```
//!
//! Missing keys fall back to their defaults. [`BridgeConfig::resolve`] turns
//! the limits into concrete cache capacities.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Smallest limit accepted for either cache family
pub const MIN_CACHE_LIMIT: usize = 100;

/// Curve constant of the type-count estimate
const ESTIMATE_SCALE: f64 = 238.0;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the file
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Full configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// Diagnostics
    #[serde(default)]
    pub debugging: DebuggingConfig,

    /// Cache sizing
    #[serde(default)]
    pub performance: PerformanceConfig,
}

/// `[debugging]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DebuggingConfig {
    /// Emit per-type and per-field debug logs
    #[serde(default)]
    pub enable_debug_logs: bool,
}

/// `[performance]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceConfig {
    /// Derive the type cache size from the number of user types
    #[serde(default)]
    pub enable_type_size_estimation: bool,

    /// Entries in the type-keyed caches
    #[serde(default = "default_type_caching_limit")]
    pub type_caching_limit: usize,

    /// Entries in the compiled accessor caches
    #[serde(default = "default_member_access_caching_limit")]
    pub member_access_caching_limit: usize,
}

fn default_type_caching_limit() -> usize {
    600
}

fn default_member_access_caching_limit() -> usize {
    450
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enable_type_size_estimation: false,
            type_caching_limit: default_type_caching_limit(),
            member_access_caching_limit: default_member_access_caching_limit(),
        }
    }
}

/// Concrete cache capacities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizes {
    /// Type-keyed caches (worthiness, type names, hooks)
    pub types: usize,
    /// Derived caches (member plans, field-by-name lookups)
    pub controlled: usize,
    /// Compiled accessors
    pub member_access: usize,
}

impl BridgeConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check if debug logs are enabled
    pub fn debug_logs(&self) -> bool {
        self.debugging.enable_debug_logs
    }

    /// Compute cache capacities for a registry holding `user_types` user types
    pub fn resolve(&self, user_types: usize) -> CacheSizes {
        let perf = &self.performance;
        let member_access = perf.member_access_caching_limit.max(MIN_CACHE_LIMIT);

        let types = if perf.enable_type_size_estimation || perf.type_caching_limit < MIN_CACHE_LIMIT {
            estimate_type_cache(user_types)
        } else {
            perf.type_caching_limit
        };

        let controlled = if types > 450 { types / 10 } else { types / 2 }.max(1);

        CacheSizes {
            types,
            controlled,
            member_access,
        }
    }
}

/// Logarithmic estimate of a useful type cache size
fn estimate_type_cache(user_types: usize) -> usize {
    let n = user_types as f64;
    let estimate = (ESTIMATE_SCALE * (1.0 + n / ESTIMATE_SCALE).ln()).floor();
    (estimate as usize).max(1)
}
