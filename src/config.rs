//! Configuration using Figment
//!
//! Configuration is layered, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `ISPAIC_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! ISPAIC_SIZING__RESULT_CACHE_LEN=8
//! ISPAIC_SIZING__STATS_SLOTS=4
//! ISPAIC_LOGGING__LEVEL=debug
//! ISPAIC_LOGGING__FORMAT=json
//! ```
//!
//! # Example
//!
//! ```no_run
//! use isp_aic::config::AicConfig;
//!
//! let config = AicConfig::load_from("aic.toml")?;
//! println!("Result cache: {} frames", config.sizing.result_cache_len);
//! # Ok::<(), isp_aic::AicError>(())
//! ```

use crate::context::ContextSizing;
use crate::error::{AicError, AicResult};
use crate::limits::{
    DEFAULT_RESULT_CACHE_LEN, DEFAULT_STATS_GRID_DIMENSION, DEFAULT_STATS_SLOTS, MAX_CONTEXTS,
    MAX_GROUPS, MAX_RESULT_CACHE_LEN, MAX_STATS_GRID_DIMENSION, MAX_STATS_SLOTS,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ISPAIC_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AicConfig {
    /// Capacities of the bounded structures
    #[serde(default)]
    pub sizing: SizingConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Capacities, fixed for the lifetime of a context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Frames kept in the result cache (N)
    #[serde(default = "default_result_cache_len")]
    pub result_cache_len: usize,
    /// Statistics slots per context (L)
    #[serde(default = "default_stats_slots")]
    pub stats_slots: usize,
    /// Kernel groups per context (G)
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,
    /// Contexts per directory (S)
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,
    /// Largest statistics grid width
    #[serde(default = "default_stats_dimension")]
    pub max_stats_width: u32,
    /// Largest statistics grid height
    #[serde(default = "default_stats_dimension")]
    pub max_stats_height: u32,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            result_cache_len: default_result_cache_len(),
            stats_slots: default_stats_slots(),
            max_groups: default_max_groups(),
            max_contexts: default_max_contexts(),
            max_stats_width: default_stats_dimension(),
            max_stats_height: default_stats_dimension(),
        }
    }
}

impl SizingConfig {
    /// Per-context part of the sizing.
    #[must_use]
    pub fn context_sizing(&self) -> ContextSizing {
        ContextSizing {
            result_cache_len: self.result_cache_len,
            stats_slots: self.stats_slots,
            max_groups: self.max_groups,
            max_stats_width: self.max_stats_width,
            max_stats_height: self.max_stats_height,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_result_cache_len() -> usize {
    DEFAULT_RESULT_CACHE_LEN
}

fn default_stats_slots() -> usize {
    DEFAULT_STATS_SLOTS
}

fn default_max_groups() -> usize {
    MAX_GROUPS
}

fn default_max_contexts() -> usize {
    MAX_CONTEXTS
}

fn default_stats_dimension() -> u32 {
    DEFAULT_STATS_GRID_DIMENSION
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AicConfig {
    /// Load defaults overridden by `ISPAIC_` environment variables.
    pub fn load() -> AicResult<Self> {
        Self::extract(Self::figment(None, ENV_PREFIX))
    }

    /// Load defaults, then `path`, then `ISPAIC_` environment variables.
    ///
    /// A missing file is not an error; the file layer is simply empty.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AicResult<Self> {
        Self::extract(Self::figment(Some(path.as_ref()), ENV_PREFIX))
    }

    /// The layered provider stack, for callers that add their own layers.
    #[must_use]
    pub fn figment(path: Option<&Path>, env_prefix: &str) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(env_prefix).split("__"))
    }

    /// Extract and validate.
    pub fn extract(figment: Figment) -> AicResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Every capacity is at least 1 and within the hard limits
    /// - Statistics grid fits the hard limit
    /// - Log level is valid
    pub fn validate(&self) -> AicResult<()> {
        let s = &self.sizing;
        let capacities = [
            ("result_cache_len", s.result_cache_len, MAX_RESULT_CACHE_LEN),
            ("stats_slots", s.stats_slots, MAX_STATS_SLOTS),
            ("max_groups", s.max_groups, MAX_GROUPS),
            ("max_contexts", s.max_contexts, MAX_CONTEXTS),
        ];
        for (name, value, limit) in capacities {
            if value == 0 || value > limit {
                return Err(AicError::Configuration(format!(
                    "Invalid {name} {value}. Must be 1-{limit}"
                )));
            }
        }

        for (name, value) in [
            ("max_stats_width", s.max_stats_width),
            ("max_stats_height", s.max_stats_height),
        ] {
            if value == 0 || value > MAX_STATS_GRID_DIMENSION {
                return Err(AicError::Configuration(format!(
                    "Invalid {name} {value}. Must be 1-{MAX_STATS_GRID_DIMENSION}"
                )));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(AicError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }
}
