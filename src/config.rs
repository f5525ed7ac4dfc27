//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::cache::SweepPolicy;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::RateSpec;

/// Main configuration: cache tuning plus the limiters to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Cache sweep tuning, shared by every limiter
    #[serde(default)]
    pub cache: CacheConfig,

    /// Limiters, applied in order
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
}

/// Cache sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds between sweeps of expired counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Expired ratio at which the next sweep comes sooner, and the factor
    /// the interval shrinks by
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            decay_factor: default_decay_factor(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_decay_factor() -> f64 {
    0.5
}

/// One named limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterConfig {
    /// Unique name
    pub name: String,

    /// Rate string such as `16/3m`
    pub rate: RateSpec,

    /// How callers are told apart
    #[serde(default)]
    pub key: KeyStrategyConfig,

    /// Rejection message template; `{wait}` is replaced by the seconds to wait
    #[serde(default)]
    pub message: Option<String>,
}

/// Key strategy as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum KeyStrategyConfig {
    Ip,
    UserAgent,
    #[default]
    IpAndUserAgent,
    Headers { names: Vec<String> },
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything serde cannot: tuning knob ranges, limiter names,
    /// and key strategies.
    pub fn validate(&self) -> Result<()> {
        self.sweep_policy()?;

        let mut names = HashSet::new();
        for limiter in &self.limiters {
            if limiter.name.trim().is_empty() {
                return Err(GatekeeperError::Config(
                    "limiter name must not be empty".to_string(),
                ));
            }
            if !names.insert(limiter.name.as_str()) {
                return Err(GatekeeperError::Config(format!(
                    "duplicate limiter name '{}'",
                    limiter.name
                )));
            }
            if let KeyStrategyConfig::Headers { names: headers } = &limiter.key {
                if headers.is_empty() {
                    return Err(GatekeeperError::Config(format!(
                        "limiter '{}' keys on headers but names none",
                        limiter.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The sweep policy described by the cache section.
    pub fn sweep_policy(&self) -> Result<SweepPolicy> {
        SweepPolicy::try_from(&self.cache)
    }
}
