//! Configuration management for lazylimit.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LazyLimitConfig {
    /// Algorithm and parameters used for every per-key limiter
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Keyed registry configuration
    #[serde(default)]
    pub keyed: KeyedConfig,
}

/// Algorithm selection and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterConfig {
    TokenBucket(TokenBucketConfig),
    SlidingWindow(SlidingWindowConfig),
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig::TokenBucket(TokenBucketConfig::default())
    }
}

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Initial fill level, full when unset
    #[serde(default)]
    pub starting_tokens: Option<f64>,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_rate: 10.0,
            starting_tokens: None,
        }
    }
}

/// Sliding window parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Maximum amount admitted per window
    pub capacity: f64,
    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,
}

fn default_window_secs() -> f64 {
    1.0
}

/// How idle per-key limiters get scheduled for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// One background task per active key
    Task,
    /// One background task driven by a min-heap of deadlines
    #[default]
    Heap,
}

/// Keyed registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyedConfig {
    /// Seconds an idle limiter is retained before eviction
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: f64,

    /// Eviction scheduling strategy
    #[serde(default)]
    pub strategy: EvictionStrategy,
}

impl Default for KeyedConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            strategy: EvictionStrategy::default(),
        }
    }
}

fn default_grace_period() -> f64 {
    1.0
}

impl KeyedConfig {
    /// Grace period as a duration.
    pub fn grace_period(&self) -> Result<Duration> {
        if !(self.grace_period_secs.is_finite() && self.grace_period_secs >= 0.0) {
            return Err(LimiterError::Config(format!(
                "grace_period_secs must be a non-negative number, got {}",
                self.grace_period_secs
            )));
        }
        Duration::try_from_secs_f64(self.grace_period_secs).map_err(|_| {
            LimiterError::Config(format!(
                "grace_period_secs is too large, got {}",
                self.grace_period_secs
            ))
        })
    }
}

impl LazyLimitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LazyLimitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse config: {}", e)))?;
        config.keyed.grace_period()?;
        Ok(config)
    }
}
