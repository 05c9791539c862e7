// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Configuration for the posting rate limiter.
//!
//! Default values reproduce the limits enforced by the legacy news
//! server filter. Every field can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Configuration for the posting rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address for `serve` mode (default: 127.0.0.1:8119)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Admission rule thresholds
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retention sweeper configuration
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Thresholds for the four admission rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum seconds between two posts with the same fingerprint (default: 300)
    #[serde(default = "default_content_window_secs")]
    pub content_window_secs: i64,

    /// Minimum seconds between two posts by the same user (default: 60)
    #[serde(default = "default_identity_window_secs")]
    pub identity_window_secs: i64,

    /// Maximum accepted posts per user per hourly window (default: 50)
    #[serde(default = "default_hourly_cap")]
    pub hourly_cap: u32,

    /// Length of the hourly quota window in seconds (default: 3600)
    #[serde(default = "default_hourly_window_secs")]
    pub hourly_window_secs: i64,

    /// Number of groups above which a post counts as a cross-post (default: 3)
    #[serde(default = "default_cross_post_threshold")]
    pub cross_post_threshold: usize,

    /// Minimum seconds between cross-posts of the same fingerprint (default: 1800)
    #[serde(default = "default_cross_post_window_secs")]
    pub cross_post_window_secs: i64,

    /// Age after which a counter is expired and swept (default: 86400)
    #[serde(default = "default_retention_secs")]
    pub retention_secs: i64,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding the content, identity and journal namespaces
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Maximum time to wait for a key lock, in milliseconds (default: 2000)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

/// Retention sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Run a sweep after every accepted submission (default: true)
    #[serde(default = "default_true")]
    pub sweep_on_accept: bool,

    /// Interval between background sweeps in `serve` mode (default: 300)
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,

    /// How long the sweeper waits for a busy key before skipping it (default: 50)
    #[serde(default = "default_sweep_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics endpoint path (default: /metrics)
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

// Default value functions
fn default_bind_addr() -> String {
    "127.0.0.1:8119".to_string()
}

fn default_content_window_secs() -> i64 {
    300
}

fn default_identity_window_secs() -> i64 {
    60
}

fn default_hourly_cap() -> u32 {
    50
}

fn default_hourly_window_secs() -> i64 {
    3600
}

fn default_cross_post_threshold() -> usize {
    3
}

fn default_cross_post_window_secs() -> i64 {
    1800
}

fn default_retention_secs() -> i64 {
    86400
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/news/spam/nnrpd/ratelimit")
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_sweep_lock_timeout_ms() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            sweeper: SweeperConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            content_window_secs: default_content_window_secs(),
            identity_window_secs: default_identity_window_secs(),
            hourly_cap: default_hourly_cap(),
            hourly_window_secs: default_hourly_window_secs(),
            cross_post_threshold: default_cross_post_threshold(),
            cross_post_window_secs: default_cross_post_window_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_on_accept: default_true(),
            interval_secs: default_sweep_interval_secs(),
            lock_timeout_ms: default_sweep_lock_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_metrics_path(),
        }
    }
}

impl StoreConfig {
    /// Get the lock acquisition timeout
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl SweeperConfig {
    /// Get the background sweep interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Get the per-key lock timeout used while sweeping
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(dir) = lookup("STATE_DIR") {
            config.store.state_dir = PathBuf::from(dir);
        }

        let limits = &mut config.rate_limit;
        parse_var(&lookup, "CONTENT_WINDOW_SECS", &mut limits.content_window_secs)?;
        parse_var(&lookup, "IDENTITY_WINDOW_SECS", &mut limits.identity_window_secs)?;
        parse_var(&lookup, "HOURLY_CAP", &mut limits.hourly_cap)?;
        parse_var(&lookup, "CROSS_POST_THRESHOLD", &mut limits.cross_post_threshold)?;
        parse_var(&lookup, "CROSS_POST_WINDOW_SECS", &mut limits.cross_post_window_secs)?;
        parse_var(&lookup, "RETENTION_SECS", &mut limits.retention_secs)?;

        parse_var(&lookup, "LOCK_TIMEOUT_MS", &mut config.store.lock_timeout_ms)?;
        parse_var(&lookup, "SWEEP_ON_ACCEPT", &mut config.sweeper.sweep_on_accept)?;
        parse_var(&lookup, "SWEEP_INTERVAL_SECS", &mut config.sweeper.interval_secs)?;
        parse_var(&lookup, "METRICS_ENABLED", &mut config.metrics.enabled)?;

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup(var) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value })?;
    }
    Ok(())
}
