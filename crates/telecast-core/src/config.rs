//! Telecast configuration system.
//!
//! Tolerances and throughput knobs are deliberately configuration, not
//! constants — the numbers carry no meaning beyond reasonable operational
//! tolerance.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TelecastError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelecastConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

impl TelecastConfig {
    /// Load config from the default path (~/.telecast/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TelecastError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TelecastError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TelecastError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Telecast home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".telecast")
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.telecast/telecast.db".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Due-time scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Seconds between scan invocations.
    #[serde(default = "default_scan_interval")]
    pub interval_secs: u64,
    /// How far past its instant a triple is still dispatched.
    #[serde(default = "default_late_tolerance")]
    pub late_tolerance_mins: i64,
    /// How far ahead of its instant a triple may be dispatched.
    #[serde(default = "default_early_tolerance")]
    pub early_tolerance_mins: i64,
    /// Messages examined per batch; a crash loses at most one batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Work-item cap per scan run — bounds burst size.
    #[serde(default = "default_max_work_items")]
    pub max_work_items: usize,
    /// Per-item stagger applied at emission so a scan does not dump its
    /// whole backlog on the governor at once.
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    /// Single-flight lock TTL. Must exceed the worst-case scan duration.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: i64,
}

fn default_scan_interval() -> u64 {
    60
}
fn default_late_tolerance() -> i64 {
    60
}
fn default_early_tolerance() -> i64 {
    5
}
fn default_batch_size() -> usize {
    50
}
fn default_max_work_items() -> usize {
    200
}
fn default_stagger_ms() -> u64 {
    250
}
fn default_lock_ttl() -> i64 {
    300
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval(),
            late_tolerance_mins: default_late_tolerance(),
            early_tolerance_mins: default_early_tolerance(),
            batch_size: default_batch_size(),
            max_work_items: default_max_work_items(),
            stagger_ms: default_stagger_ms(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

/// Delivery worker and rate-governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of queue lanes work items are partitioned into.
    #[serde(default = "default_lane_count")]
    pub lane_count: usize,
    /// Concurrent in-flight items per lane.
    #[serde(default = "default_per_lane_concurrency")]
    pub per_lane_concurrency: usize,
    /// Governor ceiling: admitted sends per minute before backpressure.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_min: u32,
    /// Retry delays for transient failures, in seconds. Length bounds the
    /// retry count.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: Vec<u64>,
    /// Bound on one gateway call; a timeout is a transient failure.
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_secs: u64,
    /// Age after which a `sending` claim is considered abandoned.
    #[serde(default = "default_stale_claim")]
    pub stale_claim_secs: i64,
    /// Worker tasks draining the lanes.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

fn default_lane_count() -> usize {
    4
}
fn default_per_lane_concurrency() -> usize {
    2
}
fn default_rate_limit() -> u32 {
    20
}
fn default_retry_backoff() -> Vec<u64> {
    vec![30, 120, 300]
}
fn default_gateway_timeout() -> u64 {
    60
}
fn default_stale_claim() -> i64 {
    900
}
fn default_worker_count() -> usize {
    4
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            lane_count: default_lane_count(),
            per_lane_concurrency: default_per_lane_concurrency(),
            rate_limit_per_min: default_rate_limit(),
            retry_backoff_secs: default_retry_backoff(),
            gateway_timeout_secs: default_gateway_timeout(),
            stale_claim_secs: default_stale_claim(),
            worker_count: default_worker_count(),
        }
    }
}

/// Telegram gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Override the Bot API base URL (tests, self-hosted relays).
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_true() -> bool {
    true
}
fn default_api_base() -> String {
    "https://api.telegram.org".into()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            enabled: default_true(),
            api_base: default_api_base(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = TelecastConfig::default();
        assert_eq!(config.scanner.late_tolerance_mins, 60);
        assert_eq!(config.scanner.early_tolerance_mins, 5);
        assert_eq!(config.delivery.retry_backoff_secs, vec![30, 120, 300]);
        assert!(config.delivery.lane_count > 0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: TelecastConfig = toml::from_str(
            r#"
            [scanner]
            late_tolerance_mins = 90

            [telegram]
            bot_token = "123:abc"
            "#,
        )
        .unwrap();
        assert_eq!(config.scanner.late_tolerance_mins, 90);
        assert_eq!(config.scanner.early_tolerance_mins, 5);
        assert_eq!(config.telegram.bot_token, "123:abc");
        assert!(config.telegram.enabled);
        assert_eq!(config.delivery.worker_count, 4);
    }
}
