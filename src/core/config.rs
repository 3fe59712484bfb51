//! Gateway configuration.
//!
//! Loaded from a TOML (or JSON) file, with every section optional and
//! defaulted so a bare `twinlink start` works against `data/`. Env
//! overrides cover the knobs that differ between deployments.

use crate::connections::client::ClientSettings;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the Twinlink gateway.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory of the per-connection event journals.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Snapshot cadence in persisted events per connection.
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshot_every: default_snapshot_every(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Automatic retries after a connect timeout or abnormal close.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retries: default_connect_retries(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Hostnames connections may never be configured against.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Largest inbound wire payload accepted for mapping.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Retained entries per connection log buffer.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            log_capacity: default_log_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_snapshot_every() -> u64 {
    20
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_connect_retries() -> u32 {
    5
}

fn default_backoff_min_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_max_payload_bytes() -> usize {
    256 * 1024
}

fn default_log_capacity() -> usize {
    200
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TWINLINK_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/twinlink.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config {}", path.display()))?;
        let mut config: Config = if is_json(path) {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path.display()))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path.display()))?
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `TWINLINK_CONFIG` (default `config/twinlink.toml`);
    /// missing file falls back to defaults.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        if path.exists() {
            Self::load(path)
        } else {
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("TWINLINK_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("TWINLINK_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
    }

    /// Schema-level invariants checked before the runtime starts.
    pub fn validate(&self) -> Result<()> {
        if self.storage.snapshot_every == 0 {
            bail!("storage.snapshot_every must be > 0");
        }
        if self.client.connect_timeout_ms == 0 {
            bail!("client.connect_timeout_ms must be > 0");
        }
        if self.client.backoff_min_ms == 0 || self.client.backoff_min_ms > self.client.backoff_max_ms
        {
            bail!("client backoff must satisfy 0 < backoff_min_ms <= backoff_max_ms");
        }
        if self.limits.max_payload_bytes == 0 {
            bail!("limits.max_payload_bytes must be > 0");
        }
        if self.limits.log_capacity == 0 {
            bail!("limits.log_capacity must be > 0");
        }
        if self.security.blocked_hosts.iter().any(|h| h.is_empty()) {
            bail!("security.blocked_hosts must not contain empty entries");
        }
        Ok(())
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            connect_timeout: Duration::from_millis(self.client.connect_timeout_ms),
            connect_retries: self.client.connect_retries,
            backoff_min: Duration::from_millis(self.client.backoff_min_ms),
            backoff_max: Duration::from_millis(self.client.backoff_max_ms),
            ack_timeout: Duration::from_millis(self.client.ack_timeout_ms),
            max_payload_bytes: self.limits.max_payload_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("data"));
        assert_eq!(config.storage.snapshot_every, 20);
        assert_eq!(config.client_settings().connect_retries, 5);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            data_dir = "/var/lib/twinlink"

            [client]
            connect_timeout_ms = 2500

            [security]
            blocked_hosts = ["169.254.169.254", "localhost"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/twinlink"));
        assert_eq!(config.client.connect_timeout_ms, 2_500);
        // Unset sections keep their defaults.
        assert_eq!(config.client.connect_retries, 5);
        assert_eq!(config.security.blocked_hosts.len(), 2);
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let config: Config = toml::from_str(
            r#"
            [client]
            backoff_min_ms = 5000
            backoff_max_ms = 100
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
