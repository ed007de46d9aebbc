use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, Result};

pub const CONFIG_FILE: &str = "engine.json";

/// Engine tunables, persisted in `engine.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_secret_header")]
    pub secret_header: String,
    #[serde(default = "default_delivery_history")]
    pub delivery_history: usize,
    #[serde(default = "default_throttle_max_entries")]
    pub throttle_max_entries: usize,
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_secret_header() -> String {
    "X-Webhook-Secret".into()
}
fn default_delivery_history() -> usize {
    crate::store::DEFAULT_DELIVERY_HISTORY
}
fn default_throttle_max_entries() -> usize {
    crate::throttle::DEFAULT_MAX_ENTRIES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            secret_header: default_secret_header(),
            delivery_history: default_delivery_history(),
            throttle_max_entries: default_throttle_max_entries(),
        }
    }
}

impl EngineConfig {
    /// Load `engine.json` from `data_dir`; a missing file means defaults.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("failed to parse {CONFIG_FILE}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(EngineError::Config(
                "requestTimeoutSecs must be greater than zero".into(),
            ));
        }
        if self.secret_header.trim().is_empty() {
            return Err(EngineError::Config("secretHeader must not be empty".into()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn unit_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{ "cacheTtlSecs": 30 }"#).unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.cache_ttl_secs, 30);
        assert_eq!(config.secret_header, "X-Webhook-Secret");
    }

    #[test]
    fn regression_zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{ "requestTimeoutSecs": 0 }"#).unwrap();
        assert!(matches!(
            EngineConfig::load(dir.path()),
            Err(EngineError::Config(_))
        ));
    }
}
