//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the backend and Kimai endpoints, the last used username
//! and the offline queue limits.
//!
//! Configuration is stored at `~/.config/kimai-aggregator/config.json`.
//! The `KIMAI_AGGREGATOR_*` environment variables override the file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "kimai-aggregator";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default base URL for the backend auth endpoints (login, refresh, logout)
const DEFAULT_AUTH_URL: &str = "http://localhost:3001/api/auth";

/// Default base URL for the backend user endpoints (settings, data)
const DEFAULT_API_URL: &str = "http://localhost:3001/api";

/// Default Kimai REST API base URL
const DEFAULT_KIMAI_URL: &str = "http://localhost:8001/api";

/// HTTP request timeout in seconds.
/// A timed out request is reported as a network failure.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

const ENV_AUTH_URL: &str = "KIMAI_AGGREGATOR_AUTH_URL";
const ENV_API_URL: &str = "KIMAI_AGGREGATOR_API_URL";
const ENV_KIMAI_URL: &str = "KIMAI_AGGREGATOR_KIMAI_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth_url: String,
    pub api_url: String,
    pub kimai_url: String,
    pub last_username: Option<String>,
    pub request_timeout_secs: u64,
    /// Directory for rolling log files; logging goes to stderr only when unset
    pub log_dir: Option<PathBuf>,
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            kimai_url: DEFAULT_KIMAI_URL.to_string(),
            last_username: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            log_dir: None,
            queue: QueueConfig::default(),
        }
    }
}

impl Config {
    /// Load the config file (defaults when missing) and apply env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_AUTH_URL) {
            self.auth_url = url;
        }
        if let Ok(url) = std::env::var(ENV_API_URL) {
            self.api_url = url;
        }
        if let Ok(url) = std::env::var(ENV_KIMAI_URL) {
            self.kimai_url = url;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the session, cached Kimai data and the offline queue
    pub fn data_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

/// Limits for the offline operation queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// The single storage key the queue owns
    pub storage_key: String,
    /// A failing operation is dropped once its retry count reaches this value
    pub max_retries: u32,
    /// Entries older than this are pruned regardless of retries
    pub max_age_secs: u64,
    pub max_entries: usize,
    /// Serialized size above which only `oversize_keep` entries are kept
    pub max_bytes: usize,
    pub oversize_keep: usize,
    /// Entry count to fall back to when storage reports a quota error
    pub quota_keep: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_key: "offline_queue".to_string(),
            max_retries: 3,
            max_age_secs: 7 * 24 * 60 * 60,
            max_entries: 100,
            max_bytes: 512 * 1024,
            oversize_keep: 20,
            quota_keep: 10,
        }
    }
}

impl QueueConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"kimai_url": "https://kimai.example.com/api", "queue": {"max_entries": 5}}"#;
        let config: Config = serde_json::from_str(json).expect("parse partial config");

        assert_eq!(config.kimai_url, "https://kimai.example.com/api");
        assert_eq!(config.auth_url, DEFAULT_AUTH_URL);
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.queue.max_entries, 5);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.max_age(), Duration::from_secs(604_800));
    }
}
