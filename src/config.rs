use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mqtt::{BrokerEndpoint, ConnectOptions, DEFAULT_PORT};

const CONFIG_DIR: &str = "carlink";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_ENV: &str = "CARLINK_CONFIG";

/// Settings for the command line front end.
///
/// Only read, never written back. Every key is optional; a missing file means
/// the factory defaults of the car firmware's access point.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub device_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub reconnect_delay_ms: u64,
    pub request_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let options = ConnectOptions::default();
        Self {
            broker_host: "192.168.1.1".to_string(),
            broker_port: DEFAULT_PORT,
            device_id: "car-001".to_string(),
            username: None,
            password: None,
            keep_alive_secs: options.keep_alive.as_secs(),
            reconnect_delay_ms: options.reconnect_delay.as_millis() as u64,
            request_capacity: options.request_capacity,
        }
    }
}

impl AppConfig {
    /// Loads the config from `$CARLINK_CONFIG` or `<config_dir>/carlink/config.toml`.
    ///
    /// A missing file falls back to defaults; an unreadable or unparsable one is an error.
    pub async fn load() -> Result<Self> {
        let path = Self::config_path();

        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config file: {}", e))
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }

        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// True only when both username and password are non-empty
    pub fn has_credentials(&self) -> bool {
        matches!(
            (self.username.as_deref(), self.password.as_deref()),
            (Some(user), Some(pw)) if !user.is_empty() && !pw.is_empty()
        )
    }

    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint::new(self.broker_host.trim(), self.broker_port, self.device_id.trim())
    }

    pub fn broker_url(&self) -> String {
        self.endpoint().url()
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let options = ConnectOptions {
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            request_capacity: self.request_capacity.max(1),
            ..ConnectOptions::default()
        };

        match (&self.username, &self.password) {
            (Some(user), Some(pw)) if self.has_credentials() => options.with_credentials(user, pw),
            _ => options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.broker_url(), "tcp://192.168.1.1:1883");
        assert_eq!(config.endpoint().device_id, "car-001");
        assert!(!config.has_credentials());
        assert!(config.connect_options().credentials().is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            broker_host = "10.0.0.7"
            device_id = "car-042"
            keep_alive_secs = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.endpoint(), BrokerEndpoint::new("10.0.0.7", 1883, "car-042"));
        assert_eq!(
            config.connect_options().effective_keep_alive(),
            Duration::from_secs(5)
        );
        assert_eq!(config.connect_options().reconnect_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_credentials_need_both_values() {
        let mut config = AppConfig {
            username: Some("pilot".to_string()),
            ..AppConfig::default()
        };
        assert!(!config.has_credentials());
        assert!(config.connect_options().credentials().is_none());

        config.password = Some(String::new());
        assert!(!config.has_credentials());

        config.password = Some("secret".to_string());
        assert!(config.has_credentials());
        assert_eq!(
            config.connect_options().credentials(),
            Some(("pilot", "secret"))
        );
    }

    #[test]
    fn test_rejects_invalid_toml() {
        assert!(AppConfig::from_toml_str("broker_port = \"not a port\"").is_err());
    }
}
