//! Configuration for the broker link, telemetry ingest and identity lookup
//!
//! Stored as TOML. A missing file degrades to defaults so the console can
//! always start; a malformed file is reported instead of silently ignored.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "nodewatch";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_PORT: u16 = 1883;

/// Complete runtime configuration, passed explicitly into the service
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub telemetry: TelemetryConfig,
    pub identity: IdentityConfig,
}

/// Broker address, credentials and timing
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address, e.g. "mqtt://broker.local:1883" or "broker.local:1883"
    pub url: String,
    pub client_id: String,
    /// Empty user means anonymous login
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u64,
    /// Upper bound for a single connect attempt
    pub connect_timeout_secs: u64,
    /// Pause between recovery attempts after an established link dropped
    pub reconnect_interval_secs: u64,
    /// Request queue size of the MQTT client
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: format!("localhost:{DEFAULT_PORT}"),
            client_id: "nodewatch-console".to_string(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: 30,
            connect_timeout_secs: 30,
            reconnect_interval_secs: 5,
            channel_capacity: 100,
        }
    }
}

impl BrokerConfig {
    /// Splits `url` into host and port, tolerating an `mqtt://` or `tcp://` scheme.
    pub fn host_port(&self) -> Result<(String, u16), ConfigError> {
        let trimmed = self
            .url
            .trim()
            .trim_start_matches("mqtt://")
            .trim_start_matches("tcp://")
            .trim_end_matches('/');

        if trimmed.is_empty() {
            return Err(ConfigError::Invalid("broker url is empty".to_string()));
        }

        match trimmed.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| ConfigError::Invalid(format!("bad broker port {port:?}: {e}")))?;
                Ok((host.to_string(), port))
            }
            None => Ok((trimmed.to_string(), DEFAULT_PORT)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Topic namespace and series sizing
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Prefix shared by all topics, e.g. "CloudOTA" -> "CloudOTA/Monitoring"
    pub namespace: String,
    /// Samples retained per device
    pub series_capacity: usize,
    /// Also ingest firmware update reports
    pub update_log_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            namespace: "CloudOTA".to_string(),
            series_capacity: crate::telemetry::series::DEFAULT_CAPACITY,
            update_log_enabled: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Environment variable holding the bearer token, read on every publish
    pub token_env: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            token_env: "NODEWATCH_IDENTITY_TOKEN".to_string(),
        }
    }
}

impl Config {
    /// Default location: `<config dir>/nodewatch/config.toml`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads the file at `path`, falling back to defaults if it does not exist.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !tokio::fs::try_exists(path).await? {
            warn!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        debug!("Loaded config: {:?}", config);
        info!("Config loaded from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        info!("Config written to {}", path.display());
        Ok(())
    }

    /// Writes a default file if none exists yet, then loads it.
    pub async fn ensure_default(path: &Path) -> Result<Self, ConfigError> {
        if !tokio::fs::try_exists(path).await? {
            info!("Creating default config at {}", path.display());
            Self::default().save(path).await?;
        }
        Self::load(path).await
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.host_port()?;
        if self.telemetry.series_capacity == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.series_capacity must be at least 1".to_string(),
            ));
        }
        if self.broker.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broker.channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
