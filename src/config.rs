//! Session configuration
//!
//! Loaded from TOML. Broker credentials are never stored in the file; the file
//! names the environment variables that hold them and they are read at
//! connect time.

use crate::session::{BackoffStrategy, OverflowPolicy, QoS, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub offline_queue: OfflineQueueSection,
    pub last_will: Option<LastWillSection>,
}

/// Client identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Fixed client identifier; generated from the prefix when absent
    pub client_id: Option<String>,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            client_id: None,
            client_id_prefix: default_client_id_prefix(),
        }
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            clean_session: true,
        }
    }
}

/// Automatic reconnection limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Upper bound for exponential backoff
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            delay_ms: default_reconnect_delay_ms(),
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Offline queue bound; unbounded when `capacity` is absent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OfflineQueueSection {
    pub capacity: Option<usize>,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Will message the broker publishes if the session dies without disconnecting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWillSection {
    /// `{client_id}` is replaced with the session's client identifier
    #[serde(default = "default_will_topic")]
    pub topic: String,
    #[serde(default = "default_will_payload")]
    pub payload: String,
    #[serde(default = "default_will_qos")]
    pub qos: QoS,
    #[serde(default = "default_true")]
    pub retain: bool,
}

impl Default for LastWillSection {
    fn default() -> Self {
        Self {
            topic: default_will_topic(),
            payload: default_will_payload(),
            qos: default_will_qos(),
            retain: true,
        }
    }
}

fn default_client_id_prefix() -> String {
    "fleet_".to_string()
}

fn default_broker_url() -> String {
    "mqtts://localhost:8883".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_will_topic() -> String {
    "clients/{client_id}/status".to_string()
}

fn default_will_payload() -> String {
    "offline".to_string()
}

fn default_will_qos() -> QoS {
    QoS::AtLeastOnce
}

fn default_true() -> bool {
    true
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.broker.url).map_err(|_| {
            ConfigError::InvalidConfig(format!("Invalid broker URL: {}", self.broker.url))
        })?;
        if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") {
            return Err(ConfigError::InvalidConfig(format!(
                "Unsupported broker scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "Broker URL has no host: {}",
                self.broker.url
            )));
        }

        if let Some(client_id) = &self.session.client_id {
            validate_client_id(client_id)?;
        } else {
            validate_client_id(&self.session.client_id_prefix)?;
        }

        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.offline_queue.capacity == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "offline_queue.capacity must be greater than 0 or omitted for unbounded"
                    .to_string(),
            ));
        }

        if self.reconnect.backoff == BackoffKind::Exponential
            && self.reconnect.max_delay_ms < self.reconnect.delay_ms
        {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must not be below reconnect.delay_ms".to_string(),
            ));
        }

        if let Some(will) = &self.last_will {
            crate::topic::validate_topic_name(&will.topic).map_err(|e| {
                ConfigError::InvalidConfig(format!("Invalid last will topic: {e}"))
            })?;
        }

        Ok(())
    }

    /// Client identifier for this session, generated once per call when not fixed
    pub fn resolve_client_id(&self) -> String {
        match &self.session.client_id {
            Some(id) => id.clone(),
            None => format!("{}{}", self.session.client_id_prefix, uuid::Uuid::new_v4()),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.broker.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.connect_timeout_secs)
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        let backoff = match self.reconnect.backoff {
            BackoffKind::Fixed => BackoffStrategy::Fixed,
            BackoffKind::Exponential => BackoffStrategy::Exponential {
                max_delay_ms: self.reconnect.max_delay_ms,
            },
        };
        ReconnectConfig {
            max_attempts: self.reconnect.max_attempts,
            delay_ms: self.reconnect.delay_ms,
            backoff,
        }
    }

    /// Read an optional environment variable; unset or non-UTF-8 values are `None`
    pub fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Default configuration pointing at the given broker
    pub fn local(url: &str) -> Self {
        let mut config = Self::default();
        config.broker.url = url.to_string();
        config
    }
}

fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidConfig(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
