// src/config.rs
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::rabbitmq::{
    BrokerEndpoint, DeserializationMethod, QueueSubscription, SensorError,
};

pub const CONFIG_FILE_NAME: &str = "rabbitmq_queue_sensor.json";
pub const CONFIG_PATH_VAR: &str = "RABBITMQ_SENSOR_CONFIG";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sensor_config: ConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub vhost: Option<String>,
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout: u64,
    #[serde(default = "default_blocked_connection_timeout")]
    pub blocked_connection_timeout: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u64,
    pub rabbitmq_queue_sensor: QueueSensorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSensorConfig {
    pub queues: QueueList,
    #[serde(default)]
    pub deserialization_method: Option<String>,
}

/// `queues` may be written as a single name or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueList {
    One(String),
    Many(Vec<String>),
}

impl QueueList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            QueueList::One(queue) => vec![queue],
            QueueList::Many(queues) => queues,
        }
    }
}

// Default values
fn default_port() -> u16 { 5672 }
fn default_socket_timeout() -> u64 { 60 }
fn default_blocked_connection_timeout() -> u64 { 60 }
fn default_heartbeat() -> u64 { 600 }

/// Validated settings the sensor is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSettings {
    pub endpoint: BrokerEndpoint,
    pub subscriptions: Vec<QueueSubscription>,
}

impl SensorConfig {
    /// Checks the configuration and turns it into sensor settings.
    pub fn validate(&self) -> std::result::Result<SensorSettings, SensorError> {
        let cfg = &self.sensor_config;

        if cfg.host.trim().is_empty() {
            return Err(SensorError::ConfigurationError("host cannot be empty".to_string()));
        }
        if cfg.heartbeat > u64::from(u16::MAX) {
            return Err(SensorError::ConfigurationError(format!(
                "heartbeat of {}s exceeds the AMQP maximum of {}s",
                cfg.heartbeat,
                u16::MAX
            )));
        }

        let deserialization = DeserializationMethod::parse_optional(
            cfg.rabbitmq_queue_sensor.deserialization_method.as_deref(),
        )?;

        let queues = cfg.rabbitmq_queue_sensor.queues.clone().into_vec();
        if queues.is_empty() {
            return Err(SensorError::ConfigurationError(
                "at least one queue must be configured".to_string(),
            ));
        }
        if queues.iter().any(|q| q.trim().is_empty()) {
            return Err(SensorError::ConfigurationError(
                "queue names cannot be empty".to_string(),
            ));
        }

        let mut endpoint = BrokerEndpoint::new(cfg.host.clone())
            .with_port(cfg.port)
            .with_timeouts(
                Duration::from_secs(cfg.socket_timeout),
                Duration::from_secs(cfg.blocked_connection_timeout),
            )
            .with_heartbeat(Duration::from_secs(cfg.heartbeat));

        match (&cfg.username, &cfg.password) {
            (Some(username), Some(password)) => {
                endpoint = endpoint.with_credentials(username.clone(), password.clone());
            }
            (None, None) => {}
            _ => warn!("Only one of username/password is set; using the broker default account"),
        }

        if let Some(vhost) = cfg.vhost.as_ref().filter(|v| !v.is_empty()) {
            endpoint = endpoint.with_vhost(vhost.clone());
        }

        let subscriptions = queues
            .into_iter()
            .map(|queue| QueueSubscription::new(queue, deserialization))
            .collect();

        Ok(SensorSettings {
            endpoint,
            subscriptions,
        })
    }

    /// Builds a configuration from `RABBITMQ_*` environment variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
            default: T,
        ) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse()
                    .with_context(|| format!("{} has an invalid value: {}", key, value)),
                None => Ok(default),
            }
        }

        let host = lookup("RABBITMQ_HOST").ok_or_else(|| anyhow!("RABBITMQ_HOST is not set"))?;
        let queues = lookup("RABBITMQ_QUEUES").ok_or_else(|| anyhow!("RABBITMQ_QUEUES is not set"))?;

        Ok(SensorConfig {
            sensor_config: ConnectionConfig {
                host,
                port: parsed(&lookup, "RABBITMQ_PORT", default_port())?,
                username: lookup("RABBITMQ_USERNAME"),
                password: lookup("RABBITMQ_PASSWORD"),
                vhost: lookup("RABBITMQ_VHOST"),
                socket_timeout: parsed(&lookup, "RABBITMQ_SOCKET_TIMEOUT", default_socket_timeout())?,
                blocked_connection_timeout: parsed(
                    &lookup,
                    "RABBITMQ_BLOCKED_CONNECTION_TIMEOUT",
                    default_blocked_connection_timeout(),
                )?,
                heartbeat: parsed(&lookup, "RABBITMQ_HEARTBEAT", default_heartbeat())?,
                rabbitmq_queue_sensor: QueueSensorConfig {
                    queues: QueueList::Many(
                        queues
                            .split(',')
                            .map(str::trim)
                            .filter(|q| !q.is_empty())
                            .map(str::to_string)
                            .collect(),
                    ),
                    deserialization_method: lookup("RABBITMQ_DESERIALIZATION_METHOD"),
                },
            },
        })
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(explicit) = env::var(CONFIG_PATH_VAR) {
        let path = PathBuf::from(explicit);
        if path.exists() {
            debug!("Using config file from {}: {}", CONFIG_PATH_VAR, path.display());
            return Ok(path);
        }
        return Err(anyhow!("{} points to a missing file: {}", CONFIG_PATH_VAR, path.display()));
    }

    let local = Path::new(CONFIG_FILE_NAME).to_path_buf();
    let locations = [
        ("Current directory", local),
        ("Current directory (config/)", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, config/ or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config(path: &Path) -> Result<SensorConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: SensorConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    Ok(config)
}

pub fn default_config() -> SensorConfig {
    SensorConfig {
        sensor_config: ConnectionConfig {
            host: "localhost".to_string(),
            port: default_port(),
            username: Some("guest".to_string()),
            password: Some("guest".to_string()),
            vhost: None,
            socket_timeout: default_socket_timeout(),
            blocked_connection_timeout: default_blocked_connection_timeout(),
            heartbeat: default_heartbeat(),
            rabbitmq_queue_sensor: QueueSensorConfig {
                queues: QueueList::Many(vec!["queue1".to_string()]),
                deserialization_method: None,
            },
        },
    }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&default_config())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
