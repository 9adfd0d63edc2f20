//! TOML configuration for the telemetry client
//!
//! Only `[device] id` is required; every other field has a default. The
//! device secret is never stored in the file: `password_env` names the
//! environment variable it is read from at runtime.

use crate::reconnect::{ExhaustionPolicy, ReconnectConfig};
use crate::transport::{BrokerEndpoint, Credential, Qos, SelectorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PRIMARY_PORT: u16 = 14567;
const DEFAULT_SECONDARY_PORT: u16 = 8884;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub resumption: ResumptionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Environment variable holding the device password
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

fn default_password_env() -> String {
    "DEVICE_PASSWORD".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    #[serde(default = "default_primary_url")]
    pub primary_url: String,
    #[serde(default = "default_secondary_url")]
    pub secondary_url: String,
    #[serde(default = "default_primary_timeout_ms")]
    pub primary_timeout_ms: u64,
    #[serde(default = "default_secondary_timeout_ms")]
    pub secondary_timeout_ms: u64,
    /// PEM CA chain used by both transports
    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            primary_url: default_primary_url(),
            secondary_url: default_secondary_url(),
            primary_timeout_ms: default_primary_timeout_ms(),
            secondary_timeout_ms: default_secondary_timeout_ms(),
            ca_path: default_ca_path(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

fn default_primary_url() -> String {
    "mqtt-quic://mqtt.tesaiot.com:14567".to_string()
}

fn default_secondary_url() -> String {
    "mqtts://mqtt.tesaiot.com:8884".to_string()
}

fn default_primary_timeout_ms() -> u64 {
    5_000
}

fn default_secondary_timeout_ms() -> u64 {
    10_000
}

fn default_ca_path() -> PathBuf {
    PathBuf::from("ca-chain.pem")
}

fn default_keep_alive_secs() -> u16 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub on_exhausted: ExhaustionPolicy,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            on_exhausted: ExhaustionPolicy::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishSection {
    /// `{device_id}` is replaced with the device identifier
    #[serde(default = "default_topic_template")]
    pub topic_template: String,
    #[serde(default = "default_qos")]
    pub qos: Qos,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_fanout")]
    pub max_fanout: usize,
    /// Every Nth cycle publishes per-sensor topics in parallel; 0 disables
    #[serde(default = "default_parallel_every")]
    pub parallel_every: u64,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            topic_template: default_topic_template(),
            qos: default_qos(),
            interval_ms: default_interval_ms(),
            max_fanout: default_max_fanout(),
            parallel_every: default_parallel_every(),
        }
    }
}

fn default_topic_template() -> String {
    "device/{device_id}/telemetry/sensors".to_string()
}

fn default_qos() -> Qos {
    Qos::AtLeastOnce
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_max_fanout() -> usize {
    crate::publisher::DEFAULT_MAX_FANOUT
}

fn default_parallel_every() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Enables the HTTP health server when set
    pub http_port: Option<u16>,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            http_port: None,
        }
    }
}

fn default_health_interval_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumptionSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ticket_path")]
    pub path: PathBuf,
}

impl Default for ResumptionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_ticket_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ticket_path() -> PathBuf {
    PathBuf::from(".session_ticket.bin")
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
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TelemetryConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TelemetryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;
        self.primary_endpoint()?;
        self.secondary_endpoint()?;

        if self.transport.primary_timeout_ms == 0 || self.transport.secondary_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport timeouts must be greater than 0".to_string(),
            ));
        }
        if self.publish.max_fanout == 0 {
            return Err(ConfigError::InvalidConfig(
                "publish.max_fanout must be at least 1".to_string(),
            ));
        }
        if self.publish.interval_ms == 0 || self.health.interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "publish and health intervals must be greater than 0".to_string(),
            ));
        }
        self.reconnect_config()
            .validate()
            .map_err(ConfigError::InvalidConfig)
    }

    pub fn primary_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        BrokerEndpoint::parse(&self.transport.primary_url, DEFAULT_PRIMARY_PORT)
            .map_err(ConfigError::InvalidEndpoint)
    }

    pub fn secondary_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        BrokerEndpoint::parse(&self.transport.secondary_url, DEFAULT_SECONDARY_PORT)
            .map_err(ConfigError::InvalidEndpoint)
    }

    /// Read the device secret from the configured environment variable
    pub fn credential(&self) -> Result<Credential, ConfigError> {
        std::env::var(&self.device.password_env)
            .map(Credential::new)
            .map_err(|_| ConfigError::EnvVarNotFound(self.device.password_env.clone()))
    }

    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            primary_timeout: Duration::from_millis(self.transport.primary_timeout_ms),
            secondary_timeout: Duration::from_millis(self.transport.secondary_timeout_ms),
        }
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: self.reconnect.max_attempts,
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            on_exhausted: self.reconnect.on_exhausted,
        }
    }

    pub fn telemetry_topic(&self) -> String {
        crate::publisher::render_topic(&self.publish.topic_template, &self.device.id)
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        toml::from_str(
            r#"
[device]
id = "test-device"
"#,
        )
        .expect("Test config should parse")
    }
}

/// Device IDs end up in topics and client identifiers
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
