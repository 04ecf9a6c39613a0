//! TOML configuration for the relay presence monitor
//!
//! Credentials are never stored in the file: `username_env`/`password_env`
//! name environment variables that are read when the connection is built.

use crate::presence::{PresenceEvaluator, StickinessPolicy};
use crate::protocol::{validate_topic_name, PayloadCase, TopicError, TopicLayout};
use crate::transport::mqtt::{HealthMonitor, ReconnectConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

static CHANNEL_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("channel id pattern is valid"));

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub presence: PresenceSection,
    /// Known relay channels, used for display names and history filtering
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub simulator: SimulatorSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: String,
    /// Prefix of the generated client id (a random suffix is appended)
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

impl MqttSection {
    /// Username from the configured environment variable
    pub fn username(&self) -> Option<String> {
        self.username_env.as_ref().and_then(|name| std::env::var(name).ok())
    }

    /// Password from the configured environment variable, empty when unset
    pub fn password(&self) -> String {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default()
    }
}

/// Reconnection backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Delays for the first attempts, in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    /// Delay once the pattern is exhausted, in milliseconds
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
    /// Give up after this many consecutive failed attempts (unset = never)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay_ms(),
            max_attempts: None,
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        ReconnectConfig {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

/// Topic naming
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    #[serde(default = "default_base")]
    pub base: String,
    #[serde(default = "default_presence_topic")]
    pub presence: String,
    #[serde(default = "default_status_suffix")]
    pub status_suffix: String,
    #[serde(default = "default_command_suffix")]
    pub command_suffix: String,
    /// Latency ping topic; replies arrive on `{ping}/echo`
    #[serde(default = "default_ping_topic")]
    pub ping: String,
    /// Letter case of outbound `on`/`off` payloads
    #[serde(default)]
    pub payload_case: PayloadCase,
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            base: default_base(),
            presence: default_presence_topic(),
            status_suffix: default_status_suffix(),
            command_suffix: default_command_suffix(),
            ping: default_ping_topic(),
            payload_case: PayloadCase::default(),
        }
    }
}

impl TopicsSection {
    pub fn layout(&self) -> TopicLayout {
        TopicLayout::new(
            self.base.clone(),
            self.presence.clone(),
            self.status_suffix.clone(),
            self.command_suffix.clone(),
        )
        .with_ping_topic(self.ping.clone())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_topic_name(&self.presence)?;
        validate_topic_name(&self.base)?;
        validate_topic_name(&self.ping)?;
        for (name, suffix) in [
            ("status_suffix", &self.status_suffix),
            ("command_suffix", &self.command_suffix),
        ] {
            validate_topic_name(suffix)?;
            if suffix.contains('/') {
                return Err(ConfigError::InvalidConfig(format!(
                    "topics.{name} must be a single topic level, got '{suffix}'"
                )));
            }
        }
        if self.status_suffix == self.command_suffix {
            return Err(ConfigError::InvalidConfig(
                "topics.status_suffix and topics.command_suffix must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Presence evaluation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceSection {
    /// Expected interval between device heartbeats or status publishes
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Silence after which an online device is declared offline
    /// (default: twice the heartbeat interval)
    pub timeout_secs: Option<u64>,
    /// Period of the timeout evaluation
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub stickiness: StickinessPolicy,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            timeout_secs: None,
            tick_interval_ms: default_tick_interval_ms(),
            stickiness: StickinessPolicy::default(),
        }
    }
}

impl PresenceSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn timeout_threshold(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.heartbeat_interval() * 2)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn evaluator(&self) -> PresenceEvaluator {
        PresenceEvaluator::new(self.timeout_threshold(), self.stickiness)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "presence.heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.timeout_threshold() <= self.heartbeat_interval() {
            return Err(ConfigError::InvalidConfig(format!(
                "presence.timeout_secs ({}s) must be greater than the heartbeat interval ({}s)",
                self.timeout_threshold().as_secs(),
                self.heartbeat_interval_secs
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "presence.tick_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.tick_interval() > self.timeout_threshold() / 2 {
            warn!(
                tick_interval_ms = self.tick_interval_ms,
                timeout_secs = self.timeout_threshold().as_secs(),
                "Tick interval exceeds half the timeout threshold; offline detection will lag"
            );
        }
        Ok(())
    }
}

/// One relay channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub id: String,
    /// Human-readable label
    pub name: Option<String>,
}

/// Device simulator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatorSection {
    #[serde(default = "default_simulator_client_id_prefix")]
    pub client_id_prefix: String,
    /// Payload of periodic heartbeats on the presence topic
    #[serde(default = "default_heartbeat_payload")]
    pub heartbeat_payload: String,
}

impl Default for SimulatorSection {
    fn default() -> Self {
        Self {
            client_id_prefix: default_simulator_client_id_prefix(),
            heartbeat_payload: default_heartbeat_payload(),
        }
    }
}

fn default_client_id_prefix() -> String {
    "relay-presence".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_backoff_ms() -> Vec<u64> {
    vec![250, 500, 1000, 2000]
}

fn default_sustained_delay_ms() -> u64 {
    2000
}

fn default_base() -> String {
    "smarthome".to_string()
}

fn default_presence_topic() -> String {
    "smarthome/device/esp32s2mini/presence".to_string()
}

fn default_ping_topic() -> String {
    "smarthome/device/ping".to_string()
}

fn default_status_suffix() -> String {
    "status".to_string()
}

fn default_command_suffix() -> String {
    "command".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_tick_interval_ms() -> u64 {
    2000
}

fn default_simulator_client_id_prefix() -> String {
    "relay-device".to_string()
}

fn default_heartbeat_payload() -> String {
    "heartbeat".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Invalid channel ID: {0}")]
    InvalidChannelId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_url(&self.mqtt.broker_url)?;

        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be greater than 0".to_string(),
            ));
        }

        HealthMonitor::validate_connection_config(&ReconnectConfig::from(&self.mqtt.reconnect))
            .map_err(|reason| ConfigError::InvalidConfig(format!("mqtt.reconnect: {reason}")))?;

        self.topics.validate()?;
        self.presence.validate()?;

        let mut seen = HashSet::new();
        for channel in &self.channels {
            validate_channel_id(&channel.id)?;
            if !seen.insert(channel.id.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "channel '{}' is configured more than once",
                    channel.id
                )));
            }
        }

        Ok(())
    }

    pub fn layout(&self) -> TopicLayout {
        self.topics.layout()
    }

    /// Display name of a channel, falling back to its id
    pub fn channel_name<'a>(&'a self, channel_id: &'a str) -> &'a str {
        self.channels
            .iter()
            .find(|channel| channel.id == channel_id)
            .and_then(|channel| channel.name.as_deref())
            .unwrap_or(channel_id)
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.iter().map(|channel| channel.id.clone()).collect()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[topics]
command_suffix = "perintah"

[presence]
heartbeat_interval_secs = 5

[[channels]]
id = "lampu1"
name = "Lampu Ruang Tamu"

[[channels]]
id = "stopkontak1"
name = "Stop Kontak TV"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Validate channel ID format: `[A-Za-z0-9._-]+`
pub fn validate_channel_id(channel_id: &str) -> Result<(), ConfigError> {
    if CHANNEL_ID_PATTERN.is_match(channel_id) {
        Ok(())
    } else {
        Err(ConfigError::InvalidChannelId(format!(
            "Channel ID '{channel_id}' must match pattern [A-Za-z0-9._-]+"
        )))
    }
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(broker_url)
        .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.broker_url '{broker_url}': {e}")))?;
    if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") {
        return Err(ConfigError::InvalidConfig(format!(
            "mqtt.broker_url scheme '{}' is not supported (use mqtt:// or mqtts://)",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidConfig(format!(
            "mqtt.broker_url '{broker_url}' has no host"
        )));
    }
    Ok(())
}
