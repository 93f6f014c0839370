//! Bridge configuration.
//!
//! A [`BridgeConfig`] is loaded from a TOML or JSON file (chosen by
//! extension), optionally patched from environment variables, and validated
//! before the bridge is built. Every field has a default so a config file
//! only needs to name what it changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::device::Protocol;
use crate::mapping::DeviceMapping;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default values.
pub mod defaults {
    pub const QUEUE_MAX_SIZE: usize = 1000;
    pub const PROCESSING_CONCURRENCY: usize = 10;
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_INITIAL_DELAY_MS: u64 = 1000;
    pub const RETRY_MAX_DELAY_MS: u64 = 10_000;
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;

    pub const MAX_COMMANDS_PER_DEVICE: u32 = 10;
    pub const MAX_COMMANDS_PER_SECOND: u32 = 100;
    pub const BURST_SIZE: u32 = 200;
    /// Per-device rate limit window.
    pub const RATE_LIMIT_WINDOW_MS: u64 = 1000;

    pub const FAILURE_THRESHOLD: u32 = 5;
    pub const RECOVERY_TIMEOUT_MS: u64 = 30_000;
    pub const HALF_OPEN_REQUESTS: u32 = 3;

    pub const BULKHEAD_MAX_CONCURRENT: usize = 10;
    pub const BULKHEAD_MAX_QUEUE: usize = 100;

    pub const RECONNECT_MAX_ATTEMPTS: u32 = 10;
    pub const RECONNECT_INITIAL_DELAY_MS: u64 = 1000;
    pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
    pub const COMMAND_TIMEOUT_MS: u64 = 5000;
    pub const DISCOVERY_TIMEOUT_MS: u64 = 30_000;

    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_KEEP_ALIVE_SECS: u64 = 30;
    pub const MQTT_BASE_TOPIC: &str = "habitat";
    pub const KNX_PORT: u16 = 3671;
}

/// Environment variable overrides.
pub mod env_vars {
    pub const QUEUE_MAX_SIZE: &str = "HABITAT_QUEUE_MAX_SIZE";
    pub const QUEUE_CONCURRENCY: &str = "HABITAT_QUEUE_CONCURRENCY";
    pub const RATE_LIMIT_PER_DEVICE: &str = "HABITAT_RATE_LIMIT_PER_DEVICE";

    /// Read and parse an environment variable, ignoring unparsable values.
    pub fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
        std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
    }
}

/// `initial * multiplier^exponent`, capped at `max`.
pub fn backoff_delay(initial_ms: u64, multiplier: f64, exponent: u32, max_ms: u64) -> Duration {
    let raw = initial_ms as f64 * multiplier.powi(exponent as i32);
    let capped = if raw.is_finite() { raw.min(max_ms as f64) } else { max_ms as f64 };
    Duration::from_millis(capped.max(0.0) as u64)
}

fn default_true() -> bool {
    true
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub adapters: HashMap<Protocol, AdapterConfig>,
    #[serde(default)]
    pub message_queue: MessageQueueConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,
    #[serde(default)]
    pub fault_tolerance: FaultToleranceConfig,
    /// Device mappings registered at startup.
    #[serde(default)]
    pub devices: Vec<DeviceMapping>,
}

impl BridgeConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("json") => Self::from_json_str(&content)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                ))
            }
        };
        info!(category = "config", path = %path.display(), adapters = config.adapters.len(), "Loaded bridge config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Register an adapter config under its own protocol.
    pub fn with_adapter(mut self, config: AdapterConfig) -> Self {
        self.adapters.insert(config.protocol(), config);
        self
    }

    pub fn with_device(mut self, mapping: DeviceMapping) -> Self {
        self.devices.push(mapping);
        self
    }

    /// Apply `HABITAT_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_vars::parsed(env_vars::QUEUE_MAX_SIZE) {
            self.message_queue.max_size = v;
        }
        if let Some(v) = env_vars::parsed(env_vars::QUEUE_CONCURRENCY) {
            self.message_queue.processing_concurrency = v;
        }
        if let Some(v) = env_vars::parsed(env_vars::RATE_LIMIT_PER_DEVICE) {
            self.rate_limiting.max_commands_per_device = v;
        }
    }

    /// The adapter config for `protocol`, if present and enabled.
    pub fn enabled_adapter(&self, protocol: &Protocol) -> Option<&AdapterConfig> {
        self.adapters.get(protocol).filter(|c| c.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let queue = &self.message_queue;
        if queue.max_size == 0 {
            return Err(ConfigError::Invalid("message_queue.max_size must be > 0".into()));
        }
        if queue.processing_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "message_queue.processing_concurrency must be > 0".into(),
            ));
        }
        if queue.retry_policy.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "message_queue.retry_policy.backoff_multiplier must be >= 1".into(),
            ));
        }

        let rate = &self.rate_limiting;
        if rate.enabled {
            if rate.max_commands_per_device == 0 {
                return Err(ConfigError::Invalid(
                    "rate_limiting.max_commands_per_device must be > 0".into(),
                ));
            }
            if rate.max_commands_per_second == 0 || rate.burst_size == 0 {
                return Err(ConfigError::Invalid(
                    "rate_limiting.max_commands_per_second and burst_size must be > 0".into(),
                ));
            }
        }

        let breaker = &self.fault_tolerance.circuit_breaker;
        if breaker.enabled && (breaker.failure_threshold == 0 || breaker.half_open_requests == 0) {
            return Err(ConfigError::Invalid(
                "circuit_breaker thresholds must be > 0".into(),
            ));
        }

        let bulkhead = &self.fault_tolerance.bulkhead;
        if bulkhead.enabled && bulkhead.max_concurrent == 0 {
            return Err(ConfigError::Invalid("bulkhead.max_concurrent must be > 0".into()));
        }

        for (protocol, adapter) in &self.adapters {
            if adapter.protocol() != *protocol {
                return Err(ConfigError::Invalid(format!(
                    "adapters.{} has settings for protocol {}",
                    protocol,
                    adapter.protocol()
                )));
            }
            if adapter.reconnect.backoff_multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "adapters.{}.reconnect.backoff_multiplier must be >= 1",
                    protocol
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if device.protocol_address.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "device {} has an empty protocol_address",
                    device.device_id
                )));
            }
            if !seen.insert(device.device_id.as_str()) {
                warn!(category = "config", device_id = %device.device_id, "Duplicate device mapping; last one wins");
            }
        }
        Ok(())
    }
}

/// Bounded command queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    pub max_size: usize,
    pub processing_concurrency: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            max_size: defaults::QUEUE_MAX_SIZE,
            processing_concurrency: defaults::PROCESSING_CONCURRENCY,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Command retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::MAX_RETRIES,
            initial_delay_ms: defaults::RETRY_INITIAL_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            backoff_multiplier: defaults::BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retries + 1`.
    pub fn delay_for(&self, retries: u32) -> Duration {
        backoff_delay(self.initial_delay_ms, self.backoff_multiplier, retries, self.max_delay_ms)
    }
}

/// Command rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Commands per device per 1000 ms window.
    pub max_commands_per_device: u32,
    /// Global token refill rate.
    pub max_commands_per_second: u32,
    /// Global token bucket capacity.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_commands_per_device: defaults::MAX_COMMANDS_PER_DEVICE,
            max_commands_per_second: defaults::MAX_COMMANDS_PER_SECOND,
            burst_size: defaults::BURST_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultToleranceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub bulkhead: BulkheadConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// Consecutive half-open successes needed to close.
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: defaults::FAILURE_THRESHOLD,
            recovery_timeout_ms: defaults::RECOVERY_TIMEOUT_MS,
            half_open_requests: defaults::HALF_OPEN_REQUESTS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Per-protocol concurrency cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    pub enabled: bool,
    pub max_concurrent: usize,
    /// Executions allowed to wait for a permit.
    pub max_queue: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: defaults::BULKHEAD_MAX_CONCURRENT,
            max_queue: defaults::BULKHEAD_MAX_QUEUE,
        }
    }
}

/// Per-protocol adapter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub timeouts: AdapterTimeouts,
    pub settings: ProtocolSettings,
}

impl AdapterConfig {
    pub fn new(settings: ProtocolSettings) -> Self {
        Self {
            enabled: true,
            reconnect: ReconnectPolicy::default(),
            timeouts: AdapterTimeouts::default(),
            settings,
        }
    }

    /// Config for a custom protocol with no settings, e.g. `"mock"`.
    pub fn custom(name: impl Into<String>) -> Self {
        Self::new(ProtocolSettings::Custom(CustomSettings {
            name: name.into(),
            params: Map::new(),
        }))
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_timeouts(mut self, timeouts: AdapterTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.settings.protocol()
    }
}

/// Reconnect policy for a failed or lost connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: defaults::RECONNECT_MAX_ATTEMPTS,
            initial_delay_ms: defaults::RECONNECT_INITIAL_DELAY_MS,
            max_delay_ms: defaults::RECONNECT_MAX_DELAY_MS,
            backoff_multiplier: defaults::BACKOFF_MULTIPLIER,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_delay_ms,
            self.backoff_multiplier,
            attempt.saturating_sub(1),
            self.max_delay_ms,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterTimeouts {
    pub connect_ms: u64,
    pub command_ms: u64,
    pub discovery_ms: u64,
}

impl Default for AdapterTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: defaults::CONNECT_TIMEOUT_MS,
            command_ms: defaults::COMMAND_TIMEOUT_MS,
            discovery_ms: defaults::DISCOVERY_TIMEOUT_MS,
        }
    }
}

impl AdapterTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery_ms)
    }
}

/// Protocol-specific settings, discriminated by `protocol`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolSettings {
    Mqtt(MqttSettings),
    Knx(KnxSettings),
    Http(HttpSettings),
    Zigbee(GenericSettings),
    Zwave(GenericSettings),
    Modbus(GenericSettings),
    Homekit(GenericSettings),
    Custom(CustomSettings),
}

impl ProtocolSettings {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Mqtt(_) => Protocol::Mqtt,
            Self::Knx(_) => Protocol::Knx,
            Self::Http(_) => Protocol::Http,
            Self::Zigbee(_) => Protocol::Zigbee,
            Self::Zwave(_) => Protocol::ZWave,
            Self::Modbus(_) => Protocol::Modbus,
            Self::Homekit(_) => Protocol::HomeKit,
            Self::Custom(custom) => Protocol::custom(custom.name.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Root of the `{base_topic}/{address}/...` topic tree.
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

fn default_mqtt_port() -> u16 {
    defaults::MQTT_PORT
}
fn default_keep_alive() -> u64 {
    defaults::MQTT_KEEP_ALIVE_SECS
}
fn default_base_topic() -> String {
    defaults::MQTT_BASE_TOPIC.to_string()
}
fn default_qos() -> u8 {
    1
}

impl MqttSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: defaults::MQTT_PORT,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: defaults::MQTT_KEEP_ALIVE_SECS,
            base_topic: defaults::MQTT_BASE_TOPIC.to_string(),
            qos: 1,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_base_topic(mut self, base_topic: impl Into<String>) -> Self {
        self.base_topic = base_topic.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnxSettings {
    #[serde(default)]
    pub gateway_host: String,
    #[serde(default = "default_knx_port")]
    pub gateway_port: u16,
    #[serde(default)]
    pub datapoints: Vec<KnxDatapoint>,
}

fn default_knx_port() -> u16 {
    defaults::KNX_PORT
}

impl KnxSettings {
    pub fn new(gateway_host: impl Into<String>) -> Self {
        Self {
            gateway_host: gateway_host.into(),
            gateway_port: defaults::KNX_PORT,
            datapoints: Vec::new(),
        }
    }

    pub fn with_datapoint(mut self, datapoint: KnxDatapoint) -> Self {
        self.datapoints.push(datapoint);
        self
    }
}

/// A KNX group address and how its payload is encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnxDatapoint {
    pub group_address: String,
    #[serde(default)]
    pub dpt: KnxDpt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl KnxDatapoint {
    pub fn new(group_address: impl Into<String>, dpt: KnxDpt) -> Self {
        Self {
            group_address: group_address.into(),
            dpt,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Supported KNX datapoint types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KnxDpt {
    /// DPT 1.001, on/off.
    #[default]
    #[serde(rename = "1.001")]
    Switch,
    /// DPT 5.001, 0..100 %.
    #[serde(rename = "5.001")]
    Percent,
    /// DPT 9.001, 2-byte float °C.
    #[serde(rename = "9.001")]
    Temperature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSettings {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl HttpSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: None,
            headers: HashMap::new(),
        }
    }
}

/// Free-form settings for protocols without a dedicated schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericSettings {
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomSettings {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}
