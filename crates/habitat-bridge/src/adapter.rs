//! Protocol adapter interface for the Habitat bridge.
//!
//! Every protocol (MQTT, KNX, HTTP, ...) is driven through one
//! [`ProtocolAdapter`]. The bridge never talks to a transport directly: it
//! sends [`ProtocolCommand`]s and receives [`StateChange`]s through this
//! trait. Most adapters are a [`BaseProtocolAdapter`](crate::base::BaseProtocolAdapter)
//! wrapped around a protocol-specific driver.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use habitat_core::{
    AdapterConfig, CommandResult, DeviceCommand, DeviceMapping, DeviceState, DiscoveredDevice,
    Listener, Protocol, StateChange, Unsubscribe,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Error type for protocol adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Adapter configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Communication error
    #[error("Communication error: {0}")]
    Communication(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation timeout
    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    #[error("Adapter not connected")]
    NotConnected,

    #[error("Adapter not initialized")]
    NotInitialized,

    #[error("Adapter is disabled")]
    Disabled,

    /// Other error
    #[error("Adapter error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Adapter connection status.
///
/// `initializing → disconnected → connecting → connected`, with
/// `error → reconnecting → connecting` on failure. `disabled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatus {
    Initializing,
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Disabled,
}

impl std::fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Error => write!(f, "error"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// A status transition the adapter made on its own: a dropped link, a
/// timer-driven reconnect, or giving up after the last reconnect attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub protocol: Protocol,
    pub status: AdapterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A command translated for one protocol: device id resolved to an address
/// and the command name/parameters passed through the device's mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolCommand {
    pub device_id: String,
    pub address: String,
    pub command: String,
    pub parameters: Map<String, Value>,
    pub timeout: Option<Duration>,
}

impl ProtocolCommand {
    pub fn new(
        device_id: impl Into<String>,
        address: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            address: address.into(),
            command: command.into(),
            parameters: Map::new(),
            timeout: None,
        }
    }

    /// Translate a device command through its mapping.
    pub fn from_device(command: &DeviceCommand, mapping: &DeviceMapping) -> Self {
        let (name, parameters) = mapping.translate_command(&command.command, &command.parameters);
        Self {
            device_id: command.device_id.clone(),
            address: mapping.protocol_address.clone(),
            command: name,
            parameters,
            timeout: command.timeout(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).and_then(Value::as_f64)
    }

    pub fn param_bool(&self, name: &str) -> Option<bool> {
        self.parameters.get(name).and_then(Value::as_bool)
    }
}

/// Adapter counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterMetrics {
    pub commands_sent: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    /// Rolling average over completed commands.
    pub average_latency_ms: f64,
    /// Whole seconds since the current connection was established.
    pub uptime_secs: u64,
    pub reconnect_count: u32,
}

/// Point-in-time adapter health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub protocol: Protocol,
    pub status: AdapterStatus,
    pub connected: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_command_at: Option<DateTime<Utc>>,
    pub metrics: AdapterMetrics,
}

/// Protocol adapter trait.
///
/// Lifecycle is `initialize → connect → disconnect → destroy`.
/// `send_command` never fails: every outcome, including timeouts, comes
/// back as a [`CommandResult`].
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Protocol this adapter drives.
    fn protocol(&self) -> Protocol;

    /// Current connection status.
    fn status(&self) -> AdapterStatus;

    fn is_connected(&self) -> bool {
        self.status() == AdapterStatus::Connected
    }

    /// Apply configuration. Also the way out of a terminal `error` status.
    async fn initialize(&self, config: AdapterConfig) -> AdapterResult<()>;

    /// Connect, scheduling automatic reconnects on failure when enabled.
    async fn connect(&self) -> AdapterResult<()>;

    /// Disconnect and cancel pending reconnects.
    async fn disconnect(&self) -> AdapterResult<()>;

    /// Disconnect and release every subscriber.
    async fn destroy(&self) -> AdapterResult<()>;

    /// Mark the adapter as disabled. Terminal.
    fn disable(&self);

    async fn discover_devices(&self) -> AdapterResult<Vec<DiscoveredDevice>>;

    /// Read a device's state by protocol address.
    async fn get_device_state(&self, address: &str) -> AdapterResult<Option<DeviceState>>;

    async fn send_command(&self, command: ProtocolCommand) -> CommandResult;

    /// Listen to state changes of one protocol address.
    fn subscribe_to_device(&self, address: &str, listener: Listener<StateChange>) -> Unsubscribe;

    /// Listen to every state change this adapter observes.
    fn subscribe_to_all(&self, listener: Listener<StateChange>) -> Unsubscribe;

    /// Listen to status transitions that happen outside `connect` and
    /// `disconnect` calls.
    fn subscribe_to_status(&self, listener: Listener<StatusChange>) -> Unsubscribe;

    fn health(&self) -> AdapterHealth;

    /// Round-trip latency to the protocol endpoint.
    async fn ping(&self) -> AdapterResult<Duration>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use habitat_core::{CommandMapping, DeviceCommand};
    use serde_json::json;

    #[test]
    fn test_status_display() {
        assert_eq!(AdapterStatus::Connected.to_string(), "connected");
        assert_eq!(AdapterStatus::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_value(AdapterStatus::Disabled).unwrap(),
            json!("disabled")
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(AdapterError::Timeout(250).to_string(), "Operation timeout after 250ms");
        assert_eq!(AdapterError::NotConnected.to_string(), "Adapter not connected");
        let err = AdapterError::Communication("send failed".into());
        assert!(err.to_string().contains("send failed"));
    }

    #[test]
    fn test_protocol_command_from_device() {
        let mapping = DeviceMapping::new("hall", Protocol::Knx, "1/1/7").with_command(
            "dim",
            CommandMapping::new("set_level").with_parameter("level", 50),
        );
        let command = DeviceCommand::new("hall", "dim")
            .with_parameter("level", 20)
            .with_timeout(Duration::from_millis(900));

        let translated = ProtocolCommand::from_device(&command, &mapping);
        assert_eq!(translated.address, "1/1/7");
        assert_eq!(translated.command, "set_level");
        assert_eq!(translated.param_f64("level"), Some(20.0));
        assert_eq!(translated.timeout, Some(Duration::from_millis(900)));
    }
}
