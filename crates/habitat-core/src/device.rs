//! Protocol-agnostic device model shared by adapters and the bridge.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Device protocol identifier.
///
/// Serialized as its lowercase name. Unknown names become [`Protocol::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    Mqtt,
    Knx,
    Zigbee,
    ZWave,
    Modbus,
    HomeKit,
    Http,
    Custom(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Knx => "knx",
            Self::Zigbee => "zigbee",
            Self::ZWave => "zwave",
            Self::Modbus => "modbus",
            Self::HomeKit => "homekit",
            Self::Http => "http",
            Self::Custom(name) => name,
        }
    }

    /// Build a custom protocol id (e.g. `"mock"`).
    pub fn custom(name: impl Into<String>) -> Self {
        Self::from(name.into())
    }
}

impl From<String> for Protocol {
    fn from(name: String) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "mqtt" => Self::Mqtt,
            "knx" => Self::Knx,
            "zigbee" => Self::Zigbee,
            "zwave" | "z-wave" => Self::ZWave,
            "modbus" => Self::Modbus,
            "homekit" => Self::HomeKit,
            "http" => Self::Http,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<&str> for Protocol {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.as_str().to_string()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command priority. Ordering is `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for CommandPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A command addressed to an abstract device id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub device_id: String,
    pub command: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub priority: CommandPriority,
    /// Per-call timeout overriding the adapter's command timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl DeviceCommand {
    pub fn new(device_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            command: command.into(),
            parameters: Map::new(),
            priority: CommandPriority::Normal,
            timeout_ms: None,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Outcome of a command. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub device_id: String,
    pub command: String,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn succeeded(device_id: impl Into<String>, command: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            device_id: device_id.into(),
            command: command.into(),
            executed_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            error: None,
        }
    }

    pub fn failed(
        device_id: impl Into<String>,
        command: impl Into<String>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            device_id: device_id.into(),
            command: command.into(),
            executed_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            error: Some(error.into()),
        }
    }

    /// Immediate rejection for `command`, before any adapter was involved.
    pub fn rejected(command: &DeviceCommand, error: impl Into<String>) -> Self {
        Self::failed(&command.device_id, &command.command, Duration::ZERO, error)
    }
}

/// Last known state of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub last_changed: DateTime<Utc>,
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl DeviceState {
    pub fn new(online: bool) -> Self {
        let now = Utc::now();
        Self {
            online,
            last_seen: now,
            last_changed: now,
            values: Map::new(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with_values(mut self, values: Map<String, Value>) -> Self {
        self.values = values;
        self
    }

    /// Overwrite this state with a newer observation.
    ///
    /// Values not present in `update` are dropped. `last_changed` is kept
    /// when neither the values nor the online flag differ. Returns whether
    /// anything changed.
    pub fn replace(&mut self, update: DeviceState) -> bool {
        let changed = self.online != update.online || self.values != update.values;
        let last_changed = if changed {
            update.last_changed
        } else {
            self.last_changed
        };
        *self = DeviceState {
            last_changed,
            ..update
        };
        changed
    }
}

/// A state observation reported by an adapter, keyed by protocol address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub protocol: Protocol,
    pub address: String,
    pub state: DeviceState,
}

/// A device found during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub protocol: Protocol,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub device_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredDevice {
    pub fn new(protocol: Protocol, address: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            protocol,
            address: address.into(),
            name: None,
            device_type: device_type.into(),
            capabilities: Vec::new(),
            metadata: Value::Object(Map::new()),
            discovered_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_names() {
        assert_eq!(Protocol::from("KNX"), Protocol::Knx);
        assert_eq!(Protocol::from("z-wave"), Protocol::ZWave);
        assert_eq!(Protocol::custom("mock"), Protocol::Custom("mock".into()));
        assert_eq!(Protocol::HomeKit.to_string(), "homekit");

        let json = serde_json::to_string(&Protocol::Mqtt).unwrap();
        assert_eq!(json, "\"mqtt\"");
        let back: Protocol = serde_json::from_str("\"mock\"").unwrap();
        assert_eq!(back, Protocol::custom("mock"));
    }

    #[test]
    fn test_priority_order() {
        assert!(CommandPriority::Critical > CommandPriority::High);
        assert!(CommandPriority::High > CommandPriority::Normal);
        assert!(CommandPriority::Normal > CommandPriority::Low);
        assert_eq!(CommandPriority::default(), CommandPriority::Normal);
    }

    #[test]
    fn test_command_builder() {
        let cmd = DeviceCommand::new("lamp", "set_level")
            .with_parameter("level", 40)
            .with_priority(CommandPriority::High)
            .with_timeout(Duration::from_millis(250));

        assert_eq!(cmd.parameters.get("level"), Some(&json!(40)));
        assert_eq!(cmd.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_state_replace_is_last_write_wins() {
        let mut state = DeviceState::new(true)
            .with_value("power", "on")
            .with_value("level", 50);
        let before = state.last_changed;

        let same = DeviceState::new(true)
            .with_value("power", "on")
            .with_value("level", 50);
        assert!(!state.replace(same));
        assert_eq!(state.last_changed, before);

        let update = DeviceState::new(true).with_value("power", "off");
        assert!(state.replace(update));
        assert_eq!(state.values.get("power"), Some(&json!("off")));
        assert!(state.values.get("level").is_none());
    }

    #[test]
    fn test_rejected_result() {
        let cmd = DeviceCommand::new("d1", "turn_on");
        let result = CommandResult::rejected(&cmd, "Device not found");
        assert!(!result.success);
        assert_eq!(result.duration_ms, 0);
        assert_eq!(result.error.as_deref(), Some("Device not found"));
    }
}
