//! Events emitted by the bridge to external listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::{CommandResult, DeviceCommand, DeviceState, DiscoveredDevice, Protocol};

/// A device state change expressed in device terms rather than protocol
/// terms, ready for consumers that do not care where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub device_id: String,
    pub protocol: Protocol,
    pub address: String,
    pub online: bool,
    pub values: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Bridge event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    AdapterConnected {
        protocol: Protocol,
    },
    AdapterDisconnected {
        protocol: Protocol,
    },
    AdapterError {
        protocol: Protocol,
        error: String,
    },
    DeviceState {
        device_id: String,
        state: DeviceState,
    },
    DeviceDiscovered {
        device: DiscoveredDevice,
    },
    CommandSent {
        command: DeviceCommand,
        /// 0 for the first attempt, incremented on each retry.
        attempt: u32,
    },
    CommandCompleted {
        result: CommandResult,
    },
    MessageNormalized {
        message: NormalizedMessage,
    },
}

impl BridgeEvent {
    /// Stable event name, e.g. `adapter:connected`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AdapterConnected { .. } => "adapter:connected",
            Self::AdapterDisconnected { .. } => "adapter:disconnected",
            Self::AdapterError { .. } => "adapter:error",
            Self::DeviceState { .. } => "device:state",
            Self::DeviceDiscovered { .. } => "device:discovered",
            Self::CommandSent { .. } => "command:sent",
            Self::CommandCompleted { .. } => "command:completed",
            Self::MessageNormalized { .. } => "message:normalized",
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::DeviceState { device_id, .. } => Some(device_id),
            Self::CommandSent { command, .. } => Some(&command.device_id),
            Self::CommandCompleted { result } => Some(&result.device_id),
            Self::MessageNormalized { message } => Some(&message.device_id),
            Self::AdapterConnected { .. }
            | Self::AdapterDisconnected { .. }
            | Self::AdapterError { .. }
            | Self::DeviceDiscovered { .. } => None,
        }
    }

    pub fn protocol(&self) -> Option<&Protocol> {
        match self {
            Self::AdapterConnected { protocol }
            | Self::AdapterDisconnected { protocol }
            | Self::AdapterError { protocol, .. } => Some(protocol),
            Self::DeviceDiscovered { device } => Some(&device.protocol),
            Self::MessageNormalized { message } => Some(&message.protocol),
            Self::DeviceState { .. } | Self::CommandSent { .. } | Self::CommandCompleted { .. } => None,
        }
    }
}
