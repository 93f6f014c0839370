//! Protocol adapters.
//!
//! Each adapter is a [`BaseProtocolAdapter`](crate::base::BaseProtocolAdapter)
//! around a protocol driver.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `mqtt` | MQTT over `rumqttc` (default) |
//! | `http` | REST gateways over `reqwest` (default) |
//!
//! KNX (KNXnet/IP routing) and the `mock` adapter are always available.

pub mod knx;
pub mod mock;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "http")]
pub mod http;

pub use knx::{KnxAdapter, KnxDriver};
pub use mock::{MockAdapter, MockDriver, MOCK_PROTOCOL};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttAdapter, MqttDriver};
#[cfg(feature = "http")]
pub use http::{HttpAdapter, HttpDriver};

use std::sync::Arc;

use habitat_core::{AdapterConfig, ProtocolSettings};

use crate::adapter::{AdapterError, AdapterResult, ProtocolAdapter};
use crate::transport::KnxIpTransport;

/// Build the adapter for a configured protocol.
///
/// The adapter is not initialized; registering it with the bridge does that.
pub fn create_adapter(config: &AdapterConfig) -> AdapterResult<Arc<dyn ProtocolAdapter>> {
    match &config.settings {
        #[cfg(feature = "mqtt")]
        ProtocolSettings::Mqtt(settings) => {
            let transport = Arc::new(crate::transport::RumqttTransport::new(settings.clone()));
            Ok(MqttAdapter::new(MqttDriver::new(transport)))
        }

        ProtocolSettings::Knx(settings) => {
            let transport = Arc::new(KnxIpTransport::new(settings));
            Ok(KnxAdapter::new(KnxDriver::new(transport)))
        }

        #[cfg(feature = "http")]
        ProtocolSettings::Http(_) => Ok(HttpAdapter::new(HttpDriver::new())),

        ProtocolSettings::Custom(custom) if custom.name == MOCK_PROTOCOL => {
            Ok(MockAdapter::new(MockDriver::new()))
        }

        other => Err(AdapterError::Configuration(format!(
            "Unsupported protocol: {}. Available adapters: {}",
            other.protocol(),
            available_adapters().join(", ")
        ))),
    }
}

/// Protocols [`create_adapter`] can build with the enabled features.
pub fn available_adapters() -> Vec<&'static str> {
    let mut adapters = Vec::new();

    #[cfg(feature = "mqtt")]
    adapters.push("mqtt");

    adapters.push("knx");

    #[cfg(feature = "http")]
    adapters.push("http");

    adapters.push(MOCK_PROTOCOL);
    adapters
}
