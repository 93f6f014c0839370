//! Wire transports used by protocol drivers.
//!
//! A driver never opens sockets itself; it is handed a [`Transport`] and
//! speaks in topics and payloads. For MQTT a topic is an MQTT topic, for KNX
//! it is a group address. Production transports live next to this module,
//! [`LoopbackTransport`] is the in-memory one used in tests.

use async_trait::async_trait;
use habitat_core::{Listener, Unsubscribe};
use thiserror::Error;

use crate::adapter::AdapterError;

pub mod knxip;
pub mod loopback;
#[cfg(feature = "mqtt")]
pub mod rumqtt;

pub use knxip::KnxIpTransport;
pub use loopback::LoopbackTransport;
#[cfg(feature = "mqtt")]
pub use rumqtt::RumqttTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport connect failed: {0}")]
    Connect(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl From<TransportError> for AdapterError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect(reason) => AdapterError::Connection(reason),
            TransportError::NotConnected => AdapterError::NotConnected,
            TransportError::InvalidAddress(address) => AdapterError::DeviceNotFound(address),
            other => AdapterError::Communication(other.to_string()),
        }
    }
}

/// Something a transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { topic: String, payload: Vec<u8> },
    /// The link dropped without `disconnect` being called.
    Disconnected(String),
}

/// Injected wire client.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Start receiving messages matching `filter`.
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Register for inbound messages and link loss.
    fn on_event(&self, listener: Listener<TransportEvent>) -> Unsubscribe;

    fn is_connected(&self) -> bool;
}

/// MQTT-style filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
