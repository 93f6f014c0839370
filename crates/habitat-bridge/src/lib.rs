//! Habitat Universal Bridge
//!
//! Drives heterogeneous home-automation protocols through one command and
//! state interface.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | MQTT adapter and `rumqttc` transport |
//! | `http` | ✅ | HTTP gateway adapter over `reqwest` |
//!
//! ## Architecture
//!
//! - **ProtocolAdapter**: the contract every protocol implements
//! - **BaseProtocolAdapter**: reconnect, timeouts, metrics and fan-out around a `ProtocolDriver`
//! - **Transport**: injected wire client used by the MQTT and KNX drivers
//! - **BridgeManager**: device mappings, priority queue, circuit breaker,
//!   rate limiter, bulkhead and state cache

pub mod adapter;
pub mod adapters;
pub mod base;
pub mod bridge;
pub mod transport;

pub use adapter::{
    AdapterError, AdapterHealth, AdapterMetrics, AdapterResult, AdapterStatus, ProtocolAdapter,
    ProtocolCommand, StatusChange,
};
pub use adapters::{available_adapters, create_adapter, MockAdapter, MockDriver, MOCK_PROTOCOL};
pub use base::{state_from_json, BaseProtocolAdapter, ProtocolDriver, StateSink};
pub use bridge::{BridgeError, BridgeManager, BridgeResult, CircuitState, QueueStats};
pub use transport::{LoopbackTransport, Transport, TransportError, TransportEvent};

// Core types callers need alongside the bridge.
pub use habitat_core::{
    AdapterConfig, BridgeConfig, BridgeEvent, CommandPriority, CommandResult, DeviceCommand,
    DeviceMapping, DeviceState, DiscoveredDevice, Protocol, StateChange, Unsubscribe,
};
