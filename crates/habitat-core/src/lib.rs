//! Core types for the Habitat device bridge.
//!
//! This crate holds everything the bridge and its callers share:
//! - **device**: protocol ids, commands, results, device state, discovery records
//! - **mapping**: device id to protocol address bindings and value transforms
//! - **event**: the bridge event stream and normalized messages
//! - **observer**: listener sets with `Unsubscribe` handles
//! - **config**: the `BridgeConfig` tree and its loaders

pub mod config;
pub mod device;
pub mod event;
pub mod mapping;
pub mod observer;

pub use config::{
    AdapterConfig, AdapterTimeouts, BridgeConfig, BulkheadConfig, CircuitBreakerConfig,
    ConfigError, CustomSettings, FaultToleranceConfig, GenericSettings, HttpSettings,
    KnxDatapoint, KnxDpt, KnxSettings, MessageQueueConfig, MqttSettings, ProtocolSettings,
    RateLimitConfig, ReconnectPolicy, RetryPolicy,
};
pub use device::{
    CommandPriority, CommandResult, DeviceCommand, DeviceState, DiscoveredDevice, Protocol,
    StateChange,
};
pub use event::{BridgeEvent, NormalizedMessage};
pub use mapping::{CommandMapping, DeviceMapping, PropertyMapping, ValueTransform};
pub use observer::{Listener, Subscribers, Unsubscribe};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
