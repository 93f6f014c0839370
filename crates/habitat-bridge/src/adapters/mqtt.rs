//! MQTT driver.
//!
//! ## Topic Format
//!
//! State reports: `{base_topic}/{address}/state`
//! Commands: `{base_topic}/{address}/set` with `{"command": ..., "parameters": {...}}`
//! Announcements: `{base_topic}/{address}/announce` with `{"name", "type", "capabilities"}`
//! Ping: `{base_topic}/bridge/ping`
//!
//! Addresses are single topic levels.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use habitat_core::{
    AdapterConfig, DeviceState, DiscoveredDevice, Protocol, ProtocolSettings, Unsubscribe,
};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::adapter::{AdapterError, AdapterResult, ProtocolCommand};
use crate::base::{state_from_json, BaseProtocolAdapter, ProtocolDriver, StateSink};
use crate::transport::{Transport, TransportEvent};

pub type MqttAdapter = BaseProtocolAdapter<MqttDriver>;

/// Payload of an announce message.
#[derive(Debug, Deserialize)]
struct Announcement {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default = "default_device_type")]
    device_type: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

fn default_device_type() -> String {
    "generic".to_string()
}

struct MqttShared {
    base_topic: RwLock<String>,
    states: Mutex<HashMap<String, DeviceState>>,
    announced: Mutex<BTreeMap<String, DiscoveredDevice>>,
}

impl MqttShared {
    fn base_topic(&self) -> String {
        self.base_topic.read().clone()
    }

    fn handle_event(&self, event: &TransportEvent, sink: &StateSink) {
        match event {
            TransportEvent::Message { topic, payload } => self.handle_message(topic, payload, sink),
            TransportEvent::Disconnected(reason) => sink.connection_lost(reason.clone()),
        }
    }

    fn handle_message(&self, topic: &str, payload: &[u8], sink: &StateSink) {
        let base = self.base_topic();
        let Some((address, kind)) = topic
            .strip_prefix(base.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.rsplit_once('/'))
        else {
            debug!("Ignoring message on unrelated topic {}", topic);
            return;
        };

        match kind {
            "state" => {
                let report = serde_json::from_slice::<Value>(payload).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(payload).into_owned())
                });
                let state = state_from_json(report);
                self.states.lock().insert(address.to_string(), state.clone());
                sink.publish(address, state);
            }
            "announce" => match serde_json::from_slice::<Announcement>(payload) {
                Ok(announcement) => {
                    let metadata = serde_json::from_slice(payload).unwrap_or(Value::Null);
                    let mut device =
                        DiscoveredDevice::new(Protocol::Mqtt, address, announcement.device_type)
                            .with_capabilities(announcement.capabilities)
                            .with_metadata(metadata);
                    if let Some(name) = announcement.name {
                        device = device.with_name(name);
                    }
                    debug!("MQTT device announced: {}", address);
                    self.announced.lock().insert(address.to_string(), device);
                }
                Err(e) => warn!("Failed to parse announcement from {}: {}", address, e),
            },
            _ => {}
        }
    }
}

/// Drives MQTT devices through an injected [`Transport`].
pub struct MqttDriver {
    transport: Arc<dyn Transport>,
    shared: Arc<MqttShared>,
    listener: Mutex<Option<Unsubscribe>>,
}

impl MqttDriver {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            shared: Arc::new(MqttShared {
                base_topic: RwLock::new(habitat_core::config::defaults::MQTT_BASE_TOPIC.to_string()),
                states: Mutex::new(HashMap::new()),
                announced: Mutex::new(BTreeMap::new()),
            }),
            listener: Mutex::new(None),
        }
    }

    pub fn state_topic(&self, address: &str) -> String {
        format!("{}/{}/state", self.shared.base_topic(), address)
    }

    pub fn command_topic(&self, address: &str) -> String {
        format!("{}/{}/set", self.shared.base_topic(), address)
    }

    pub fn ping_topic(&self) -> String {
        format!("{}/bridge/ping", self.shared.base_topic())
    }

    fn release_listener(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.unsubscribe();
        }
    }
}

#[async_trait]
impl ProtocolDriver for MqttDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn configure(&self, config: &AdapterConfig) -> AdapterResult<()> {
        match &config.settings {
            ProtocolSettings::Mqtt(settings) => {
                let base = settings.base_topic.trim_end_matches('/');
                if base.is_empty() || base.contains(['+', '#']) {
                    return Err(AdapterError::Configuration(format!(
                        "Invalid MQTT base topic: {:?}",
                        settings.base_topic
                    )));
                }
                *self.shared.base_topic.write() = base.to_string();
                Ok(())
            }
            other => Err(AdapterError::Configuration(format!(
                "MQTT driver given {} settings",
                other.protocol()
            ))),
        }
    }

    async fn connect(&self, sink: StateSink) -> AdapterResult<()> {
        self.transport.connect().await?;

        let shared = self.shared.clone();
        let handle = self
            .transport
            .on_event(Arc::new(move |event: &TransportEvent| shared.handle_event(event, &sink)));
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.unsubscribe();
        }

        let base = self.shared.base_topic();
        self.transport.subscribe(&format!("{}/+/state", base)).await?;
        self.transport.subscribe(&format!("{}/+/announce", base)).await?;
        Ok(())
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        self.release_listener();
        self.transport.disconnect().await?;
        Ok(())
    }

    async fn send(&self, command: &ProtocolCommand) -> AdapterResult<()> {
        let payload = serde_json::to_vec(&json!({
            "command": command.command,
            "parameters": command.parameters,
        }))
        .map_err(|e| AdapterError::Communication(e.to_string()))?;
        self.transport
            .publish(&self.command_topic(&command.address), payload)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> AdapterResult<()> {
        let payload = json!({ "ts": Utc::now().timestamp_millis() }).to_string();
        self.transport
            .publish(&self.ping_topic(), payload.into_bytes())
            .await?;
        Ok(())
    }

    async fn discover(&self) -> AdapterResult<Vec<DiscoveredDevice>> {
        Ok(self.shared.announced.lock().values().cloned().collect())
    }

    async fn read_state(&self, address: &str) -> AdapterResult<Option<DeviceState>> {
        Ok(self.shared.states.lock().get(address).cloned())
    }
}
