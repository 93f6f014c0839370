//! KNX driver.
//!
//! Addresses are three-level group addresses. Each configured datapoint
//! fixes how its group's payload is encoded:
//!
//! | DPT   | Meaning             | Encoding                          |
//! |-------|---------------------|-----------------------------------|
//! | 1.001 | switch on/off       | 1 bit, carried in the APCI byte   |
//! | 5.001 | percent 0..100      | 1 byte, scaled to 0..255          |
//! | 9.001 | temperature in °C   | 2 byte float, `0.01 * M * 2^E`    |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use habitat_core::{
    AdapterConfig, DeviceState, DiscoveredDevice, KnxDatapoint, KnxDpt, Protocol,
    ProtocolSettings, Unsubscribe,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::{AdapterError, AdapterResult, ProtocolCommand};
use crate::base::{BaseProtocolAdapter, ProtocolDriver, StateSink};
use crate::transport::knxip::{format_group_address, parse_group_address};
use crate::transport::{Transport, TransportEvent};

pub type KnxAdapter = BaseProtocolAdapter<KnxDriver>;

const APCI_READ: u8 = 0x00;
const APCI_RESPONSE: u8 = 0x40;
const APCI_WRITE: u8 = 0x80;

/// Encode a DPT 9.001 value. `None` when out of range.
pub fn encode_dpt9(value: f64) -> Option<[u8; 2]> {
    if !value.is_finite() {
        return None;
    }
    let mut mantissa = value * 100.0;
    let mut exponent = 0u16;
    while !(-2048.0..=2047.0).contains(&mantissa) {
        mantissa /= 2.0;
        exponent += 1;
        if exponent > 15 {
            return None;
        }
    }
    let m = (mantissa.round() as i32).clamp(-2048, 2047);
    let m12 = (m as u16) & 0x0FFF;
    let sign = (m12 >> 11) & 0x01;
    let raw = (sign << 15) | (exponent << 11) | (m12 & 0x07FF);
    Some(raw.to_be_bytes())
}

pub fn decode_dpt9(bytes: [u8; 2]) -> f64 {
    let raw = u16::from_be_bytes(bytes);
    let exponent = (raw >> 11) & 0x0F;
    let low = (raw & 0x07FF) as i32;
    let mantissa = if raw & 0x8000 != 0 { low - 2048 } else { low };
    mantissa as f64 * f64::from(1u32 << exponent) / 100.0
}

/// Build a GroupValueWrite APDU for `value`.
pub fn encode_write(dpt: KnxDpt, value: &Value) -> AdapterResult<Vec<u8>> {
    let invalid = || AdapterError::Communication(format!("Invalid value {} for DPT {}", value, dpt_name(dpt)));
    match dpt {
        KnxDpt::Switch => {
            let on = match value {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|v| v != 0.0).ok_or_else(invalid)?,
                Value::String(s) => match s.to_ascii_lowercase().as_str() {
                    "on" | "true" => true,
                    "off" | "false" => false,
                    _ => return Err(invalid()),
                },
                _ => return Err(invalid()),
            };
            Ok(vec![0x00, APCI_WRITE | u8::from(on)])
        }
        KnxDpt::Percent => {
            let percent = value.as_f64().filter(|v| (0.0..=100.0).contains(v)).ok_or_else(invalid)?;
            let scaled = (percent * 255.0 / 100.0).round() as u8;
            Ok(vec![0x00, APCI_WRITE, scaled])
        }
        KnxDpt::Temperature => {
            let bytes = value.as_f64().and_then(encode_dpt9).ok_or_else(invalid)?;
            Ok(vec![0x00, APCI_WRITE, bytes[0], bytes[1]])
        }
    }
}

/// Decode the value of a GroupValueWrite/Response APDU. Reads and
/// malformed telegrams yield `None`.
pub fn decode_telegram(dpt: KnxDpt, apdu: &[u8]) -> Option<Value> {
    if apdu.len() < 2 {
        return None;
    }
    let apci = apdu[1] & 0xC0;
    if apci == APCI_READ || (apci != APCI_WRITE && apci != APCI_RESPONSE) {
        return None;
    }
    match dpt {
        KnxDpt::Switch => {
            let bit = if apdu.len() == 2 { apdu[1] & 0x01 } else { apdu[2] & 0x01 };
            Some(Value::Bool(bit != 0))
        }
        KnxDpt::Percent => {
            let raw = *apdu.get(2)?;
            Some(json!((raw as f64 * 100.0 / 255.0).round()))
        }
        KnxDpt::Temperature => {
            let bytes = [*apdu.get(2)?, *apdu.get(3)?];
            let celsius = (decode_dpt9(bytes) * 100.0).round() / 100.0;
            Some(json!(celsius))
        }
    }
}

fn dpt_name(dpt: KnxDpt) -> &'static str {
    match dpt {
        KnxDpt::Switch => "1.001",
        KnxDpt::Percent => "5.001",
        KnxDpt::Temperature => "9.001",
    }
}

fn device_type(dpt: KnxDpt) -> (&'static str, Vec<String>) {
    match dpt {
        KnxDpt::Switch => ("switch", vec!["on_off".into()]),
        KnxDpt::Percent => ("dimmer", vec!["on_off".into(), "level".into()]),
        KnxDpt::Temperature => ("thermostat", vec!["temperature".into()]),
    }
}

struct KnxShared {
    datapoints: RwLock<HashMap<String, KnxDatapoint>>,
    states: Mutex<HashMap<String, DeviceState>>,
}

impl KnxShared {
    fn handle_event(&self, event: &TransportEvent, sink: &StateSink) {
        match event {
            TransportEvent::Message { topic, payload } => {
                let Some(dpt) = self.datapoints.read().get(topic).map(|d| d.dpt) else {
                    debug!("Telegram for unconfigured group address {}", topic);
                    return;
                };
                let Some(value) = decode_telegram(dpt, payload) else {
                    return;
                };
                let state = DeviceState::new(true).with_value("value", value);
                self.states.lock().insert(topic.clone(), state.clone());
                sink.publish(topic.clone(), state);
            }
            TransportEvent::Disconnected(reason) => sink.connection_lost(reason.clone()),
        }
    }
}

/// Drives KNX group addresses through an injected [`Transport`].
pub struct KnxDriver {
    transport: Arc<dyn Transport>,
    shared: Arc<KnxShared>,
    listener: Mutex<Option<Unsubscribe>>,
}

impl KnxDriver {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            shared: Arc::new(KnxShared {
                datapoints: RwLock::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
            }),
            listener: Mutex::new(None),
        }
    }

    fn configured_dpt(&self, address: &str) -> Option<KnxDpt> {
        self.shared.datapoints.read().get(address).map(|d| d.dpt)
    }

    /// Resolve a command to the DPT and value to write.
    fn resolve(&self, command: &ProtocolCommand) -> AdapterResult<(KnxDpt, Value)> {
        let required = |name: &str| {
            command.param(name).cloned().ok_or_else(|| {
                AdapterError::Communication(format!(
                    "{} requires parameter '{}'",
                    command.command, name
                ))
            })
        };
        match command.command.as_str() {
            "turn_on" => Ok((KnxDpt::Switch, Value::Bool(true))),
            "turn_off" => Ok((KnxDpt::Switch, Value::Bool(false))),
            "set" => {
                let value = required("value")?;
                let dpt = self.configured_dpt(&command.address).unwrap_or(KnxDpt::Switch);
                Ok((dpt, value))
            }
            "set_level" => Ok((KnxDpt::Percent, required("level")?)),
            "set_temperature" => Ok((KnxDpt::Temperature, required("temperature")?)),
            other => Err(AdapterError::Communication(format!(
                "Unsupported KNX command: {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl ProtocolDriver for KnxDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Knx
    }

    fn configure(&self, config: &AdapterConfig) -> AdapterResult<()> {
        let ProtocolSettings::Knx(settings) = &config.settings else {
            return Err(AdapterError::Configuration(format!(
                "KNX driver given {} settings",
                config.protocol()
            )));
        };

        let mut datapoints = HashMap::new();
        for datapoint in &settings.datapoints {
            let raw = parse_group_address(&datapoint.group_address).map_err(|_| {
                AdapterError::Configuration(format!(
                    "Invalid group address: {}",
                    datapoint.group_address
                ))
            })?;
            // normalize spacing so lookups by formatted address hit
            datapoints.insert(format_group_address(raw), datapoint.clone());
        }
        *self.shared.datapoints.write() = datapoints;
        Ok(())
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

        let addresses: Vec<String> = self.shared.datapoints.read().keys().cloned().collect();
        for address in addresses {
            self.transport.subscribe(&address).await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        if let Some(handle) = self.listener.lock().take() {
            handle.unsubscribe();
        }
        self.transport.disconnect().await?;
        Ok(())
    }

    async fn send(&self, command: &ProtocolCommand) -> AdapterResult<()> {
        let raw = parse_group_address(&command.address)?;
        let address = format_group_address(raw);
        let (dpt, value) = self.resolve(command)?;
        let apdu = encode_write(dpt, &value)?;
        self.transport.publish(&address, apdu).await?;
        Ok(())
    }

    async fn ping(&self) -> AdapterResult<()> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(AdapterError::NotConnected)
        }
    }

    async fn discover(&self) -> AdapterResult<Vec<DiscoveredDevice>> {
        let datapoints = self.shared.datapoints.read();
        let mut devices: Vec<DiscoveredDevice> = datapoints
            .values()
            .map(|datapoint| {
                let (kind, capabilities) = device_type(datapoint.dpt);
                let mut device = DiscoveredDevice::new(Protocol::Knx, &datapoint.group_address, kind)
                    .with_capabilities(capabilities)
                    .with_metadata(json!({ "dpt": dpt_name(datapoint.dpt) }));
                if let Some(name) = &datapoint.name {
                    device = device.with_name(name);
                }
                device
            })
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }

    async fn read_state(&self, address: &str) -> AdapterResult<Option<DeviceState>> {
        Ok(self.shared.states.lock().get(address).cloned())
    }
}
