//! Device mappings: binding an abstract device id to a protocol address.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::Protocol;

/// Binds a device id to a protocol address plus property/command transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub device_id: String,
    pub protocol: Protocol,
    pub protocol_address: String,
    /// Device property name -> protocol property it is read from.
    #[serde(default)]
    pub property_mappings: HashMap<String, PropertyMapping>,
    /// Device command name -> protocol command it is sent as.
    #[serde(default)]
    pub command_mappings: HashMap<String, CommandMapping>,
}

/// Where a device property comes from and how its value is converted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMapping {
    pub source: String,
    #[serde(default)]
    pub transform: ValueTransform,
}

impl PropertyMapping {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            transform: ValueTransform::None,
        }
    }

    pub fn with_transform(mut self, transform: ValueTransform) -> Self {
        self.transform = transform;
        self
    }
}

/// Value conversion applied while normalizing protocol state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueTransform {
    #[default]
    None,
    /// `value * factor + offset` for numeric values.
    Scale {
        factor: f64,
        #[serde(default)]
        offset: f64,
    },
    /// Boolean negation.
    Invert,
    /// Lookup table keyed by the value's string form.
    Map { values: HashMap<String, Value> },
}

impl ValueTransform {
    /// Apply the transform. Values the transform does not understand pass
    /// through unchanged.
    pub fn apply(&self, value: &Value) -> Value {
        match self {
            Self::None => value.clone(),
            Self::Scale { factor, offset } => match value.as_f64() {
                Some(v) => Value::from(v * factor + offset),
                None => value.clone(),
            },
            Self::Invert => match value.as_bool() {
                Some(b) => Value::Bool(!b),
                None => value.clone(),
            },
            Self::Map { values } => {
                let key = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                values.get(&key).cloned().unwrap_or_else(|| value.clone())
            }
        }
    }
}

/// How a device command is expressed for the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMapping {
    pub target: String,
    /// Defaults merged under the caller's parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl CommandMapping {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

impl DeviceMapping {
    pub fn new(
        device_id: impl Into<String>,
        protocol: Protocol,
        protocol_address: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
            protocol_address: protocol_address.into(),
            property_mappings: HashMap::new(),
            command_mappings: HashMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, mapping: PropertyMapping) -> Self {
        self.property_mappings.insert(name.into(), mapping);
        self
    }

    pub fn with_command(mut self, name: impl Into<String>, mapping: CommandMapping) -> Self {
        self.command_mappings.insert(name.into(), mapping);
        self
    }

    /// Rename and convert protocol values into device values.
    ///
    /// Mapped sources appear under their device name only; unmapped protocol
    /// properties pass through under their own name.
    pub fn normalize_values(&self, raw: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        let mut consumed = HashSet::new();

        for (name, mapping) in &self.property_mappings {
            if let Some(value) = raw.get(&mapping.source) {
                out.insert(name.clone(), mapping.transform.apply(value));
                consumed.insert(mapping.source.as_str());
            }
        }

        for (name, value) in raw {
            if !consumed.contains(name.as_str()) && !out.contains_key(name) {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }

    /// Resolve a device command into the protocol command and parameters.
    pub fn translate_command(&self, command: &str, parameters: &Map<String, Value>) -> (String, Map<String, Value>) {
        match self.command_mappings.get(command) {
            Some(mapping) => {
                let mut merged = mapping.parameters.clone();
                for (name, value) in parameters {
                    merged.insert(name.clone(), value.clone());
                }
                (mapping.target.clone(), merged)
            }
            None => (command.to_string(), parameters.clone()),
        }
    }
}
