//! HTTP driver for devices behind a REST gateway.
//!
//! | Operation | Request                                   |
//! |-----------|-------------------------------------------|
//! | connect   | `GET {base_url}/health`                   |
//! | ping      | `GET {base_url}/health`                   |
//! | command   | `POST {base_url}/devices/{address}/commands` |
//! | state     | `GET {base_url}/devices/{address}/state`  |
//! | discovery | `GET {base_url}/devices`                  |

use async_trait::async_trait;
use habitat_core::{
    AdapterConfig, DeviceState, DiscoveredDevice, HttpSettings, Protocol, ProtocolSettings,
};
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::{AdapterError, AdapterResult, ProtocolCommand};
use crate::base::{state_from_json, BaseProtocolAdapter, ProtocolDriver, StateSink};

pub type HttpAdapter = BaseProtocolAdapter<HttpDriver>;

/// One entry of the `GET /devices` listing.
#[derive(Debug, Deserialize)]
struct DeviceListing {
    address: String,
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

pub struct HttpDriver {
    client: Client,
    settings: RwLock<Option<HttpSettings>>,
}

impl Default for HttpDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDriver {
    pub fn new() -> Self {
        Self::with_client(Client::builder().build().unwrap_or_default())
    }

    /// Use a preconfigured client (proxies, TLS roots).
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            settings: RwLock::new(None),
        }
    }

    fn settings(&self) -> AdapterResult<HttpSettings> {
        self.settings.read().clone().ok_or(AdapterError::NotInitialized)
    }

    fn device_url(base_url: &str, address: &str, leaf: &str) -> String {
        format!("{}/devices/{}/{}", base_url, urlencoding::encode(address), leaf)
    }

    fn request(&self, settings: &HttpSettings, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder;
        for (key, value) in &settings.headers {
            builder = builder.header(key, value);
        }
        if let Some(token) = &settings.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn health_check(&self) -> AdapterResult<()> {
        let settings = self.settings()?;
        let url = format!("{}/health", settings.base_url);
        let response = self
            .request(&settings, self.client.get(&url))
            .send()
            .await
            .map_err(|e| AdapterError::Connection(format!("HTTP request failed: {}", e)))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AdapterError::Connection(format!(
                "Health check returned {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl ProtocolDriver for HttpDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn configure(&self, config: &AdapterConfig) -> AdapterResult<()> {
        let ProtocolSettings::Http(settings) = &config.settings else {
            return Err(AdapterError::Configuration(format!(
                "HTTP driver given {} settings",
                config.protocol()
            )));
        };
        if !(settings.base_url.starts_with("http://") || settings.base_url.starts_with("https://")) {
            return Err(AdapterError::Configuration(format!(
                "Invalid base URL: {}",
                settings.base_url
            )));
        }
        let mut settings = settings.clone();
        settings.base_url = settings.base_url.trim_end_matches('/').to_string();
        *self.settings.write() = Some(settings);
        Ok(())
    }

    async fn connect(&self, _sink: StateSink) -> AdapterResult<()> {
        self.health_check().await
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        Ok(())
    }

    async fn send(&self, command: &ProtocolCommand) -> AdapterResult<()> {
        let settings = self.settings()?;
        let url = Self::device_url(&settings.base_url, &command.address, "commands");
        let body = json!({
            "command": command.command,
            "parameters": command.parameters,
        });
        let response = self
            .request(&settings, self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Communication(format!("HTTP command failed: {}", e)))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(AdapterError::DeviceNotFound(command.address.clone())),
            status => Err(AdapterError::Communication(format!(
                "HTTP command error: {}",
                status
            ))),
        }
    }

    async fn ping(&self) -> AdapterResult<()> {
        self.health_check().await
    }

    async fn discover(&self) -> AdapterResult<Vec<DiscoveredDevice>> {
        let settings = self.settings()?;
        let url = format!("{}/devices", settings.base_url);
        let response = self
            .request(&settings, self.client.get(&url))
            .send()
            .await
            .map_err(|e| AdapterError::Communication(format!("HTTP request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AdapterError::Communication(format!(
                "Device listing returned {}",
                response.status()
            )));
        }
        let listing: Vec<DeviceListing> = response
            .json()
            .await
            .map_err(|e| AdapterError::Communication(format!("Invalid device listing: {}", e)))?;
        debug!("HTTP gateway listed {} devices", listing.len());

        Ok(listing
            .into_iter()
            .map(|entry| {
                let mut device = DiscoveredDevice::new(Protocol::Http, entry.address, entry.device_type)
                    .with_capabilities(entry.capabilities);
                if let Some(name) = entry.name {
                    device = device.with_name(name);
                }
                device
            })
            .collect())
    }

    async fn read_state(&self, address: &str) -> AdapterResult<Option<DeviceState>> {
        let settings = self.settings()?;
        let url = Self::device_url(&settings.base_url, address, "state");
        let response = self
            .request(&settings, self.client.get(&url))
            .send()
            .await
            .map_err(|e| AdapterError::Communication(format!("HTTP request failed: {}", e)))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let report: Value = response
                    .json()
                    .await
                    .map_err(|e| AdapterError::Communication(format!("Invalid state body: {}", e)))?;
                Ok(Some(state_from_json(report)))
            }
            status => Err(AdapterError::Communication(format!(
                "State read returned {}",
                status
            ))),
        }
    }
}
