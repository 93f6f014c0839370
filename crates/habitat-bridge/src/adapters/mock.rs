//! In-memory driver for tests and demos.
//!
//! Registered under the custom protocol `mock`. Connection and command
//! failures can be switched on, command latency can be injected, and state
//! changes can be pushed as if a device had reported them.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use habitat_core::{AdapterConfig, DeviceState, DiscoveredDevice, Protocol};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::adapter::{AdapterError, AdapterResult, ProtocolCommand};
use crate::base::{BaseProtocolAdapter, ProtocolDriver, StateSink};

pub const MOCK_PROTOCOL: &str = "mock";

pub type MockAdapter = BaseProtocolAdapter<MockDriver>;

#[derive(Default)]
struct MockInner {
    fail_connect: bool,
    connect_failures_left: u32,
    fail_commands: Option<String>,
    command_failures_left: u32,
    command_delay: Duration,
    fail_discovery: Option<String>,
    discovery_delay: Duration,
    connect_attempts: Vec<Instant>,
    commands: Vec<(Instant, ProtocolCommand)>,
    states: HashMap<String, DeviceState>,
    devices: BTreeMap<String, DiscoveredDevice>,
    sink: Option<StateSink>,
    connected: bool,
}

pub struct MockDriver {
    protocol: Protocol,
    inner: Mutex<MockInner>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::with_protocol(Protocol::custom(MOCK_PROTOCOL))
    }

    /// A mock standing in for another protocol.
    pub fn with_protocol(protocol: Protocol) -> Self {
        Self {
            protocol,
            inner: Mutex::new(MockInner::default()),
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.lock().fail_connect = fail;
    }

    /// Fail only the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.lock().connect_failures_left = count;
    }

    /// Fail every command with `error`, or stop failing with `None`.
    pub fn set_fail_commands(&self, error: Option<String>) {
        self.inner.lock().fail_commands = error;
    }

    /// Fail only the next `count` commands.
    pub fn fail_next_commands(&self, count: u32) {
        self.inner.lock().command_failures_left = count;
    }

    /// Fail discovery with `error`, or stop failing with `None`.
    pub fn set_fail_discovery(&self, error: Option<String>) {
        self.inner.lock().fail_discovery = error;
    }

    pub fn set_discovery_delay(&self, delay: Duration) {
        self.inner.lock().discovery_delay = delay;
    }

    pub fn set_command_delay(&self, delay: Duration) {
        self.inner.lock().command_delay = delay;
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.inner.lock().connect_attempts.clone()
    }

    /// Commands that reached the driver, in arrival order.
    pub fn executed_commands(&self) -> Vec<ProtocolCommand> {
        self.inner
            .lock()
            .commands
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn command_times(&self) -> Vec<Instant> {
        self.inner.lock().commands.iter().map(|(at, _)| *at).collect()
    }

    /// Make a device discoverable and readable.
    pub fn add_device(&self, device: DiscoveredDevice, state: DeviceState) {
        let mut inner = self.inner.lock();
        inner.states.insert(device.address.clone(), state);
        inner.devices.insert(device.address.clone(), device);
    }

    /// Report a state change as if the device had sent it.
    pub fn push_state(&self, address: &str, state: DeviceState) {
        let sink = {
            let mut inner = self.inner.lock();
            inner.states.insert(address.to_string(), state.clone());
            inner.sink.clone()
        };
        if let Some(sink) = sink {
            sink.publish(address, state);
        }
    }

    /// Simulate the link dropping while connected.
    pub fn drop_connection(&self, reason: &str) {
        let sink = {
            let mut inner = self.inner.lock();
            inner.connected = false;
            inner.sink.clone()
        };
        if let Some(sink) = sink {
            sink.connection_lost(reason);
        }
    }
}

#[async_trait]
impl ProtocolDriver for MockDriver {
    fn protocol(&self) -> Protocol {
        self.protocol.clone()
    }

    fn configure(&self, _config: &AdapterConfig) -> AdapterResult<()> {
        Ok(())
    }

    async fn connect(&self, sink: StateSink) -> AdapterResult<()> {
        let mut inner = self.inner.lock();
        inner.connect_attempts.push(Instant::now());
        if inner.fail_connect {
            return Err(AdapterError::Connection("mock connection refused".into()));
        }
        if inner.connect_failures_left > 0 {
            inner.connect_failures_left -= 1;
            return Err(AdapterError::Connection("mock connection refused".into()));
        }
        inner.sink = Some(sink);
        inner.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.sink = None;
        Ok(())
    }

    async fn send(&self, command: &ProtocolCommand) -> AdapterResult<()> {
        let delay = {
            let mut inner = self.inner.lock();
            inner.commands.push((Instant::now(), command.clone()));
            inner.command_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if let Some(error) = &inner.fail_commands {
            return Err(AdapterError::Communication(error.clone()));
        }
        if inner.command_failures_left > 0 {
            inner.command_failures_left -= 1;
            return Err(AdapterError::Communication("mock command failed".into()));
        }
        Ok(())
    }

    async fn ping(&self) -> AdapterResult<()> {
        if self.inner.lock().connected {
            Ok(())
        } else {
            Err(AdapterError::NotConnected)
        }
    }

    async fn discover(&self) -> AdapterResult<Vec<DiscoveredDevice>> {
        let (delay, failure) = {
            let inner = self.inner.lock();
            (inner.discovery_delay, inner.fail_discovery.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(AdapterError::Communication(error));
        }
        Ok(self.inner.lock().devices.values().cloned().collect())
    }

    async fn read_state(&self, address: &str) -> AdapterResult<Option<DeviceState>> {
        Ok(self.inner.lock().states.get(address).cloned())
    }
}
