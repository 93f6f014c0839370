//! Shared adapter machinery.
//!
//! [`BaseProtocolAdapter`] implements the whole [`ProtocolAdapter`] contract
//! on top of a [`ProtocolDriver`]: the status machine, reconnect backoff,
//! timeout racing, metrics and subscriber fan-out. A protocol only supplies
//! the driver hooks.
//!
//! Every driver call runs as its own task raced against a timer. When the
//! timer wins the call is reported as a timeout, but the task is left to
//! finish in the background.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use habitat_core::config::defaults;
use habitat_core::{
    AdapterConfig, CommandResult, DeviceState, DiscoveredDevice, Listener, Protocol, StateChange,
    Subscribers, Unsubscribe,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::{
    AdapterError, AdapterHealth, AdapterMetrics, AdapterResult, AdapterStatus, ProtocolAdapter,
    ProtocolCommand, StatusChange,
};

/// Protocol-specific hooks driven by [`BaseProtocolAdapter`].
///
/// Drivers use interior mutability; every hook takes `&self`.
#[async_trait]
pub trait ProtocolDriver: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    /// Validate and store settings. Called from `initialize`.
    fn configure(&self, config: &AdapterConfig) -> AdapterResult<()>;

    /// Open the connection. Observed state changes go to `sink`.
    async fn connect(&self, sink: StateSink) -> AdapterResult<()>;

    async fn disconnect(&self) -> AdapterResult<()>;

    async fn send(&self, command: &ProtocolCommand) -> AdapterResult<()>;

    async fn ping(&self) -> AdapterResult<()> {
        Ok(())
    }

    async fn discover(&self) -> AdapterResult<Vec<DiscoveredDevice>> {
        Ok(Vec::new())
    }

    async fn read_state(&self, _address: &str) -> AdapterResult<Option<DeviceState>> {
        Ok(None)
    }
}

trait SinkTarget: Send + Sync {
    fn deliver(&self, change: StateChange);
    fn link_lost(&self, reason: String);
}

struct Detached;

impl SinkTarget for Detached {
    fn deliver(&self, _change: StateChange) {}
    fn link_lost(&self, _reason: String) {}
}

/// Where a driver reports what it observes.
///
/// Holds only a weak reference to its adapter, so a driver keeping a sink
/// alive does not keep the adapter alive.
#[derive(Clone)]
pub struct StateSink {
    protocol: Protocol,
    target: Weak<dyn SinkTarget>,
}

impl StateSink {
    /// A sink that discards everything. Useful when driving a driver directly.
    pub fn detached(protocol: Protocol) -> Self {
        let target: Weak<dyn SinkTarget> = Weak::<Detached>::new();
        Self { protocol, target }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Report a device state observed at `address`.
    pub fn publish(&self, address: impl Into<String>, state: DeviceState) {
        if let Some(target) = self.target.upgrade() {
            target.deliver(StateChange {
                protocol: self.protocol.clone(),
                address: address.into(),
                state,
            });
        }
    }

    /// Report that an established connection dropped.
    pub fn connection_lost(&self, reason: impl Into<String>) {
        if let Some(target) = self.target.upgrade() {
            target.link_lost(reason.into());
        }
    }
}

impl std::fmt::Debug for StateSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSink")
            .field("protocol", &self.protocol)
            .field("attached", &(self.target.strong_count() > 0))
            .finish()
    }
}

/// Build a [`DeviceState`] from a JSON report.
///
/// Objects may carry an `online` flag and either a nested `values` object or
/// flat values; anything else is stored under `value`.
pub fn state_from_json(report: Value) -> DeviceState {
    match report {
        Value::Object(mut fields) => {
            let online = fields
                .remove("online")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            let values = match fields.remove("values") {
                Some(Value::Object(values)) => values,
                Some(other) => {
                    fields.insert("values".to_string(), other);
                    fields
                }
                None => fields,
            };
            DeviceState::new(online).with_values(values)
        }
        other => {
            let mut values = Map::new();
            values.insert("value".to_string(), other);
            DeviceState::new(true).with_values(values)
        }
    }
}

#[derive(Default)]
struct Counters {
    commands_sent: u64,
    commands_succeeded: u64,
    commands_failed: u64,
    average_latency_ms: f64,
    reconnect_count: u32,
}

impl Counters {
    fn record(&mut self, success: bool, latency: Duration) {
        if success {
            self.commands_succeeded += 1;
        } else {
            self.commands_failed += 1;
        }
        let completed = (self.commands_succeeded + self.commands_failed) as f64;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms =
            (self.average_latency_ms * (completed - 1.0) + latency_ms) / completed;
    }
}

struct AdapterState {
    status: AdapterStatus,
    config: Option<AdapterConfig>,
    counters: Counters,
    connected_since: Option<Instant>,
    last_connected: Option<DateTime<Utc>>,
    last_disconnected: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    last_command_at: Option<DateTime<Utc>>,
    reconnect_attempts: u32,
}

impl AdapterState {
    fn record_error(&mut self, error: &AdapterError) {
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Utc::now());
    }

    fn mark_disconnected(&mut self) {
        if self.connected_since.take().is_some() {
            self.last_disconnected = Some(Utc::now());
        }
    }
}

/// [`ProtocolAdapter`] built from a [`ProtocolDriver`].
pub struct BaseProtocolAdapter<D: ProtocolDriver> {
    driver: Arc<D>,
    protocol: Protocol,
    this: Weak<Self>,
    state: Mutex<AdapterState>,
    device_subscribers: Mutex<HashMap<String, Subscribers<StateChange>>>,
    all_subscribers: Subscribers<StateChange>,
    status_subscribers: Subscribers<StatusChange>,
    /// Bumped to invalidate pending reconnect timers.
    generation: AtomicU64,
}

impl<D: ProtocolDriver> BaseProtocolAdapter<D> {
    pub fn new(driver: D) -> Arc<Self> {
        let protocol = driver.protocol();
        Arc::new_cyclic(|this| Self {
            driver: Arc::new(driver),
            all_subscribers: Subscribers::new(format!("{}:all", protocol)),
            status_subscribers: Subscribers::new(format!("{}:status", protocol)),
            protocol,
            this: this.clone(),
            state: Mutex::new(AdapterState {
                status: AdapterStatus::Initializing,
                config: None,
                counters: Counters::default(),
                connected_since: None,
                last_connected: None,
                last_disconnected: None,
                last_error: None,
                last_error_at: None,
                last_command_at: None,
                reconnect_attempts: 0,
            }),
            device_subscribers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    fn sink(&self) -> StateSink {
        let target: Weak<dyn SinkTarget> = self.this.clone();
        StateSink {
            protocol: self.protocol.clone(),
            target,
        }
    }

    fn notify_status(&self, status: AdapterStatus, error: Option<String>) {
        self.status_subscribers.emit(&StatusChange {
            protocol: self.protocol.clone(),
            status,
            error,
        });
    }

    fn cancel_reconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Run a driver call as its own task, racing it against `timeout`.
    async fn run_timed<T, F, Fut>(&self, timeout: Duration, call: F) -> AdapterResult<T>
    where
        F: FnOnce(Arc<D>) -> Fut,
        Fut: Future<Output = AdapterResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::spawn(call(self.driver.clone()));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AdapterError::Other(anyhow::anyhow!(
                "{} driver task failed: {}",
                self.protocol,
                join_error
            ))),
            Err(_) => Err(AdapterError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Timeouts of the current config, failing unless connected.
    fn connected_config(&self) -> AdapterResult<AdapterConfig> {
        let state = self.state.lock();
        match state.status {
            AdapterStatus::Connected => state.config.clone().ok_or(AdapterError::NotInitialized),
            AdapterStatus::Disabled => Err(AdapterError::Disabled),
            _ => Err(AdapterError::NotConnected),
        }
    }

    /// One connection attempt, no rescheduling.
    async fn attempt_connect(&self) -> AdapterResult<()> {
        let timeout = {
            let mut state = self.state.lock();
            if state.status == AdapterStatus::Disabled {
                return Err(AdapterError::Disabled);
            }
            let timeout = match state.config.as_ref() {
                Some(config) => config.timeouts.connect(),
                None => return Err(AdapterError::NotInitialized),
            };
            state.status = AdapterStatus::Connecting;
            timeout
        };

        let sink = self.sink();
        let result = self
            .run_timed(timeout, move |driver| async move { driver.connect(sink).await })
            .await;

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.status = AdapterStatus::Connected;
                state.connected_since = Some(Instant::now());
                state.last_connected = Some(Utc::now());
                state.reconnect_attempts = 0;
                info!(protocol = %self.protocol, "Adapter connected");
                Ok(())
            }
            Err(e) => {
                if state.status != AdapterStatus::Disabled {
                    state.status = AdapterStatus::Error;
                }
                state.record_error(&e);
                warn!(protocol = %self.protocol, error = %e, "Adapter connect failed");
                Err(e)
            }
        }
    }

    /// Arm the next reconnect timer, or give up once attempts are exhausted.
    fn schedule_reconnect(&self) {
        let (delay, attempt, generation) = {
            let mut state = self.state.lock();
            if state.status == AdapterStatus::Disabled {
                return;
            }
            let policy = match state.config.as_ref() {
                Some(config) if config.reconnect.enabled => config.reconnect.clone(),
                _ => return,
            };
            if state.reconnect_attempts >= policy.max_attempts {
                state.status = AdapterStatus::Error;
                let attempts = state.reconnect_attempts;
                drop(state);
                warn!(
                    protocol = %self.protocol,
                    attempts,
                    "Reconnect attempts exhausted; adapter needs re-initialization"
                );
                self.notify_status(
                    AdapterStatus::Error,
                    Some(format!("Reconnect attempts exhausted after {}", attempts)),
                );
                return;
            }
            state.reconnect_attempts += 1;
            let attempt = state.reconnect_attempts;
            (
                policy.delay_for_attempt(attempt),
                attempt,
                self.generation.load(Ordering::SeqCst),
            )
        };

        debug!(
            protocol = %self.protocol,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let weak = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(adapter) = weak.upgrade() else {
                return;
            };
            if adapter.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            {
                let mut state = adapter.state.lock();
                if state.status == AdapterStatus::Disabled {
                    return;
                }
                state.status = AdapterStatus::Reconnecting;
                state.counters.reconnect_count += 1;
            }
            match adapter.attempt_connect().await {
                Ok(()) => {
                    info!(protocol = %adapter.protocol, attempt, "Adapter reconnected");
                    adapter.notify_status(AdapterStatus::Connected, None);
                }
                Err(_) => adapter.schedule_reconnect(),
            }
        });
    }
}

impl<D: ProtocolDriver> SinkTarget for BaseProtocolAdapter<D> {
    fn deliver(&self, change: StateChange) {
        let device = self.device_subscribers.lock().get(&change.address).cloned();
        if let Some(subscribers) = device {
            subscribers.emit(&change);
        }
        self.all_subscribers.emit(&change);
    }

    fn link_lost(&self, reason: String) {
        {
            let mut state = self.state.lock();
            if state.status != AdapterStatus::Connected {
                return;
            }
            state.status = AdapterStatus::Error;
            state.mark_disconnected();
            state.last_error = Some(reason.clone());
            state.last_error_at = Some(Utc::now());
            state.reconnect_attempts = 0;
        }
        warn!(protocol = %self.protocol, reason = %reason, "Connection lost");
        self.notify_status(AdapterStatus::Error, Some(reason));
        self.schedule_reconnect();
    }
}

#[async_trait]
impl<D: ProtocolDriver> ProtocolAdapter for BaseProtocolAdapter<D> {
    fn protocol(&self) -> Protocol {
        self.protocol.clone()
    }

    fn status(&self) -> AdapterStatus {
        self.state.lock().status
    }

    async fn initialize(&self, config: AdapterConfig) -> AdapterResult<()> {
        if config.protocol() != self.protocol {
            return Err(AdapterError::Configuration(format!(
                "{} adapter given settings for {}",
                self.protocol,
                config.protocol()
            )));
        }
        {
            let state = self.state.lock();
            match state.status {
                AdapterStatus::Disabled => return Err(AdapterError::Disabled),
                AdapterStatus::Connected | AdapterStatus::Connecting => {
                    return Err(AdapterError::Configuration(
                        "cannot re-initialize a connected adapter".into(),
                    ))
                }
                _ => {}
            }
        }

        self.driver.configure(&config)?;
        self.cancel_reconnect();

        let mut state = self.state.lock();
        state.config = Some(config);
        state.status = AdapterStatus::Disconnected;
        state.reconnect_attempts = 0;
        info!(protocol = %self.protocol, "Adapter initialized");
        Ok(())
    }

    async fn connect(&self) -> AdapterResult<()> {
        {
            let mut state = self.state.lock();
            match state.status {
                AdapterStatus::Connected => return Ok(()),
                AdapterStatus::Disabled => return Err(AdapterError::Disabled),
                _ if state.config.is_none() => return Err(AdapterError::NotInitialized),
                _ => {}
            }
            state.reconnect_attempts = 0;
        }
        self.cancel_reconnect();

        match self.attempt_connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        self.cancel_reconnect();

        let timeout = {
            let state = self.state.lock();
            match state.status {
                AdapterStatus::Initializing
                | AdapterStatus::Disconnected
                | AdapterStatus::Disabled => return Ok(()),
                _ => state
                    .config
                    .as_ref()
                    .map(|c| c.timeouts.connect())
                    .unwrap_or(Duration::from_millis(defaults::CONNECT_TIMEOUT_MS)),
            }
        };

        let result = self
            .run_timed(timeout, |driver| async move { driver.disconnect().await })
            .await;

        let mut state = self.state.lock();
        if state.status != AdapterStatus::Disabled {
            state.status = AdapterStatus::Disconnected;
        }
        state.mark_disconnected();
        if let Err(e) = &result {
            state.record_error(e);
            warn!(protocol = %self.protocol, error = %e, "Adapter disconnect failed");
        } else {
            info!(protocol = %self.protocol, "Adapter disconnected");
        }
        result
    }

    async fn destroy(&self) -> AdapterResult<()> {
        let result = self.disconnect().await;
        self.all_subscribers.clear();
        self.status_subscribers.clear();
        self.device_subscribers.lock().clear();
        debug!(protocol = %self.protocol, "Adapter destroyed");
        result
    }

    fn disable(&self) {
        self.cancel_reconnect();
        let mut state = self.state.lock();
        state.status = AdapterStatus::Disabled;
        state.mark_disconnected();
        info!(protocol = %self.protocol, "Adapter disabled");
    }

    async fn discover_devices(&self) -> AdapterResult<Vec<DiscoveredDevice>> {
        let config = self.connected_config()?;
        let devices = self
            .run_timed(config.timeouts.discovery(), |driver| async move {
                driver.discover().await
            })
            .await?;
        debug!(protocol = %self.protocol, count = devices.len(), "Discovery finished");
        Ok(devices)
    }

    async fn get_device_state(&self, address: &str) -> AdapterResult<Option<DeviceState>> {
        let config = self.connected_config()?;
        let address = address.to_string();
        self.run_timed(config.timeouts.command(), move |driver| async move {
            driver.read_state(&address).await
        })
        .await
    }

    async fn send_command(&self, command: ProtocolCommand) -> CommandResult {
        let started = Instant::now();
        let timeout = match self.connected_config() {
            Ok(config) => command.timeout.unwrap_or_else(|| config.timeouts.command()),
            Err(e) => {
                return CommandResult::failed(
                    &command.device_id,
                    &command.command,
                    Duration::ZERO,
                    e.to_string(),
                )
            }
        };

        {
            let mut state = self.state.lock();
            state.counters.commands_sent += 1;
            state.last_command_at = Some(Utc::now());
        }

        let device_id = command.device_id.clone();
        let name = command.command.clone();
        let result = self
            .run_timed(timeout, move |driver| async move { driver.send(&command).await })
            .await;
        let elapsed = started.elapsed();

        let mut state = self.state.lock();
        state.counters.record(result.is_ok(), elapsed);
        match result {
            Ok(()) => CommandResult::succeeded(device_id, name, elapsed),
            Err(e) => {
                state.record_error(&e);
                debug!(protocol = %self.protocol, device_id = %device_id, error = %e, "Command failed");
                CommandResult::failed(device_id, name, elapsed, e.to_string())
            }
        }
    }

    fn subscribe_to_device(&self, address: &str, listener: Listener<StateChange>) -> Unsubscribe {
        let subscribers = self
            .device_subscribers
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| Subscribers::new(format!("{}:{}", self.protocol, address)))
            .clone();
        subscribers.register_listener(listener)
    }

    fn subscribe_to_all(&self, listener: Listener<StateChange>) -> Unsubscribe {
        self.all_subscribers.register_listener(listener)
    }

    fn subscribe_to_status(&self, listener: Listener<StatusChange>) -> Unsubscribe {
        self.status_subscribers.register_listener(listener)
    }

    fn health(&self) -> AdapterHealth {
        let state = self.state.lock();
        let connected = state.status == AdapterStatus::Connected;
        let uptime_secs = match (connected, state.connected_since) {
            (true, Some(since)) => since.elapsed().as_secs(),
            _ => 0,
        };
        AdapterHealth {
            protocol: self.protocol.clone(),
            status: state.status,
            connected,
            last_connected: state.last_connected,
            last_disconnected: state.last_disconnected,
            last_error: state.last_error.clone(),
            last_error_at: state.last_error_at,
            last_command_at: state.last_command_at,
            metrics: AdapterMetrics {
                commands_sent: state.counters.commands_sent,
                commands_succeeded: state.counters.commands_succeeded,
                commands_failed: state.counters.commands_failed,
                average_latency_ms: state.counters.average_latency_ms,
                uptime_secs,
                reconnect_count: state.counters.reconnect_count,
            },
        }
    }

    async fn ping(&self) -> AdapterResult<Duration> {
        let config = self.connected_config()?;
        let started = Instant::now();
        self.run_timed(config.timeouts.command(), |driver| async move { driver.ping().await })
            .await?;
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{MockAdapter, MockDriver};
    use habitat_core::{AdapterTimeouts, ReconnectPolicy};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn mock_config() -> AdapterConfig {
        AdapterConfig::custom("mock").with_reconnect(ReconnectPolicy {
            enabled: true,
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        })
    }

    async fn connected_mock() -> Arc<MockAdapter> {
        let adapter = MockAdapter::new(MockDriver::new());
        adapter.initialize(mock_config()).await.unwrap();
        adapter.connect().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_lifecycle_statuses() {
        let adapter = MockAdapter::new(MockDriver::new());
        assert_eq!(adapter.status(), AdapterStatus::Initializing);
        assert!(matches!(adapter.connect().await, Err(AdapterError::NotInitialized)));

        adapter.initialize(mock_config()).await.unwrap();
        assert_eq!(adapter.status(), AdapterStatus::Disconnected);

        adapter.connect().await.unwrap();
        assert!(adapter.is_connected());
        assert!(adapter.health().last_connected.is_some());

        adapter.disconnect().await.unwrap();
        assert_eq!(adapter.status(), AdapterStatus::Disconnected);
        assert!(adapter.health().last_disconnected.is_some());
    }

    #[tokio::test]
    async fn test_initialize_rejects_foreign_settings() {
        let adapter = MockAdapter::new(MockDriver::new());
        let err = adapter
            .initialize(AdapterConfig::custom("other"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_disabled_is_terminal() {
        let adapter = MockAdapter::new(MockDriver::new());
        adapter.disable();
        assert_eq!(adapter.status(), AdapterStatus::Disabled);
        assert!(matches!(
            adapter.initialize(mock_config()).await,
            Err(AdapterError::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_command_while_disconnected() {
        let adapter = MockAdapter::new(MockDriver::new());
        adapter.initialize(mock_config()).await.unwrap();

        let result = adapter
            .send_command(ProtocolCommand::new("lamp", "dev-1", "turn_on"))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Adapter not connected"));
        assert!(adapter.driver().executed_commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_until_exhausted() {
        let driver = MockDriver::new();
        driver.set_fail_connect(true);
        let adapter = MockAdapter::new(driver);
        adapter.initialize(mock_config()).await.unwrap();

        let start = Instant::now();
        assert!(adapter.connect().await.is_err());
        assert_eq!(adapter.status(), AdapterStatus::Error);

        tokio::time::sleep(Duration::from_secs(10)).await;

        let offsets: Vec<u64> = adapter
            .driver()
            .connect_attempts()
            .iter()
            .map(|at| at.duration_since(start).as_millis() as u64)
            .collect();
        // initial attempt, then 100, 200 and 400 ms apart
        assert_eq!(offsets, vec![0, 100, 300, 700]);
        assert_eq!(adapter.status(), AdapterStatus::Error);
        assert_eq!(adapter.health().metrics.reconnect_count, 3);

        // re-initializing recovers from the terminal error
        adapter.driver().set_fail_connect(false);
        adapter.initialize(mock_config()).await.unwrap();
        adapter.connect().await.unwrap();
        assert!(adapter.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_succeeds_after_failures() {
        let driver = MockDriver::new();
        driver.fail_next_connects(2);
        let adapter = MockAdapter::new(driver);
        adapter.initialize(mock_config()).await.unwrap();

        assert!(adapter.connect().await.is_err());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(adapter.is_connected());
        assert_eq!(adapter.driver().connect_attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let driver = MockDriver::new();
        driver.set_fail_connect(true);
        let adapter = MockAdapter::new(driver);
        adapter.initialize(mock_config()).await.unwrap();

        assert!(adapter.connect().await.is_err());
        adapter.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(adapter.driver().connect_attempts().len(), 1);
        assert_eq!(adapter.status(), AdapterStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_triggers_reconnect() {
        let adapter = connected_mock().await;
        adapter.driver().drop_connection("broker went away");
        assert_eq!(adapter.status(), AdapterStatus::Error);
        assert_eq!(adapter.health().last_error.as_deref(), Some("broker went away"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(adapter.is_connected());
        assert_eq!(adapter.health().metrics.reconnect_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout_is_failure() {
        let adapter = MockAdapter::new(MockDriver::new());
        adapter
            .initialize(mock_config().with_timeouts(AdapterTimeouts {
                command_ms: 50,
                ..AdapterTimeouts::default()
            }))
            .await
            .unwrap();
        adapter.connect().await.unwrap();
        adapter.driver().set_command_delay(Duration::from_millis(200));

        let result = adapter
            .send_command(ProtocolCommand::new("lamp", "dev-1", "turn_on"))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Operation timeout after 50ms"));

        // a per-call timeout overrides the adapter default
        let result = adapter
            .send_command(
                ProtocolCommand::new("lamp", "dev-1", "turn_on")
                    .with_timeout(Duration::from_millis(500)),
            )
            .await;
        assert!(result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_average_latency() {
        let adapter = connected_mock().await;
        let driver = adapter.driver().clone();

        for delay_ms in [100u64, 300, 200] {
            driver.set_command_delay(Duration::from_millis(delay_ms));
            adapter
                .send_command(ProtocolCommand::new("lamp", "dev-1", "turn_on"))
                .await;
        }
        driver.set_fail_commands(Some("jammed".into()));
        driver.set_command_delay(Duration::from_millis(400));
        let failed = adapter
            .send_command(ProtocolCommand::new("lamp", "dev-1", "turn_on"))
            .await;
        assert!(!failed.success);

        let metrics = adapter.health().metrics;
        assert_eq!(metrics.commands_sent, 4);
        assert_eq!(metrics.commands_succeeded, 3);
        assert_eq!(metrics.commands_failed, 1);
        assert!((metrics.average_latency_ms - 250.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_while_connected() {
        let adapter = connected_mock().await;
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(adapter.health().metrics.uptime_secs, 2);

        adapter.disconnect().await.unwrap();
        assert_eq!(adapter.health().metrics.uptime_secs, 0);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_isolated() {
        let adapter = connected_mock().await;
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = adapter.subscribe_to_all(Arc::new(|_: &StateChange| panic!("bad listener")));
        let h = hits.clone();
        let _good = adapter.subscribe_to_all(Arc::new(move |_: &StateChange| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let h = hits.clone();
        let _device = adapter.subscribe_to_device(
            "dev-1",
            Arc::new(move |change: &StateChange| {
                assert_eq!(change.address, "dev-1");
                h.fetch_add(10, Ordering::SeqCst);
            }),
        );

        adapter
            .driver()
            .push_state("dev-1", DeviceState::new(true).with_value("power", "on"));
        adapter
            .driver()
            .push_state("dev-2", DeviceState::new(true).with_value("power", "off"));

        assert_eq!(hits.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_unsubscribe_device_listener() {
        let adapter = connected_mock().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = adapter.subscribe_to_device(
            "dev-1",
            Arc::new(move |_: &StateChange| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        adapter.driver().push_state("dev-1", DeviceState::new(true));
        handle.unsubscribe();
        adapter.driver().push_state("dev-1", DeviceState::new(false));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ping_and_discovery_need_connection() {
        let adapter = MockAdapter::new(MockDriver::new());
        adapter.initialize(mock_config()).await.unwrap();
        assert!(matches!(adapter.ping().await, Err(AdapterError::NotConnected)));
        assert!(matches!(
            adapter.discover_devices().await,
            Err(AdapterError::NotConnected)
        ));

        adapter.connect().await.unwrap();
        assert!(adapter.ping().await.is_ok());
    }

    #[test]
    fn test_state_from_json() {
        let state = state_from_json(json!({"online": false, "power": "on", "level": 40}));
        assert!(!state.online);
        assert_eq!(state.values.get("level"), Some(&json!(40)));
        assert!(state.values.get("online").is_none());

        let nested = state_from_json(json!({"values": {"temperature": 21.5}}));
        assert!(nested.online);
        assert_eq!(nested.values.get("temperature"), Some(&json!(21.5)));

        let scalar = state_from_json(json!("ON"));
        assert_eq!(scalar.values.get("value"), Some(&json!("ON")));
    }
}
