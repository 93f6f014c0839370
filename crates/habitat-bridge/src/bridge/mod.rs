//! Bridge manager.
//!
//! [`BridgeManager`] owns the registered protocol adapters and the device
//! mappings, and runs every command through the same pipeline:
//!
//! ```text
//! send_command → mapping → rate limit → circuit breaker → queue
//!     → drain (batches of processing_concurrency) → bulkhead → adapter
//! ```
//!
//! Rejections at any stage come back as a failed [`CommandResult`]; the
//! caller never sees an error. Adapter state reports flow the other way:
//! they are mapped back to a device id, normalized, cached, and emitted as
//! [`BridgeEvent`]s.

pub mod breaker;
pub mod bulkhead;
pub mod error;
pub mod queue;
pub mod rate_limit;

pub use breaker::{CircuitBreaker, CircuitState};
pub use bulkhead::Bulkhead;
pub use error::{BridgeError, BridgeResult};
pub use queue::{CommandQueue, QueueStats, QueuedCommand};
pub use rate_limit::RateLimiter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use habitat_core::{
    BridgeConfig, BridgeEvent, CommandResult, DeviceCommand, DeviceMapping, DeviceState,
    DiscoveredDevice, Listener, NormalizedMessage, Protocol, StateChange, Subscribers,
    Unsubscribe,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapter::{
    AdapterHealth, AdapterResult, AdapterStatus, ProtocolAdapter, ProtocolCommand, StatusChange,
};
use crate::adapters::create_adapter;

/// Expired rate-limit windows are swept once this many devices are tracked.
const RATE_LIMIT_SWEEP_THRESHOLD: usize = 1024;

struct RegisteredAdapter {
    adapter: Arc<dyn ProtocolAdapter>,
    /// State and status listeners; empty for adapters registered as disabled.
    subscriptions: Vec<Unsubscribe>,
}

impl RegisteredAdapter {
    fn release(self) -> Arc<dyn ProtocolAdapter> {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        self.adapter
    }
}

struct BridgeInner {
    config: BridgeConfig,
    adapters: Mutex<HashMap<Protocol, RegisteredAdapter>>,
    mappings: RwLock<HashMap<String, DeviceMapping>>,
    /// `(protocol, address) → device_id`
    addresses: RwLock<HashMap<(Protocol, String), String>>,
    states: Mutex<HashMap<String, DeviceState>>,
    queue: Mutex<CommandQueue>,
    draining: AtomicBool,
    breakers: Mutex<HashMap<Protocol, CircuitBreaker>>,
    rate_limiter: Mutex<RateLimiter>,
    bulkheads: Mutex<HashMap<Protocol, Bulkhead>>,
    events: Subscribers<BridgeEvent>,
    shut_down: AtomicBool,
}

/// Routes device commands and state through protocol adapters.
///
/// Cloning is cheap; clones share the same bridge.
#[derive(Clone)]
pub struct BridgeManager {
    inner: Arc<BridgeInner>,
}

impl BridgeManager {
    /// Build a manager and register the mappings listed in `config.devices`.
    pub fn new(config: BridgeConfig) -> Self {
        let inner = Arc::new(BridgeInner {
            queue: Mutex::new(CommandQueue::new(config.message_queue.max_size)),
            rate_limiter: Mutex::new(RateLimiter::new(&config.rate_limiting)),
            adapters: Mutex::new(HashMap::new()),
            mappings: RwLock::new(HashMap::new()),
            addresses: RwLock::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
            breakers: Mutex::new(HashMap::new()),
            bulkheads: Mutex::new(HashMap::new()),
            events: Subscribers::new("bridge"),
            shut_down: AtomicBool::new(false),
            config,
        });

        let manager = Self { inner };
        for mapping in manager.inner.config.devices.clone() {
            manager.register_device_mapping(mapping);
        }
        manager
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Stop accepting commands, fail everything queued, and tear down every
    /// adapter.
    pub async fn destroy(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(category = "bridge", "Shutting down bridge");

        let pending = self.inner.queue.lock().drain_all();
        for item in pending {
            let command = item.command.clone();
            item.resolve(CommandResult::rejected(&command, BridgeError::ShutDown.to_string()));
        }

        for bulkhead in self.inner.bulkheads.lock().values() {
            bulkhead.close();
        }

        let adapters: Vec<_> = self
            .inner
            .adapters
            .lock()
            .drain()
            .map(|(_, registered)| registered.release())
            .collect();
        let results = join_all(adapters.iter().map(|adapter| adapter.destroy())).await;
        for (adapter, result) in adapters.iter().zip(results) {
            if let Err(e) = result {
                warn!(category = "bridge", protocol = %adapter.protocol(), error = %e, "Adapter destroy failed");
            }
        }

        self.inner.states.lock().clear();
        self.inner.events.clear();
    }

    // ========== Adapters ==========

    /// Register an adapter for its protocol.
    ///
    /// A protocol that is missing from the config or disabled there is
    /// registered as `disabled`: it shows up in health reports but is never
    /// initialized or connected. Re-registering a protocol replaces the old
    /// adapter.
    pub async fn register_adapter(&self, adapter: Arc<dyn ProtocolAdapter>) -> BridgeResult<()> {
        let protocol = adapter.protocol();

        let Some(config) = self.inner.config.enabled_adapter(&protocol).cloned() else {
            adapter.disable();
            info!(category = "bridge", protocol = %protocol, "Protocol not configured or disabled; adapter disabled");
            self.install_adapter(protocol, RegisteredAdapter {
                adapter,
                subscriptions: Vec::new(),
            })
            .await;
            return Ok(());
        };

        adapter.initialize(config).await?;

        let weak: Weak<BridgeInner> = Arc::downgrade(&self.inner);
        let states = adapter.subscribe_to_all(Arc::new(move |change: &StateChange| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_device_state_update(change);
            }
        }));
        let weak: Weak<BridgeInner> = Arc::downgrade(&self.inner);
        let statuses = adapter.subscribe_to_status(Arc::new(move |change: &StatusChange| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_status_change(change);
            }
        }));

        let bulkhead = &self.inner.config.fault_tolerance.bulkhead;
        if bulkhead.enabled {
            self.inner
                .bulkheads
                .lock()
                .entry(protocol.clone())
                .or_insert_with(|| Bulkhead::new(protocol.clone(), bulkhead));
        }

        info!(category = "bridge", protocol = %protocol, "Adapter registered");
        self.install_adapter(protocol, RegisteredAdapter {
            adapter,
            subscriptions: vec![states, statuses],
        })
        .await;
        Ok(())
    }

    async fn install_adapter(&self, protocol: Protocol, registered: RegisteredAdapter) {
        let incoming = Arc::as_ptr(&registered.adapter) as *const () as usize;
        let previous = self.inner.adapters.lock().insert(protocol.clone(), registered);
        if let Some(previous) = previous {
            let old = previous.release();
            if Arc::as_ptr(&old) as *const () as usize == incoming {
                return;
            }
            debug!(category = "bridge", protocol = %protocol, "Replacing registered adapter");
            if let Err(e) = old.disconnect().await {
                warn!(category = "bridge", protocol = %protocol, error = %e, "Replaced adapter failed to disconnect");
            }
        }
    }

    /// Build and register an adapter for every enabled protocol in the config.
    pub async fn register_configured_adapters(&self) -> BridgeResult<Vec<Protocol>> {
        let mut protocols: Vec<_> = self
            .inner
            .config
            .adapters
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(protocol, config)| (protocol.clone(), config.clone()))
            .collect();
        protocols.sort_by(|a, b| a.0.cmp(&b.0));

        let mut registered = Vec::with_capacity(protocols.len());
        for (protocol, config) in protocols {
            let adapter = create_adapter(&config)?;
            self.register_adapter(adapter).await?;
            registered.push(protocol);
        }
        Ok(registered)
    }

    /// Remove an adapter, disconnecting and destroying it.
    pub async fn unregister_adapter(&self, protocol: &Protocol) -> BridgeResult<()> {
        let registered = self.inner.adapters.lock().remove(protocol);
        let adapter = registered
            .ok_or_else(|| BridgeError::AdapterNotRegistered(protocol.clone()))?
            .release();
        self.inner.breakers.lock().remove(protocol);
        if let Some(bulkhead) = self.inner.bulkheads.lock().remove(protocol) {
            bulkhead.close();
        }

        adapter.destroy().await?;
        info!(category = "bridge", protocol = %protocol, "Adapter unregistered");
        Ok(())
    }

    fn active_adapters(&self) -> Vec<Arc<dyn ProtocolAdapter>> {
        let mut adapters: Vec<_> = self
            .inner
            .adapters
            .lock()
            .values()
            .map(|registered| registered.adapter.clone())
            .filter(|adapter| adapter.status() != AdapterStatus::Disabled)
            .collect();
        adapters.sort_by_key(|adapter| adapter.protocol());
        adapters
    }

    /// Connect every enabled adapter in parallel. Every outcome is reported;
    /// one adapter failing does not affect the others.
    pub async fn connect_all(&self) -> Vec<(Protocol, AdapterResult<()>)> {
        let adapters = self.active_adapters();
        let results = join_all(adapters.iter().map(|adapter| adapter.connect())).await;

        adapters
            .iter()
            .zip(results)
            .map(|(adapter, result)| {
                let protocol = adapter.protocol();
                match &result {
                    Ok(()) => {
                        info!(category = "bridge", protocol = %protocol, "Adapter connected");
                        self.inner.emit(BridgeEvent::AdapterConnected {
                            protocol: protocol.clone(),
                        });
                    }
                    Err(e) => {
                        error!(category = "bridge", protocol = %protocol, error = %e, "Adapter failed to connect");
                        self.inner.emit(BridgeEvent::AdapterError {
                            protocol: protocol.clone(),
                            error: e.to_string(),
                        });
                    }
                }
                (protocol, result)
            })
            .collect()
    }

    pub async fn disconnect_all(&self) -> Vec<(Protocol, AdapterResult<()>)> {
        let adapters = self.active_adapters();
        let results = join_all(adapters.iter().map(|adapter| adapter.disconnect())).await;

        adapters
            .iter()
            .zip(results)
            .map(|(adapter, result)| {
                let protocol = adapter.protocol();
                match &result {
                    Ok(()) => {
                        info!(category = "bridge", protocol = %protocol, "Adapter disconnected");
                        self.inner.emit(BridgeEvent::AdapterDisconnected {
                            protocol: protocol.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(category = "bridge", protocol = %protocol, error = %e, "Adapter failed to disconnect");
                        self.inner.emit(BridgeEvent::AdapterError {
                            protocol: protocol.clone(),
                            error: e.to_string(),
                        });
                    }
                }
                (protocol, result)
            })
            .collect()
    }

    pub fn adapter(&self, protocol: &Protocol) -> Option<Arc<dyn ProtocolAdapter>> {
        self.inner.adapter(protocol)
    }

    pub fn adapter_health(&self, protocol: &Protocol) -> Option<AdapterHealth> {
        self.inner.adapter(protocol).map(|adapter| adapter.health())
    }

    /// Health of every registered adapter, ordered by protocol.
    pub fn all_adapter_health(&self) -> Vec<AdapterHealth> {
        let mut adapters: Vec<_> = self
            .inner
            .adapters
            .lock()
            .values()
            .map(|registered| registered.adapter.clone())
            .collect();
        adapters.sort_by_key(|adapter| adapter.protocol());
        adapters.iter().map(|adapter| adapter.health()).collect()
    }

    // ========== Commands ==========

    /// Queue a command and wait for its outcome.
    pub async fn send_command(&self, command: DeviceCommand) -> CommandResult {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return CommandResult::rejected(&command, BridgeError::ShutDown.to_string());
        }

        let protocol = inner
            .mappings
            .read()
            .get(&command.device_id)
            .map(|mapping| mapping.protocol.clone());
        let Some(protocol) = protocol else {
            debug!(category = "bridge", device_id = %command.device_id, "Command for unmapped device");
            return CommandResult::rejected(&command, BridgeError::DeviceNotFound.to_string());
        };

        let now = Instant::now();
        let allowed = {
            let mut limiter = inner.rate_limiter.lock();
            if limiter.tracked_devices() > RATE_LIMIT_SWEEP_THRESHOLD {
                limiter.cleanup(now);
            }
            limiter.check(&command.device_id, now)
        };
        if !allowed {
            warn!(category = "bridge", device_id = %command.device_id, "Command rate limited");
            return CommandResult::rejected(&command, BridgeError::RateLimited.to_string());
        }

        if !inner.breaker_allows(&protocol, now) {
            debug!(category = "bridge", protocol = %protocol, device_id = %command.device_id, "Circuit breaker rejected command");
            return CommandResult::rejected(&command, BridgeError::CircuitOpen.to_string());
        }

        let (tx, rx) = oneshot::channel();
        let evicted = inner.queue.lock().push(QueuedCommand::new(command.clone(), tx));
        if let Some(evicted) = evicted {
            inner.reject_overflow(evicted);
        }
        inner.process_queue();

        match rx.await {
            Ok(result) => result,
            Err(_) => CommandResult::rejected(&command, BridgeError::ShutDown.to_string()),
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        let draining = self.inner.draining.load(Ordering::SeqCst);
        self.inner.queue.lock().stats(draining)
    }

    /// Breaker state for a protocol; `Closed` if it never failed.
    pub fn circuit_state(&self, protocol: &Protocol) -> CircuitState {
        self.inner
            .breakers
            .lock()
            .get(protocol)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    // ========== Devices ==========

    /// Add or replace the mapping for a device id.
    pub fn register_device_mapping(&self, mapping: DeviceMapping) {
        let key = (mapping.protocol.clone(), mapping.protocol_address.clone());
        let device_id = mapping.device_id.clone();

        let previous = self.inner.mappings.write().insert(device_id.clone(), mapping);
        let mut addresses = self.inner.addresses.write();
        if let Some(previous) = previous {
            info!(category = "bridge", device_id = %device_id, "Replacing device mapping");
            addresses.remove(&(previous.protocol, previous.protocol_address));
        }
        if let Some(other) = addresses.insert(key.clone(), device_id.clone()) {
            if other != device_id {
                warn!(
                    category = "bridge",
                    protocol = %key.0,
                    address = %key.1,
                    previous = %other,
                    device_id = %device_id,
                    "Address already mapped to another device; state now routes to the new one"
                );
            }
        }
    }

    /// Remove a device's mapping and cached state. Returns whether it existed.
    pub fn unregister_device(&self, device_id: &str) -> bool {
        let removed = self.inner.mappings.write().remove(device_id);
        let Some(mapping) = removed else {
            return false;
        };
        {
            let mut addresses = self.inner.addresses.write();
            let key = (mapping.protocol, mapping.protocol_address);
            if addresses.get(&key).map(String::as_str) == Some(device_id) {
                addresses.remove(&key);
            }
        }
        self.inner.states.lock().remove(device_id);
        debug!(category = "bridge", device_id = %device_id, "Device unregistered");
        true
    }

    pub fn device_mapping(&self, device_id: &str) -> Option<DeviceMapping> {
        self.inner.mappings.read().get(device_id).cloned()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.mappings.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cached state, or a read through the owning adapter on a miss.
    pub async fn get_device_state(&self, device_id: &str) -> BridgeResult<Option<DeviceState>> {
        let cached = self.inner.states.lock().get(device_id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let mapping = self
            .device_mapping(device_id)
            .ok_or(BridgeError::DeviceNotFound)?;
        let adapter = self.inner.dispatchable_adapter(&mapping.protocol)?;

        let Some(mut state) = adapter.get_device_state(&mapping.protocol_address).await? else {
            return Ok(None);
        };
        state.values = mapping.normalize_values(&state.values);

        self.inner
            .states
            .lock()
            .insert(device_id.to_string(), state.clone());
        Ok(Some(state))
    }

    /// Discover devices on every connected protocol. Each adapter's devices
    /// are emitted as soon as its discovery finishes; a failing adapter is
    /// logged and skipped.
    pub async fn discover_devices(&self) -> Vec<DiscoveredDevice> {
        let adapters = self.active_adapters();
        let mut pending: FuturesUnordered<_> = adapters
            .iter()
            .map(|adapter| async move { (adapter.protocol(), adapter.discover_devices().await) })
            .collect();

        let mut devices = Vec::new();
        while let Some((protocol, result)) = pending.next().await {
            match result {
                Ok(found) => {
                    info!(category = "bridge", protocol = %protocol, count = found.len(), "Discovery finished");
                    for device in &found {
                        self.inner.emit(BridgeEvent::DeviceDiscovered {
                            device: device.clone(),
                        });
                    }
                    devices.extend(found);
                }
                Err(e) => {
                    warn!(category = "bridge", protocol = %protocol, error = %e, "Discovery failed");
                }
            }
        }
        devices
    }

    /// Route an adapter state report into the cache and event stream.
    pub fn handle_device_state_update(&self, change: &StateChange) {
        self.inner.handle_device_state_update(change);
    }

    // ========== Events ==========

    pub fn subscribe(&self, listener: Listener<BridgeEvent>) -> Unsubscribe {
        self.inner.events.register_listener(listener)
    }
}

impl BridgeInner {
    fn emit(&self, event: BridgeEvent) {
        self.events.emit(&event);
    }

    fn adapter(&self, protocol: &Protocol) -> Option<Arc<dyn ProtocolAdapter>> {
        self.adapters
            .lock()
            .get(protocol)
            .map(|registered| registered.adapter.clone())
    }

    /// The adapter for `protocol`, unless it is missing or disabled.
    fn dispatchable_adapter(&self, protocol: &Protocol) -> BridgeResult<Arc<dyn ProtocolAdapter>> {
        let adapter = self
            .adapter(protocol)
            .ok_or_else(|| BridgeError::AdapterNotRegistered(protocol.clone()))?;
        if adapter.status() == AdapterStatus::Disabled {
            return Err(BridgeError::ProtocolDisabled(protocol.clone()));
        }
        Ok(adapter)
    }

    fn breaker_allows(&self, protocol: &Protocol, now: Instant) -> bool {
        let config = &self.config.fault_tolerance.circuit_breaker;
        if !config.enabled {
            return true;
        }
        self.breakers
            .lock()
            .entry(protocol.clone())
            .or_insert_with(|| CircuitBreaker::new(protocol.clone(), config))
            .allow_request(now)
    }

    fn record_outcome(&self, protocol: &Protocol, success: bool) {
        let config = &self.config.fault_tolerance.circuit_breaker;
        if !config.enabled {
            return;
        }
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(protocol.clone())
            .or_insert_with(|| CircuitBreaker::new(protocol.clone(), config));
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure(Instant::now());
        }
    }

    fn bulkhead(&self, protocol: &Protocol) -> Option<Bulkhead> {
        self.bulkheads.lock().get(protocol).cloned()
    }

    fn reject_overflow(&self, evicted: QueuedCommand) {
        warn!(
            category = "bridge",
            device_id = %evicted.command.device_id,
            priority = %evicted.command.priority,
            "Command queue full; evicting"
        );
        let command = evicted.command.clone();
        evicted.resolve(CommandResult::rejected(&command, BridgeError::QueueOverflow.to_string()));
    }

    /// Start a drain unless one is already running.
    fn process_queue(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let batch_size = inner.config.message_queue.processing_concurrency.max(1);
            loop {
                let batch = inner.queue.lock().take(batch_size);
                if batch.is_empty() {
                    inner.draining.store(false, Ordering::Release);
                    // Something may have been queued after the empty take.
                    let refilled = !inner.queue.lock().is_empty();
                    if refilled && !inner.draining.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    break;
                }

                debug!(category = "bridge", batch = batch.len(), "Processing command batch");
                join_all(batch.into_iter().map(|item| inner.execute_command(item))).await;
            }
        });
    }

    async fn execute_command(self: &Arc<Self>, mut item: QueuedCommand) {
        let command = item.command.clone();
        let started = Instant::now();

        let mapping = self.mappings.read().get(&command.device_id).cloned();
        let Some(mapping) = mapping else {
            let result = CommandResult::rejected(&command, BridgeError::DeviceNotFound.to_string());
            self.emit(BridgeEvent::CommandCompleted {
                result: result.clone(),
            });
            item.resolve(result);
            return;
        };

        self.emit(BridgeEvent::CommandSent {
            command: command.clone(),
            attempt: item.retries,
        });

        let outcome = self.dispatch(&command, &mapping).await;
        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => CommandResult::failed(
                &command.device_id,
                &command.command,
                started.elapsed(),
                e.to_string(),
            ),
        };
        result.device_id = command.device_id.clone();
        result.command = command.command.clone();

        self.record_outcome(&mapping.protocol, result.success);

        let retry_policy = &self.config.message_queue.retry_policy;
        if !result.success
            && item.retries < retry_policy.max_retries
            && !self.shut_down.load(Ordering::SeqCst)
        {
            let delay = retry_policy.delay_for(item.retries);
            item.retries += 1;
            debug!(
                category = "bridge",
                device_id = %command.device_id,
                retry = item.retries,
                delay_ms = delay.as_millis() as u64,
                error = result.error.as_deref().unwrap_or_default(),
                "Command failed; retrying"
            );
            self.schedule_retry(item, mapping.protocol.clone(), delay);
            return;
        }

        if !result.success {
            warn!(
                category = "bridge",
                device_id = %command.device_id,
                command = %command.command,
                retries = item.retries,
                error = result.error.as_deref().unwrap_or_default(),
                "Command failed"
            );
        }
        self.emit(BridgeEvent::CommandCompleted {
            result: result.clone(),
        });
        item.resolve(result);
    }

    async fn dispatch(&self, command: &DeviceCommand, mapping: &DeviceMapping) -> BridgeResult<CommandResult> {
        let adapter = self.dispatchable_adapter(&mapping.protocol)?;
        let _permit = match self.bulkhead(&mapping.protocol) {
            Some(bulkhead) => Some(bulkhead.acquire().await?),
            None => None,
        };
        let protocol_command = ProtocolCommand::from_device(command, mapping);
        Ok(adapter.send_command(protocol_command).await)
    }

    /// Re-queue `item` at the head after `delay`. A retry that comes due
    /// while its protocol's breaker is open fails fast instead.
    fn schedule_retry(
        self: &Arc<Self>,
        item: QueuedCommand,
        protocol: Protocol,
        delay: std::time::Duration,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.shut_down.load(Ordering::SeqCst) {
                let command = item.command.clone();
                item.resolve(CommandResult::rejected(&command, BridgeError::ShutDown.to_string()));
                return;
            }
            if !inner.breaker_allows(&protocol, Instant::now()) {
                debug!(
                    category = "bridge",
                    protocol = %protocol,
                    device_id = %item.command.device_id,
                    retries = item.retries,
                    "Circuit breaker open; dropping retry"
                );
                let result =
                    CommandResult::rejected(&item.command, BridgeError::CircuitOpen.to_string());
                inner.emit(BridgeEvent::CommandCompleted {
                    result: result.clone(),
                });
                item.resolve(result);
                return;
            }
            let evicted = inner.queue.lock().push_front(item);
            if let Some(evicted) = evicted {
                inner.reject_overflow(evicted);
            }
            inner.process_queue();
        });
    }

    /// Turn an adapter's own status transition into a bridge event.
    fn handle_status_change(&self, change: &StatusChange) {
        let protocol = change.protocol.clone();
        let event = match change.status {
            AdapterStatus::Connected => {
                info!(category = "bridge", protocol = %protocol, "Adapter reconnected");
                BridgeEvent::AdapterConnected { protocol }
            }
            AdapterStatus::Disconnected => BridgeEvent::AdapterDisconnected { protocol },
            AdapterStatus::Error => {
                let error = change
                    .error
                    .clone()
                    .unwrap_or_else(|| change.status.to_string());
                warn!(category = "bridge", protocol = %protocol, error = %error, "Adapter error");
                BridgeEvent::AdapterError { protocol, error }
            }
            _ => return,
        };
        self.emit(event);
    }

    fn handle_device_state_update(&self, change: &StateChange) {
        let key = (change.protocol.clone(), change.address.clone());
        let device_id = self.addresses.read().get(&key).cloned();
        let Some(device_id) = device_id else {
            debug!(category = "bridge", protocol = %change.protocol, address = %change.address, "State for unmapped address dropped");
            return;
        };
        let mapping = self.mappings.read().get(&device_id).cloned();
        let Some(mapping) = mapping else {
            return;
        };

        let values = mapping.normalize_values(&change.state.values);
        let observed = DeviceState {
            values: values.clone(),
            ..change.state.clone()
        };

        let state = {
            let mut states = self.states.lock();
            match states.get_mut(&device_id) {
                Some(existing) => {
                    existing.replace(observed);
                    existing.clone()
                }
                None => {
                    states.insert(device_id.clone(), observed.clone());
                    observed
                }
            }
        };

        self.emit(BridgeEvent::MessageNormalized {
            message: NormalizedMessage {
                device_id: device_id.clone(),
                protocol: change.protocol.clone(),
                address: change.address.clone(),
                online: change.state.online,
                values,
                timestamp: change.state.last_seen,
            },
        });
        self.emit(BridgeEvent::DeviceState { device_id, state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockAdapter, MockDriver};
    use std::time::Duration;
    use habitat_core::{AdapterConfig, PropertyMapping, ValueTransform};
    use serde_json::json;

    fn mock_config() -> BridgeConfig {
        BridgeConfig::default()
            .with_adapter(AdapterConfig::custom("mock"))
            .with_device(DeviceMapping::new("lamp", Protocol::custom("mock"), "lamp-1").with_property(
                "on",
                PropertyMapping::new("power").with_transform(ValueTransform::Map {
                    values: HashMap::from([("ON".to_string(), json!(true)), ("OFF".to_string(), json!(false))]),
                }),
            ))
    }

    async fn bridge_with_mock() -> (BridgeManager, Arc<MockAdapter>) {
        let bridge = BridgeManager::new(mock_config());
        let adapter = MockAdapter::new(MockDriver::new());
        bridge.register_adapter(adapter.clone()).await.unwrap();
        bridge.connect_all().await;
        (bridge, adapter)
    }

    #[tokio::test]
    async fn test_unconfigured_protocol_registered_disabled() {
        let bridge = BridgeManager::new(BridgeConfig::default());
        let adapter = MockAdapter::new(MockDriver::new());
        bridge.register_adapter(adapter.clone()).await.unwrap();

        assert_eq!(adapter.status(), AdapterStatus::Disabled);
        assert!(bridge.connect_all().await.is_empty());
        let health = bridge.all_adapter_health();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].status, AdapterStatus::Disabled);
    }

    #[tokio::test]
    async fn test_command_to_disabled_protocol_fails() {
        let mut config =
            BridgeConfig::default().with_device(DeviceMapping::new("lamp", Protocol::custom("mock"), "lamp-1"));
        config.message_queue.retry_policy.max_retries = 0;
        let bridge = BridgeManager::new(config);
        bridge
            .register_adapter(MockAdapter::new(MockDriver::new()))
            .await
            .unwrap();

        let result = bridge.send_command(DeviceCommand::new("lamp", "turn_on")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not configured or disabled"));
    }

    #[tokio::test]
    async fn test_state_updates_normalized_and_cached() {
        let (bridge, adapter) = bridge_with_mock().await;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = bridge.subscribe(Arc::new(move |event: &BridgeEvent| {
            sink.lock().push(event.kind());
        }));

        adapter
            .driver()
            .push_state("lamp-1", DeviceState::new(true).with_value("power", "ON").with_value("watts", 7));
        adapter
            .driver()
            .push_state("unknown-9", DeviceState::new(true).with_value("power", "ON"));

        let state = bridge.get_device_state("lamp").await.unwrap().unwrap();
        assert_eq!(state.values.get("on"), Some(&json!(true)));
        assert_eq!(state.values.get("watts"), Some(&json!(7)));
        assert!(!state.values.contains_key("power"));
        assert_eq!(*events.lock(), vec!["message:normalized", "device:state"]);
    }

    #[tokio::test]
    async fn test_newer_state_replaces_cached_values() {
        let (bridge, adapter) = bridge_with_mock().await;

        adapter
            .driver()
            .push_state("lamp-1", DeviceState::new(true).with_value("power", "ON").with_value("level", 50));
        adapter
            .driver()
            .push_state("lamp-1", DeviceState::new(true).with_value("power", "OFF"));

        let state = bridge.get_device_state("lamp").await.unwrap().unwrap();
        assert_eq!(state.values.get("on"), Some(&json!(false)));
        assert!(!state.values.contains_key("level"));
        assert_eq!(state.values.len(), 1);
    }

    #[tokio::test]
    async fn test_get_device_state_reads_through() {
        let (bridge, adapter) = bridge_with_mock().await;
        adapter.driver().add_device(
            habitat_core::DiscoveredDevice::new(Protocol::custom("mock"), "lamp-1", "light"),
            DeviceState::new(true).with_value("power", "OFF"),
        );

        let state = bridge.get_device_state("lamp").await.unwrap().unwrap();
        assert_eq!(state.values.get("on"), Some(&json!(false)));
        assert!(matches!(
            bridge.get_device_state("nope").await,
            Err(BridgeError::DeviceNotFound)
        ));
    }

    #[tokio::test]
    async fn test_mapping_replacement_reroutes_state() {
        let (bridge, adapter) = bridge_with_mock().await;
        bridge.register_device_mapping(DeviceMapping::new("lamp", Protocol::custom("mock"), "lamp-2"));

        adapter
            .driver()
            .push_state("lamp-1", DeviceState::new(true).with_value("power", "ON"));
        assert!(bridge.inner.states.lock().get("lamp").is_none());

        adapter
            .driver()
            .push_state("lamp-2", DeviceState::new(true).with_value("power", "ON"));
        assert!(bridge.inner.states.lock().contains_key("lamp"));

        assert!(bridge.unregister_device("lamp"));
        assert!(!bridge.unregister_device("lamp"));
        assert!(bridge.inner.states.lock().get("lamp").is_none());
    }

    #[tokio::test]
    async fn test_discovery_emits_events() {
        let (bridge, adapter) = bridge_with_mock().await;
        adapter.driver().add_device(
            habitat_core::DiscoveredDevice::new(Protocol::custom("mock"), "fan-1", "fan"),
            DeviceState::new(true),
        );
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = found.clone();
        let _sub = bridge.subscribe(Arc::new(move |event: &BridgeEvent| {
            if let BridgeEvent::DeviceDiscovered { device } = event {
                sink.lock().push(device.address.clone());
            }
        }));

        let devices = bridge.discover_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(*found.lock(), vec!["fan-1".to_string()]);
    }

    async fn bridge_with_two_mocks() -> (BridgeManager, Arc<MockAdapter>, Arc<MockAdapter>) {
        let attic = Protocol::custom("attic");
        let bridge = BridgeManager::new(mock_config().with_adapter(AdapterConfig::custom("attic")));
        let first = MockAdapter::new(MockDriver::new());
        let second = MockAdapter::new(MockDriver::with_protocol(attic.clone()));
        first.driver().add_device(
            habitat_core::DiscoveredDevice::new(Protocol::custom("mock"), "fan-1", "fan"),
            DeviceState::new(true),
        );
        second.driver().add_device(
            habitat_core::DiscoveredDevice::new(attic, "sensor-1", "sensor"),
            DeviceState::new(true),
        );
        bridge.register_adapter(first.clone()).await.unwrap();
        bridge.register_adapter(second.clone()).await.unwrap();
        bridge.connect_all().await;
        (bridge, first, second)
    }

    fn record_discovered(bridge: &BridgeManager) -> (Arc<Mutex<Vec<String>>>, Unsubscribe) {
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = found.clone();
        let handle = bridge.subscribe(Arc::new(move |event: &BridgeEvent| {
            if let BridgeEvent::DeviceDiscovered { device } = event {
                sink.lock().push(device.address.clone());
            }
        }));
        (found, handle)
    }

    #[tokio::test]
    async fn test_discovery_failure_isolated() {
        let (bridge, first, _second) = bridge_with_two_mocks().await;
        first.driver().set_fail_discovery(Some("bus scan failed".into()));
        let (found, _sub) = record_discovered(&bridge);

        let devices = bridge.discover_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "sensor-1");
        assert_eq!(*found.lock(), vec!["sensor-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovered_devices_emitted_per_adapter() {
        let (bridge, first, _second) = bridge_with_two_mocks().await;
        first.driver().set_discovery_delay(Duration::from_secs(2));
        let (found, _sub) = record_discovered(&bridge);

        let running = bridge.clone();
        let discovery = tokio::spawn(async move { running.discover_devices().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*found.lock(), vec!["sensor-1".to_string()]);

        let devices = discovery.await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(*found.lock(), vec!["sensor-1".to_string(), "fan-1".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_adapter() {
        let (bridge, adapter) = bridge_with_mock().await;
        bridge.unregister_adapter(&Protocol::custom("mock")).await.unwrap();
        assert!(!adapter.is_connected());
        assert!(bridge.adapter(&Protocol::custom("mock")).is_none());
        assert!(matches!(
            bridge.unregister_adapter(&Protocol::custom("mock")).await,
            Err(BridgeError::AdapterNotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_rejects_new_commands() {
        let (bridge, adapter) = bridge_with_mock().await;
        bridge.destroy().await;
        assert_eq!(adapter.status(), AdapterStatus::Disconnected);

        let result = bridge.send_command(DeviceCommand::new("lamp", "turn_on")).await;
        assert_eq!(result.error.as_deref(), Some("Bridge is shut down"));
    }
}
