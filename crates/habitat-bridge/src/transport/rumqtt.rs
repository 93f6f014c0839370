//! MQTT transport over `rumqttc`.
//!
//! Each `connect` builds a fresh client and event loop. The loop runs as a
//! background task; `connect` returns once the broker acknowledged the
//! session. If the loop later fails, listeners receive
//! [`TransportEvent::Disconnected`] and the loop stops; reconnecting is the
//! adapter's job.
//!
//! Every `connect`/`disconnect` bumps a generation counter. A connect that
//! is acknowledged after a newer call started is discarded, so at most one
//! event loop is ever installed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use habitat_core::{Listener, MqttSettings, Subscribers, Unsubscribe};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Transport, TransportError, TransportEvent};

/// Capacity of the request channel between client and event loop.
const REQUEST_CAPACITY: usize = 64;

pub struct RumqttTransport {
    settings: MqttSettings,
    qos: QoS,
    client: Mutex<Option<AsyncClient>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    listeners: Subscribers<TransportEvent>,
}

impl RumqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        let qos = match settings.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        };
        Self {
            settings,
            qos,
            client: Mutex::new(None),
            event_loop: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            listeners: Subscribers::new("mqtt-transport"),
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = self
            .settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("habitat-{}", Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, &self.settings.host, self.settings.port);
        options.set_keep_alive(Duration::from_secs(self.settings.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&self.settings.username, &self.settings.password) {
            options.set_credentials(user, pass);
        }
        options
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.client.lock().clone().ok_or(TransportError::NotConnected)
    }

    fn stop_event_loop(&self) {
        if let Some(task) = self.event_loop.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stop_event_loop();

        let broker = format!("{}:{}", self.settings.host, self.settings.port);
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

        let connected = self.connected.clone();
        let current = self.generation.clone();
        let listeners = self.listeners.clone();
        let task = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            let is_current = || current.load(Ordering::SeqCst) == generation;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            if is_current() {
                                connected.store(true, Ordering::SeqCst);
                            }
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Ok(()));
                            }
                        } else {
                            let reason = format!("broker refused connection: {:?}", ack.code);
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(Err(reason));
                            }
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        listeners.emit(&TransportEvent::Message {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Err(e.to_string()));
                        } else if is_current() && connected.swap(false, Ordering::SeqCst) {
                            warn!("MQTT event loop stopped: {}", e);
                            listeners.emit(&TransportEvent::Disconnected(e.to_string()));
                        }
                        break;
                    }
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                let mut event_loop = self.event_loop.lock();
                if self.generation.load(Ordering::SeqCst) != generation {
                    drop(event_loop);
                    task.abort();
                    debug!("Discarding superseded MQTT session to {}", broker);
                    return Err(TransportError::Connect(format!(
                        "{}: superseded by a newer connect or disconnect",
                        broker
                    )));
                }
                if let Some(stale) = event_loop.replace(task) {
                    stale.abort();
                }
                *self.client.lock() = Some(client);
                drop(event_loop);
                info!("Connected to MQTT broker {}", broker);
                Ok(())
            }
            Ok(Err(reason)) => {
                task.abort();
                Err(TransportError::Connect(format!("{}: {}", broker, reason)))
            }
            Err(_) => {
                task.abort();
                Err(TransportError::Connect(format!("{}: event loop ended", broker)))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!("MQTT disconnect request failed: {}", e);
            }
        }
        self.stop_event_loop();
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .subscribe(filter, self.qos)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: filter.to_string(),
                reason: e.to_string(),
            })
    }

    fn on_event(&self, listener: Listener<TransportEvent>) -> Unsubscribe {
        self.listeners.register_listener(listener)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.stop_event_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, Notify};

    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// Broker stand-in: withholds the CONNACK of the first session until
    /// `release` is notified and acks later sessions at once. Reports
    /// `(session, event)` where event is "accepted" or "closed".
    async fn spawn_broker() -> (u16, Arc<Notify>, mpsc::UnboundedReceiver<(usize, &'static str)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let release = Arc::new(Notify::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gate = release.clone();
        tokio::spawn(async move {
            let mut session = 0usize;
            while let Ok((mut stream, _)) = listener.accept().await {
                let index = session;
                session += 1;
                let gate = gate.clone();
                let events = events_tx.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let _ = events.send((index, "accepted"));
                    if index == 0 {
                        gate.notified().await;
                    }
                    stream.write_all(&CONNACK_ACCEPTED).await.unwrap();
                    while stream.read(&mut buf).await.unwrap_or(0) > 0 {}
                    let _ = events.send((index, "closed"));
                });
            }
        });
        (port, release, events_rx)
    }

    fn transport(port: u16) -> Arc<RumqttTransport> {
        let mut settings = MqttSettings::new("127.0.0.1").with_port(port);
        settings.client_id = Some("habitat-test".to_string());
        Arc::new(RumqttTransport::new(settings))
    }

    #[tokio::test]
    async fn test_connect_installs_session() {
        let (port, release, mut events) = spawn_broker().await;
        let transport = transport(port);
        release.notify_one();

        transport.connect().await.unwrap();
        assert_eq!(events.recv().await, Some((0, "accepted")));
        assert!(transport.is_connected());
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.publish("habitat/x/set", b"{}".to_vec()).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_late_connack_does_not_replace_newer_session() {
        let (port, release, mut events) = spawn_broker().await;
        let transport = transport(port);

        let slow = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect().await }
        });
        assert_eq!(events.recv().await, Some((0, "accepted")));

        transport.connect().await.unwrap();
        assert_eq!(events.recv().await, Some((1, "accepted")));
        assert!(transport.is_connected());

        release.notify_one();
        let late = slow.await.unwrap();
        assert!(matches!(late, Err(TransportError::Connect(ref msg)) if msg.contains("superseded")));

        // The stale event loop is gone, the newer one stays up.
        assert_eq!(events.recv().await, Some((0, "closed")));
        assert!(transport.is_connected());
        transport.publish("habitat/x/set", b"{}".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_discards_pending_connect() {
        let (port, release, mut events) = spawn_broker().await;
        let transport = transport(port);

        let pending = tokio::spawn({
            let transport = transport.clone();
            async move { transport.connect().await }
        });
        assert_eq!(events.recv().await, Some((0, "accepted")));

        transport.disconnect().await.unwrap();
        release.notify_one();

        assert!(matches!(pending.await.unwrap(), Err(TransportError::Connect(_))));
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.publish("habitat/x/set", b"{}".to_vec()).await,
            Err(TransportError::NotConnected)
        ));
    }
}
