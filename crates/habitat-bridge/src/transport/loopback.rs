//! In-memory transport.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use habitat_core::{Listener, Subscribers, Unsubscribe};
use parking_lot::Mutex;

use super::{topic_matches, Transport, TransportError, TransportEvent};

/// Transport that records what is published and delivers what is injected.
#[derive(Debug)]
pub struct LoopbackTransport {
    connected: AtomicBool,
    fail_connect: AtomicBool,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    filters: Mutex<Vec<String>>,
    listeners: Subscribers<TransportEvent>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            listeners: Subscribers::new("loopback"),
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    /// Payloads published to exactly `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.filters.lock().clone()
    }

    /// Deliver an inbound message. Returns false when no subscription
    /// matches or the transport is down.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        if !self.is_connected() {
            return false;
        }
        let subscribed = self.filters.lock().iter().any(|f| topic_matches(f, topic));
        if subscribed {
            self.listeners.emit(&TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.into(),
            });
        }
        subscribed
    }

    /// Simulate the link dropping.
    pub fn drop_link(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.filters.lock().clear();
            self.listeners
                .emit(&TransportEvent::Disconnected(reason.to_string()));
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("loopback refused connection".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.filters.lock().clear();
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let mut filters = self.filters.lock();
        if !filters.iter().any(|f| f == filter) {
            filters.push(filter.to_string());
        }
        Ok(())
    }

    fn on_event(&self, listener: Listener<TransportEvent>) -> Unsubscribe {
        self.listeners.register_listener(listener)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_inject_requires_subscription() {
        let transport = LoopbackTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _handle = transport.on_event(Arc::new(move |event: &TransportEvent| {
            s.lock().push(event.clone());
        }));

        transport.connect().await.unwrap();
        assert!(!transport.inject("a/b", b"x".to_vec()));

        transport.subscribe("a/+").await.unwrap();
        assert!(transport.inject("a/b", b"x".to_vec()));
        transport.drop_link("gone");

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], TransportEvent::Disconnected("gone".into()));
    }

    #[tokio::test]
    async fn test_publish_needs_connection() {
        let transport = LoopbackTransport::new();
        assert!(matches!(
            transport.publish("t", vec![1]).await,
            Err(TransportError::NotConnected)
        ));
        transport.connect().await.unwrap();
        transport.publish("t", vec![1]).await.unwrap();
        assert_eq!(transport.published_to("t"), vec![vec![1]]);
    }
}
