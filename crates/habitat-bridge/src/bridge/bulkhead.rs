//! Per-protocol concurrency cap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use habitat_core::{BulkheadConfig, Protocol};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::error::{BridgeError, BridgeResult};

/// At most `max_concurrent` executions run; at most `max_queue` wait.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    protocol: Protocol,
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_queue: usize,
}

impl Bulkhead {
    pub fn new(protocol: Protocol, config: &BulkheadConfig) -> Self {
        Self {
            protocol,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_queue: config.max_queue,
        }
    }

    pub async fn acquire(&self) -> BridgeResult<OwnedSemaphorePermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }

        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.max_queue {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(BridgeError::BulkheadFull(self.protocol.clone()));
        }
        let permit = self.semaphore.clone().acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| BridgeError::ShutDown)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.semaphore.close();
    }
}
