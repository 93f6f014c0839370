//! Bounded priority command queue.
//!
//! `critical` commands go behind already queued criticals and ahead of
//! everything else; `high` goes behind criticals and highs; `normal` and
//! `low` are appended. Retries jump to the head. When a push exceeds the
//! bound the tail item is evicted and handed back to the caller.

use std::collections::{BTreeMap, VecDeque};

use habitat_core::{CommandPriority, CommandResult, DeviceCommand};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A queued command and the channel its caller is waiting on.
#[derive(Debug)]
pub struct QueuedCommand {
    pub command: DeviceCommand,
    pub responder: oneshot::Sender<CommandResult>,
    pub retries: u32,
    pub enqueued_at: Instant,
}

impl QueuedCommand {
    pub fn new(command: DeviceCommand, responder: oneshot::Sender<CommandResult>) -> Self {
        Self {
            command,
            responder,
            retries: 0,
            enqueued_at: Instant::now(),
        }
    }

    /// Resolve the waiting caller. A caller that stopped waiting is ignored.
    pub fn resolve(self, result: CommandResult) {
        let _ = self.responder.send(result);
    }
}

/// Queue snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub length: usize,
    pub max_size: usize,
    pub draining: bool,
    pub by_priority: BTreeMap<CommandPriority, usize>,
    pub oldest_wait_ms: u64,
}

#[derive(Debug)]
pub struct CommandQueue {
    items: VecDeque<QueuedCommand>,
    max_size: usize,
}

impl CommandQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Insert by priority. Returns the evicted tail item on overflow, which
    /// may be the item just pushed.
    pub fn push(&mut self, item: QueuedCommand) -> Option<QueuedCommand> {
        let position = match item.command.priority {
            CommandPriority::Critical => self
                .items
                .iter()
                .position(|queued| queued.command.priority != CommandPriority::Critical),
            CommandPriority::High => self
                .items
                .iter()
                .position(|queued| queued.command.priority < CommandPriority::High),
            CommandPriority::Normal | CommandPriority::Low => None,
        };

        match position {
            Some(index) => self.items.insert(index, item),
            None => self.items.push_back(item),
        }
        self.evict_overflow()
    }

    /// Put a retry at the head.
    pub fn push_front(&mut self, item: QueuedCommand) -> Option<QueuedCommand> {
        self.items.push_front(item);
        self.evict_overflow()
    }

    fn evict_overflow(&mut self) -> Option<QueuedCommand> {
        if self.items.len() > self.max_size {
            self.items.pop_back()
        } else {
            None
        }
    }

    /// Take up to `n` items from the head.
    pub fn take(&mut self, n: usize) -> Vec<QueuedCommand> {
        let n = n.min(self.items.len());
        self.items.drain(..n).collect()
    }

    /// Remove everything, e.g. on shutdown.
    pub fn drain_all(&mut self) -> Vec<QueuedCommand> {
        self.items.drain(..).collect()
    }

    pub fn stats(&self, draining: bool) -> QueueStats {
        let mut by_priority = BTreeMap::new();
        for item in &self.items {
            *by_priority.entry(item.command.priority).or_insert(0) += 1;
        }
        let now = Instant::now();
        let oldest_wait_ms = self
            .items
            .iter()
            .map(|item| now.saturating_duration_since(item.enqueued_at).as_millis() as u64)
            .max()
            .unwrap_or(0);

        QueueStats {
            length: self.items.len(),
            max_size: self.max_size,
            draining,
            by_priority,
            oldest_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: &str, priority: CommandPriority) -> (QueuedCommand, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        (
            QueuedCommand::new(DeviceCommand::new(id, "turn_on").with_priority(priority), tx),
            rx,
        )
    }

    fn order(queue: &mut CommandQueue) -> Vec<String> {
        queue
            .take(usize::MAX)
            .into_iter()
            .map(|item| item.command.device_id)
            .collect()
    }

    #[test]
    fn test_priority_ordering() {
        let mut queue = CommandQueue::new(10);
        for (id, priority) in [
            ("n1", CommandPriority::Normal),
            ("c1", CommandPriority::Critical),
            ("l1", CommandPriority::Low),
            ("h1", CommandPriority::High),
            ("c2", CommandPriority::Critical),
            ("h2", CommandPriority::High),
            ("n2", CommandPriority::Normal),
        ] {
            assert!(queue.push(queued(id, priority).0).is_none());
        }
        assert_eq!(order(&mut queue), vec!["c1", "c2", "h1", "h2", "n1", "l1", "n2"]);
    }

    #[test]
    fn test_retry_goes_to_head() {
        let mut queue = CommandQueue::new(10);
        queue.push(queued("c1", CommandPriority::Critical).0);
        let (mut retry, _rx) = queued("r", CommandPriority::Low);
        retry.retries = 1;
        queue.push_front(retry);
        assert_eq!(order(&mut queue), vec!["r", "c1"]);
    }

    #[test]
    fn test_overflow_evicts_tail() {
        let mut queue = CommandQueue::new(2);
        queue.push(queued("a", CommandPriority::Low).0);
        queue.push(queued("b", CommandPriority::Low).0);
        let evicted = queue.push(queued("c", CommandPriority::Low).0).unwrap();
        assert_eq!(evicted.command.device_id, "c");
        assert_eq!(queue.len(), 2);

        // A critical displaces the last low item instead.
        let evicted = queue.push(queued("x", CommandPriority::Critical).0).unwrap();
        assert_eq!(evicted.command.device_id, "b");
        assert_eq!(order(&mut queue), vec!["x", "a"]);
    }

    #[test]
    fn test_take_in_batches() {
        let mut queue = CommandQueue::new(10);
        for id in ["a", "b", "c"] {
            queue.push(queued(id, CommandPriority::Normal).0);
        }
        assert_eq!(queue.take(2).len(), 2);
        assert_eq!(queue.take(2).len(), 1);
        assert!(queue.take(2).is_empty());
    }

    #[tokio::test]
    async fn test_resolve_reaches_caller() {
        let (item, rx) = queued("a", CommandPriority::Normal);
        let command = item.command.clone();
        item.resolve(CommandResult::rejected(&command, "Queue overflow"));
        let result = rx.await.unwrap();
        assert_eq!(result.error.as_deref(), Some("Queue overflow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let mut queue = CommandQueue::new(5);
        queue.push(queued("a", CommandPriority::High).0);
        tokio::time::advance(std::time::Duration::from_millis(40)).await;
        queue.push(queued("b", CommandPriority::Low).0);
        queue.push(queued("c", CommandPriority::Low).0);

        let stats = queue.stats(false);
        assert_eq!(stats.length, 3);
        assert_eq!(stats.max_size, 5);
        assert_eq!(stats.by_priority.get(&CommandPriority::Low), Some(&2));
        assert_eq!(stats.by_priority.get(&CommandPriority::High), Some(&1));
        assert_eq!(stats.oldest_wait_ms, 40);
    }
}
