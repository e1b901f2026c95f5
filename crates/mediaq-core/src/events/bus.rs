//! In-process fan-out of queue events over a `tokio::sync::broadcast` channel.

use tokio::sync::broadcast;

use super::{NotificationSink, QueueEvent};

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 256;

/// Broadcast-backed [`NotificationSink`]; any number of subscribers each
/// receive every event published after they subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// When the buffer is full the oldest unread events are dropped and slow
    /// receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: QueueEvent) {
        // Err only means there are no receivers right now.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NotificationSink for EventBus {
    fn emit(&self, event: QueueEvent) {
        self.publish(event);
    }
}
