//! In-process broadcast of [`InfraEvent`]s.
//!
//! Sweeps, backups and cache memory alerts are published here. Observers
//! that fall behind lose the oldest events rather than slowing publishers.

use tokio::sync::broadcast;

use super::InfraEvent;

/// Cloneable handle to one broadcast channel of [`InfraEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<InfraEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per observer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes `event` and returns how many observers it reached. With
    /// no observers the event is dropped.
    pub fn publish(&self, event: InfraEvent) -> usize {
        let kind = event.kind();
        let reached = self.sender.send(event).unwrap_or(0);
        tracing::trace!(event = kind, observers = reached, "infra event published");
        reached
    }

    /// New observer; sees events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InfraEvent> {
        self.sender.subscribe()
    }

    /// Live observers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
