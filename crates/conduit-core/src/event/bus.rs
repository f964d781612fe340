//! Broadcast bus for `EngineEvent` lifecycle notifications.
//!
//! Publishing with no active subscribers is a no-op; slow subscribers lag
//! and miss events rather than blocking the interpreter.

use conduit_types::event::EngineEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Multi-consumer bus for instance and task lifecycle events.
///
/// Cloning the bus clones the sender, so the runner, the interpreter and
/// any number of observers can share one channel.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a subscriber that receives all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(instance_id = %event.instance_id(), ?event, "engine event");
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Drain every event currently buffered for `instance_id`.
///
/// Lagged receivers skip ahead instead of failing.
pub fn drain_for(
    receiver: &mut broadcast::Receiver<EngineEvent>,
    instance_id: Uuid,
) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) if event.instance_id() == instance_id => out.push(event),
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event subscriber lagged");
            }
            Err(_) => break,
        }
    }
    out
}
