//! In-process [`EventPublisher`] over a `tokio::sync::broadcast` channel.
//!
//! Subscribers that lag behind lose the oldest events; publishing never
//! blocks the interpreter. Feeding a subscription back into
//! `WorkflowRunner::ingest` lets `emit` tasks wake `listen` tasks of other
//! instances in the same process.

use conduit_core::workflow::capability::EventPublisher;
use conduit_types::correlation::CloudEvent;
use conduit_types::error::TaskError;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<CloudEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CloudEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: CloudEvent) -> Result<(), TaskError> {
        let event_id = event.id.clone();
        let event_type = event.event_type.clone();
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::debug!(
                    event_id = event_id.as_str(),
                    event_type = event_type.as_str(),
                    receivers,
                    "event published"
                );
            }
            Err(_) => {
                tracing::debug!(
                    event_id = event_id.as_str(),
                    event_type = event_type.as_str(),
                    "event published with no subscribers"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let publisher = BroadcastPublisher::new(16);
        let mut rx = publisher.subscribe();

        let event = CloudEvent::new("billing", "invoice.paid", json!({"invoice": 12}));
        publisher.publish(event.clone()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn test_publishing_without_subscribers_succeeds() {
        let publisher = BroadcastPublisher::new(4);
        let event = CloudEvent::new("billing", "invoice.paid", json!({}));
        publisher.publish(event).await.unwrap();
    }
}
