use crate::domain::config_apply::ApplyEventEnvelope;
use crate::ports::bus::EventPublisher;
use tokio::sync::broadcast;
use tracing::trace;

/// In-process fan-out of apply events. Publishing never blocks; slow
/// subscribers observe a lag instead.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<ApplyEventEnvelope>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApplyEventEnvelope> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastBus {
    fn publish(&self, event: ApplyEventEnvelope) {
        let kind = event.event.kind();
        if self.sender.send(event).is_err() {
            trace!(kind, "no subscribers for apply event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config_apply::ApplyEvent;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = BroadcastBus::new(4);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.publish(ApplyEventEnvelope::new(
            "corr",
            ApplyEvent::Pending {
                config_id: "cfg".into(),
            },
        ));
        assert_eq!(first.recv().await.unwrap().event.kind(), "apply.pending");
        assert_eq!(second.recv().await.unwrap().correlation_id, "corr");
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        BroadcastBus::new(1).publish(ApplyEventEnvelope::new(
            "corr",
            ApplyEvent::NoChange {
                config_id: "cfg".into(),
            },
        ));
    }
}
