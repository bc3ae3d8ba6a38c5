use crate::domain::config_apply::ApplyEventEnvelope;

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: ApplyEventEnvelope);
}
