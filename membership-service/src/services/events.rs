use async_trait::async_trait;
use service_core::error::AppError;
use tokio::sync::broadcast;

use crate::models::MembershipEvent;

/// Destination for membership-change events.
///
/// Publishing is best-effort: the orchestrator never waits on it and a
/// failure is only logged.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: MembershipEvent) -> Result<(), AppError>;
}

/// Writes each event as a structured log line.
#[derive(Debug, Default, Clone)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: MembershipEvent) -> Result<(), AppError> {
        tracing::info!(
            event_type = %event.event_type,
            group_id = %event.group_id,
            member_email = %event.member_email,
            provider = %event.provider,
            correlation_id = %event.correlation_id,
            "Membership event"
        );
        Ok(())
    }
}

/// Fans events out to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<MembershipEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: MembershipEvent) -> Result<(), AppError> {
        // No subscribers is not an error; the event is simply dropped.
        if self.sender.send(event).is_err() {
            tracing::trace!("Membership event dropped, no subscribers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MembershipAction, MembershipEventType};

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = BroadcastEventPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher
            .publish(MembershipEvent::new(
                MembershipAction::AddMember,
                "eng",
                "ada@example.com",
                "directory",
                "corr-1",
            ))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, MembershipEventType::MemberAdded);
        assert_eq!(event.group_id, "eng");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let publisher = BroadcastEventPublisher::new(1);
        let result = publisher
            .publish(MembershipEvent::new(
                MembershipAction::RemoveMember,
                "eng",
                "ada@example.com",
                "directory",
                "corr-1",
            ))
            .await;
        assert!(result.is_ok());
    }
}
