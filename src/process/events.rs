use crate::types::Operation;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    StepProcessed {
        operation: Operation,
        stage: String,
        step: String,
        retry_after: Duration,
        error: Option<String>,
    },
    OperationSucceeded {
        operation: Operation,
    },
    OperationFailed {
        operation: Operation,
        reason: String,
    },
}

impl OperationEvent {
    #[must_use]
    pub const fn operation(&self) -> &Operation {
        match self {
            Self::StepProcessed { operation, .. }
            | Self::OperationSucceeded { operation }
            | Self::OperationFailed { operation, .. } => operation,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StepProcessed { .. } => "step_processed",
            Self::OperationSucceeded { .. } => "operation_succeeded",
            Self::OperationFailed { .. } => "operation_failed",
        }
    }
}

/// Receiver of lifecycle notifications. Publishing never blocks processing.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: OperationEvent);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: OperationEvent) {}
}

/// Fan-out of events to any number of subscribers.
///
/// Slow subscribers lose the oldest events rather than stall publishers.
#[derive(Debug, Clone)]
pub struct EventBroker {
    sender: broadcast::Sender<OperationEvent>,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBroker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for EventBroker {
    fn publish(&self, event: OperationEvent) {
        let kind = event.kind();
        let operation_id = event.operation().id.clone();
        if self.sender.send(event).is_err() {
            debug!("No subscribers for {} event of operation {}", kind, operation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

    use super::{EventBroker, EventSink, OperationEvent};
    use crate::types::{InstanceId, Operation, OperationId, OperationType};

    fn given_event() -> OperationEvent {
        OperationEvent::OperationSucceeded {
            operation: Operation::new(
                OperationId::new("op-1"),
                OperationType::Update,
                InstanceId::new("inst-1"),
                chrono::Utc::now(),
            ),
        }
    }

    #[tokio::test]
    async fn when_event_is_published_then_every_subscriber_receives_it() {
        let broker = EventBroker::new(8);
        let mut first = broker.subscribe();
        let mut second = broker.subscribe();

        broker.publish(given_event());

        assert_eq!(first.recv().await.unwrap().kind(), "operation_succeeded");
        assert_eq!(second.recv().await.unwrap().operation().id.value(), "op-1");
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        EventBroker::default().publish(given_event());
    }
}
