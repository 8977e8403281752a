//! Typed lifecycle events
//!
//! Every observable state change in the engine is published as one `Event`
//! variant on a broadcast bus. Events for a single task are published in
//! state-machine order; cross-task interleaving is unspecified.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::constants;

/// Discriminant used for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FeatureSuggested,
    FeatureApproved,
    FeatureRejected,
    FeatureImplemented,
    TaskCreated,
    TaskAssigned,
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskRequeued,
    TaskBlocked,
    TaskRecovered,
    AgentRegistered,
    AgentDeregistered,
    AgentFailed,
    IntegrityViolation,
    ShutdownStarted,
}

/// One observable state change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    FeatureSuggested {
        feature_id: String,
    },
    FeatureApproved {
        feature_id: String,
        approved_by: String,
    },
    FeatureRejected {
        feature_id: String,
        rejected_by: String,
        reason: String,
    },
    FeatureImplemented {
        feature_id: String,
    },
    TaskCreated {
        task_id: String,
        feature_id: String,
    },
    TaskAssigned {
        task_id: String,
        agent_id: String,
    },
    TaskStarted {
        task_id: String,
        agent_id: String,
    },
    TaskProgress {
        task_id: String,
        progress_percentage: u8,
    },
    TaskCompleted {
        task_id: String,
        result: serde_json::Value,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskCancelled {
        task_id: String,
    },
    TaskRequeued {
        task_id: String,
        retry_count: u32,
    },
    TaskBlocked {
        task_id: String,
        reason: String,
    },
    TaskRecovered {
        task_id: String,
        recovery_task_id: String,
    },
    AgentRegistered {
        agent_id: String,
    },
    AgentDeregistered {
        agent_id: String,
    },
    AgentFailed {
        agent_id: String,
    },
    IntegrityViolation {
        task_ids: Vec<String>,
        detail: String,
    },
    ShutdownStarted,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::FeatureSuggested { .. } => EventKind::FeatureSuggested,
            Event::FeatureApproved { .. } => EventKind::FeatureApproved,
            Event::FeatureRejected { .. } => EventKind::FeatureRejected,
            Event::FeatureImplemented { .. } => EventKind::FeatureImplemented,
            Event::TaskCreated { .. } => EventKind::TaskCreated,
            Event::TaskAssigned { .. } => EventKind::TaskAssigned,
            Event::TaskStarted { .. } => EventKind::TaskStarted,
            Event::TaskProgress { .. } => EventKind::TaskProgress,
            Event::TaskCompleted { .. } => EventKind::TaskCompleted,
            Event::TaskFailed { .. } => EventKind::TaskFailed,
            Event::TaskCancelled { .. } => EventKind::TaskCancelled,
            Event::TaskRequeued { .. } => EventKind::TaskRequeued,
            Event::TaskBlocked { .. } => EventKind::TaskBlocked,
            Event::TaskRecovered { .. } => EventKind::TaskRecovered,
            Event::AgentRegistered { .. } => EventKind::AgentRegistered,
            Event::AgentDeregistered { .. } => EventKind::AgentDeregistered,
            Event::AgentFailed { .. } => EventKind::AgentFailed,
            Event::IntegrityViolation { .. } => EventKind::IntegrityViolation,
            Event::ShutdownStarted => EventKind::ShutdownStarted,
        }
    }
}

/// Broadcast fan-out for engine events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(constants::EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event to all current subscribers. Publishing with no
    /// subscribers is not an error; the event is simply dropped.
    pub fn publish(&self, event: Event) {
        debug!("Publishing event: {:?}", event.kind());
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Subscription limited to the given kinds; an empty list means all.
    ///
    /// Filtering happens in a forwarding task so slow consumers only lag
    /// their own channel.
    pub fn subscribe_filtered(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<Event> {
        let kinds: Vec<EventKind> = kinds.to_vec();
        let mut source = self.sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if kinds.is_empty() || kinds.contains(&event.kind()) {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Event subscriber lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::TaskCreated {
            task_id: "task_1".to_string(),
            feature_id: String::new(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::TaskCreated);
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_filtered(&[EventKind::TaskCompleted]);

        bus.publish(Event::TaskCreated {
            task_id: "task_1".to_string(),
            feature_id: String::new(),
        });
        bus.publish(Event::TaskCompleted {
            task_id: "task_1".to_string(),
            result: serde_json::Value::Null,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::TaskCompleted);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        tokio_test::block_on(async {
            let bus = EventBus::new();
            bus.publish(Event::ShutdownStarted);
        });
    }
}
