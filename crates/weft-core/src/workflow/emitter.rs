//! Broadcast emitter for the observation channels of one run.
//!
//! Built on `tokio::sync::broadcast`, with one channel per concern:
//! - `watch`: aggregated state updates (`WatchEvent`)
//! - `watch-v2`: discrete lifecycle events (`WorkflowEvent`)
//! - user events: external signals consumed by `waitForEvent` entries
//!
//! Publishing with no active subscribers is a no-op.

use serde_json::Value;
use tokio::sync::broadcast;
use weft_types::event::{WatchEvent, WorkflowEvent};

/// Named external signal delivered through [`Emitter::send_user_event`].
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    pub name: String,
    pub data: Value,
}

/// Multi-consumer emitter for a single run.
///
/// Cloning the emitter clones the senders, so every clone publishes to the
/// same subscribers.
#[derive(Clone)]
pub struct Emitter {
    watch: broadcast::Sender<WatchEvent>,
    events: broadcast::Sender<WorkflowEvent>,
    user_events: broadcast::Sender<UserEvent>,
}

impl Emitter {
    /// Create an emitter whose channels each hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (watch, _) = broadcast::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        let (user_events, _) = broadcast::channel(capacity);
        Self {
            watch,
            events,
            user_events,
        }
    }

    pub fn subscribe_watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_user_events(&self) -> broadcast::Receiver<UserEvent> {
        self.user_events.subscribe()
    }

    pub fn emit_watch(&self, event: WatchEvent) {
        let _ = self.watch.send(event);
    }

    pub fn emit_event(&self, event: WorkflowEvent) {
        let _ = self.events.send(event);
    }

    /// Deliver a named user event to every waiting `waitForEvent` entry.
    pub fn send_user_event(&self, name: impl Into<String>, data: Value) {
        let _ = self.user_events.send(UserEvent {
            name: name.into(),
            data,
        });
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("watch_receivers", &self.watch.receiver_count())
            .field("event_receivers", &self.events.receiver_count())
            .field("user_event_receivers", &self.user_events.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::event::RunEventPayload;

    fn start_event() -> WorkflowEvent {
        WorkflowEvent::Start {
            payload: RunEventPayload {
                run_id: "run-1".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let emitter = Emitter::new(16);
        let mut rx = emitter.subscribe_events();

        emitter.emit_event(start_event());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, WorkflowEvent::Start { .. }));
    }

    #[tokio::test]
    async fn user_events_reach_every_subscriber() {
        let emitter = Emitter::new(16);
        let mut rx1 = emitter.subscribe_user_events();
        let mut rx2 = emitter.subscribe_user_events();

        emitter.send_user_event("approved", json!({"by": "ops"}));

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.name, "approved");
        assert_eq!(e2.data, json!({"by": "ops"}));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let emitter = Emitter::new(16);
        emitter.emit_event(start_event());
        emitter.send_user_event("nobody", Value::Null);
    }

    #[tokio::test]
    async fn lagged_receiver_handles_gracefully() {
        let emitter = Emitter::new(2);
        let mut rx = emitter.subscribe_events();

        for _ in 0..10 {
            emitter.emit_event(start_event());
        }

        match rx.try_recv() {
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn clone_shares_channels() {
        let emitter = Emitter::new(16);
        let clone = emitter.clone();
        let mut rx = emitter.subscribe_events();

        clone.emit_event(start_event());

        assert!(rx.try_recv().is_ok());
        let debug = format!("{emitter:?}");
        assert!(debug.contains("event_receivers"));
    }
}
