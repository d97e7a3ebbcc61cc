//! Live event fan-out
//!
//! Every connected client owns a small bounded queue. Publishing never
//! blocks: a full queue drops the event for that client, a closed queue
//! removes the client. Execution events only reach clients whose user may
//! read the action's logs.

use crate::acl::{self, AuthenticatedUser};
use crate::api::types::LogEntry;
use crate::config::{Action, Config};
use crate::executor::bindings::ActionBinding;
use crate::executor::logs::InternalLogEntry;
use crate::executor::ExecutionListener;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 10;

/// Wire envelope: `{"type": "<EventName>", "payload": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum Event {
    ExecutionStarted { log_entry: LogEntry },
    OutputChunk { execution_tracking_id: String, output: String },
    ExecutionFinished { log_entry: LogEntry },
    ConfigChanged {},
    EntityChanged {},
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ExecutionStarted { .. } => "ExecutionStarted",
            Event::OutputChunk { .. } => "OutputChunk",
            Event::ExecutionFinished { .. } => "ExecutionFinished",
            Event::ConfigChanged {} => "ConfigChanged",
            Event::EntityChanged {} => "EntityChanged",
        }
    }
}

struct Subscriber {
    id: u64,
    user: AuthenticatedUser,
    tx: mpsc::Sender<Event>,
}

/// Receiving half handed to a client connection.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, user: AuthenticatedUser) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        debug!(id, username = %user.username, "Event stream client connected");
        self.subscribers.lock().await.push(Subscriber { id, user, tx });

        Subscription { id, rx }
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().await.retain(|s| s.id != id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Sends to every client, regardless of ACLs.
    pub async fn broadcast(&self, event: Event) {
        self.publish(event, |_| true).await;
    }

    /// Sends to clients allowed to read the logs of `action`.
    pub async fn publish_for_action(&self, cfg: &Config, action: &Action, event: Event) {
        self.publish(event, |user| acl::is_allowed_logs(cfg, user, action)).await;
    }

    async fn publish<F>(&self, event: Event, allowed: F)
    where
        F: Fn(&AuthenticatedUser) -> bool,
    {
        let mut subscribers = self.subscribers.lock().await;

        subscribers.retain(|sub| {
            if !allowed(&sub.user) {
                return true;
            }

            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(id = sub.id, event = event.name(), "Event stream client is not keeping up, dropping event");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(id = sub.id, "Event stream client went away");
                    false
                }
            }
        });
    }
}

#[async_trait]
impl ExecutionListener for EventBus {
    async fn on_execution_started(&self, cfg: &Config, entry: &InternalLogEntry) {
        if let Some(binding) = &entry.binding {
            let event = Event::ExecutionStarted {
                log_entry: LogEntry::from_internal(entry),
            };
            self.publish_for_action(cfg, &binding.action, event).await;
        }
    }

    async fn on_output_chunk(&self, cfg: &Config, tracking_id: &str, binding: &Arc<ActionBinding>, chunk: &str) {
        let event = Event::OutputChunk {
            execution_tracking_id: tracking_id.to_string(),
            output: chunk.to_string(),
        };
        self.publish_for_action(cfg, &binding.action, event).await;
    }

    async fn on_execution_finished(&self, cfg: &Config, entry: &InternalLogEntry) {
        if let Some(binding) = &entry.binding {
            let event = Event::ExecutionFinished {
                log_entry: LogEntry::from_internal(entry),
            };
            self.publish_for_action(cfg, &binding.action, event).await;
        }
    }

    async fn on_action_map_rebuilt(&self) {
        self.broadcast(Event::ConfigChanged {}).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn locked_down() -> Config {
        serde_yaml_ng::from_str(
            r#"
defaultPermissions: { logs: false }
accessControlLists:
  - name: ops
    matchUsernames: [olive]
    addToEveryAction: true
    permissions: { logs: true }
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let cfg = locked_down();
        let bus = EventBus::new();
        let mut a = bus.subscribe(AuthenticatedUser::guest(&cfg)).await;
        let mut b = bus.subscribe(AuthenticatedUser::resolve(&cfg, "olive", "", "local", "")).await;

        bus.broadcast(Event::EntityChanged {}).await;

        assert_eq!(a.rx.recv().await.unwrap().name(), "EntityChanged");
        assert_eq!(b.rx.recv().await.unwrap().name(), "EntityChanged");
    }

    #[tokio::test]
    async fn test_action_events_respect_log_acl() {
        let cfg = locked_down();
        let bus = EventBus::new();
        let mut guest = bus.subscribe(AuthenticatedUser::guest(&cfg)).await;
        let mut olive = bus.subscribe(AuthenticatedUser::resolve(&cfg, "olive", "", "local", "")).await;

        let action = Action { title: "x".into(), ..Default::default() };
        let chunk = Event::OutputChunk {
            execution_tracking_id: "t".into(),
            output: "hi".into(),
        };
        bus.publish_for_action(&cfg, &action, chunk.clone()).await;

        assert_eq!(olive.rx.recv().await.unwrap(), chunk);
        assert!(guest.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_closed_queue_unsubscribes() {
        let cfg = Config::default();
        let bus = EventBus::new();
        let mut slow = bus.subscribe(AuthenticatedUser::guest(&cfg)).await;
        let gone = bus.subscribe(AuthenticatedUser::guest(&cfg)).await;
        drop(gone.rx);

        for _ in 0..SUBSCRIBER_QUEUE_CAPACITY + 5 {
            bus.broadcast(Event::ConfigChanged {}).await;
        }

        assert_eq!(bus.subscriber_count().await, 1);

        let mut received = 0;
        while slow.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_CAPACITY);
    }

    #[test]
    fn test_envelope_shape() {
        let json = serde_json::to_value(Event::OutputChunk {
            execution_tracking_id: "abc".into(),
            output: "hello".into(),
        })
        .unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "type": "OutputChunk",
                "payload": {"executionTrackingId": "abc", "output": "hello"}
            })
        );
        assert_eq!(
            serde_json::to_value(Event::ConfigChanged {}).unwrap(),
            serde_json::json!({"type": "ConfigChanged", "payload": {}})
        );
    }
}
