// Typed event channel — one producer side shared by the core's components,
// any number of subscribers. Handlers run on the receiving task, never on a
// session actor.

use crate::message::{Message, MessageStatus};
use crate::relay::{Alert, FailoverReport};
use crate::sync::SyncStats;
use crate::transport::LinkState;
use tokio::sync::broadcast;
use tracing::debug;

/// Events the core emits to subscribers
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A decrypted incoming message, delivered in causal order per session
    MessageReceived {
        message: Message,
        plaintext: Vec<u8>,
    },
    /// A message's status advanced
    StatusChanged {
        message_id: String,
        session_id: String,
        status: MessageStatus,
        at: u64,
    },
    /// A reaction edge was added or removed
    ReactionChanged {
        message_id: String,
        session_id: String,
        reactor: String,
        emoji: String,
        added: bool,
    },
    /// A failover finished
    FailoverCompleted(FailoverReport),
    /// A sync round finished
    SyncCompleted(SyncStats),
    /// A health threshold was breached
    HealthAlert(Alert),
    /// A frame was dropped (unknown type, decrypt failure, malformed body)
    ProtocolViolation { detail: String },
    /// The primary link changed state
    ConnectionChanged {
        endpoint_id: String,
        state: LinkState,
    },
}

impl CoreEvent {
    /// Session this event belongs to, if it is session-scoped
    pub fn session_id(&self) -> Option<&str> {
        match self {
            CoreEvent::MessageReceived { message, .. } => Some(&message.session_id),
            CoreEvent::StatusChanged { session_id, .. } => Some(session_id),
            CoreEvent::ReactionChanged { session_id, .. } => Some(session_id),
            CoreEvent::SyncCompleted(stats) => Some(&stats.session_id),
            _ => None,
        }
    }
}

/// Bounded broadcast fan-out. Slow subscribers lag and skip, they never
/// back-pressure the core.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn emit(&self, event: CoreEvent) {
        // No receivers is fine — events are observational
        let _ = self.tx.send(event);
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Subscription filtered to one session's events (global events like
    /// failover reports pass through as well)
    pub fn subscribe_session(&self, session_id: &str) -> Subscription {
        Subscription {
            session_id: Some(session_id.to_string()),
            rx: self.tx.subscribe(),
        }
    }
}

/// A filtered event stream handed to application code
pub struct Subscription {
    session_id: Option<String>,
    rx: broadcast::Receiver<CoreEvent>,
}

impl Subscription {
    /// Next matching event. `None` once the core is gone.
    pub async fn next(&mut self) -> Option<CoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    let matches = match (&self.session_id, event.session_id()) {
                        (Some(want), Some(have)) => want == have,
                        // Global events reach every subscriber
                        (_, None) => true,
                        (None, _) => true,
                    };
                    if matches {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscription lagged, events skipped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::message::ContentType;

    fn message_event(session_id: &str) -> CoreEvent {
        CoreEvent::MessageReceived {
            message: Message {
                id: "m1".into(),
                session_id: session_id.into(),
                sender: "a".into(),
                recipient: "b".into(),
                content_type: ContentType::Text,
                ciphertext: vec![],
                created_at: 0,
                vector_clock: VectorClock::new(),
                status: MessageStatus::Delivered,
                attempts: 0,
            },
            plaintext: b"hi".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_session_filter() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe_session("s1");

        bus.emit(message_event("s2"));
        bus.emit(message_event("s1"));

        match sub.next().await.unwrap() {
            CoreEvent::MessageReceived { message, .. } => assert_eq!(message.session_id, "s1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_global_events_pass_filter() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe_session("s1");

        bus.emit(CoreEvent::ProtocolViolation {
            detail: "unknown frame".into(),
        });
        assert!(matches!(
            sub.next().await.unwrap(),
            CoreEvent::ProtocolViolation { .. }
        ));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new(16);
        bus.emit(message_event("s1"));
    }
}
