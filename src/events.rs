// src/events.rs
// In-process typed event bus connecting the runtime to host collaborators

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events published by the core and consumed by background workers and the
/// host editor. Delivery is FIFO per subscriber; slow subscribers that fall
/// more than the channel capacity behind lose the oldest events (broadcast
/// semantics), which is acceptable for UI-grade notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultEvent {
    MessageSent {
        conversation_id: String,
        project_id: Option<String>,
    },
    ConversationCreated {
        conversation_id: String,
    },
    ConversationUpdated {
        conversation_id: String,
    },
    ConversationDeleted {
        conversation_id: String,
        project_id: Option<String>,
    },
    SelectionChanged {
        file_path: Option<String>,
    },
    OpenLink {
        target: String,
    },
    ShowToast {
        message: String,
    },
}

const BUS_CAPACITY: usize = 256;

/// Explicitly constructed, handle-passed event bus. One instance per host
/// binding; services receive a clone at construction instead of reaching for
/// process globals.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VaultEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Returns the number of live subscribers; zero is not
    /// an error (publishing into the void is normal during startup).
    pub fn publish(&self, event: VaultEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe_fifo() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(VaultEvent::ConversationCreated {
            conversation_id: "a".into(),
        });
        bus.publish(VaultEvent::MessageSent {
            conversation_id: "a".into(),
            project_id: None,
        });

        match rx.recv().await.unwrap() {
            VaultEvent::ConversationCreated { conversation_id } => {
                assert_eq!(conversation_id, "a")
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            VaultEvent::MessageSent { conversation_id, project_id } => {
                assert_eq!(conversation_id, "a");
                assert!(project_id.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        assert_eq!(
            bus.publish(VaultEvent::ShowToast {
                message: "hi".into()
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_each_subscriber_sees_all_events() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(
            bus.publish(VaultEvent::ConversationDeleted {
                conversation_id: "c".into(),
                project_id: Some("p".into()),
            }),
            2
        );

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                VaultEvent::ConversationDeleted { conversation_id, project_id } => {
                    assert_eq!(conversation_id, "c");
                    assert_eq!(project_id.as_deref(), Some("p"));
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_event_serialization_tags() {
        let json = serde_json::to_string(&VaultEvent::MessageSent {
            conversation_id: "x".into(),
            project_id: None,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"message_sent\""));
    }
}
