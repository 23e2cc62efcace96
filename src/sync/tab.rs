//! Cross-context propagation.
//!
//! Sibling contexts on the same device (tabs, windows, worker tasks) share a
//! [`TabBus`]. Every local mutation is published so siblings converge without
//! a network round trip. Messages carry the sender's context id so receivers
//! can ignore their own echoes.

use crate::model::{Dataset, Record, Thread, Votes};
use crate::utils::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TabMessage {
    #[serde(rename_all = "camelCase")]
    DataUpdated { country: String, dataset: Dataset },
    #[serde(rename_all = "camelCase")]
    NewRecord { country: String, record: Record },
    #[serde(rename_all = "camelCase")]
    NewComment {
        country: String,
        record_id: String,
        thread: Thread,
    },
    #[serde(rename_all = "camelCase")]
    NewVote {
        country: String,
        record_id: String,
        votes: Votes,
    },
    #[serde(rename_all = "camelCase")]
    RequestSync { country: String },
}

impl TabMessage {
    pub fn country(&self) -> &str {
        match self {
            TabMessage::DataUpdated { country, .. }
            | TabMessage::NewRecord { country, .. }
            | TabMessage::NewComment { country, .. }
            | TabMessage::NewVote { country, .. }
            | TabMessage::RequestSync { country } => country,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TabMessage::DataUpdated { .. } => "data-updated",
            TabMessage::NewRecord { .. } => "new-record",
            TabMessage::NewComment { .. } => "new-comment",
            TabMessage::NewVote { .. } => "new-vote",
            TabMessage::RequestSync { .. } => "request-sync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabEnvelope {
    pub origin: String,
    pub timestamp: u64,
    pub message: TabMessage,
}

/// Broadcast channel shared by sibling contexts
#[derive(Debug, Clone)]
pub struct TabBus {
    sender: broadcast::Sender<TabEnvelope>,
}

impl TabBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a message. Returns how many contexts received it; zero is not an error.
    pub fn publish(&self, origin: &str, message: TabMessage) -> usize {
        let kind = message.kind();
        let envelope = TabEnvelope {
            origin: origin.to_string(),
            timestamp: current_timestamp_ms(),
            message,
        };
        let receivers = self.sender.send(envelope).unwrap_or(0);
        tracing::trace!(origin = origin, kind = kind, receivers = receivers, "Published tab message");
        receivers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TabEnvelope> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for TabBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_are_tagged_kebab_case() {
        let message = TabMessage::NewVote {
            country: "peru".to_string(),
            record_id: "r1".to_string(),
            votes: Votes { approve: 2, reject: 0 },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({ "type": "new-vote", "country": "peru", "recordId": "r1", "votes": { "approve": 2, "reject": 0 } })
        );
        assert_eq!(message.kind(), "new-vote");
        assert_eq!(message.country(), "peru");
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = TabBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let sent = bus.publish(
            "ctx-1",
            TabMessage::RequestSync {
                country: "chile".to_string(),
            },
        );
        assert_eq!(sent, 2);
        assert_eq!(a.recv().await.unwrap().origin, "ctx-1");
        assert_eq!(b.recv().await.unwrap().message.country(), "chile");
    }

    #[test]
    fn envelope_survives_json() {
        let bus = TabBus::new(4);
        let mut receiver = bus.subscribe();
        bus.publish(
            "ctx-9",
            TabMessage::NewRecord {
                country: "peru".to_string(),
                record: Record::new("r1", 5).with_field("nombres", "Ana"),
            },
        );
        let envelope = tokio_test::assert_ok!(tokio_test::block_on(receiver.recv()));
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["origin"], "ctx-9");
        assert_eq!(wire["message"]["type"], "new-record");
        assert_eq!(wire["message"]["record"]["nombres"], "Ana");

        let back: TabEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = TabBus::default();
        assert_eq!(bus.publish("ctx", TabMessage::RequestSync { country: "peru".to_string() }), 0);
    }
}
