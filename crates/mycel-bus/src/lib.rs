#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mycel-bus** – In-process message bus for Mycel.
//!
//! The bus provides typed publish/subscribe between agents and framework
//! components. Unlike a broadcast ring, every subscriber owns a bounded
//! queue: a slow subscriber overflows *its own* queue and the publisher is
//! told exactly which subscriptions were affected, while all other
//! subscribers keep receiving. Delivery is at-least-once within a single
//! process run; nothing is persisted, durability belongs to the audit and
//! event stores.
//!
//! Ordering guarantee: messages from one publisher arrive at each subscriber
//! in publish order. There is no ordering across topics or across publishers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

//─────────────────────────────
//  Message type
//─────────────────────────────

/// One bus message: a topic, a structured payload, and intake metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Publish timestamp.
    pub timestamp: DateTime<Utc>,
    /// Optional correlation id carried through from the originating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl BusMessage {
    /// Build a message for `topic` with the current timestamp.
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Attach a correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

//─────────────────────────────
//  Subscriptions
//─────────────────────────────

/// Opaque identifier of one subscription, reported back on overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

struct SubscriberSlot {
    id: SubscriptionId,
    tx: mpsc::Sender<BusMessage>,
}

/// Receiving half of a subscription. Dropping it unsubscribes; the slot is
/// pruned on the next publish to the topic.
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// This subscription's id, matched against [`PublishOutcome::overflowed`].
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next message, waiting until one arrives.
    ///
    /// Returns `None` once the bus side has been dropped.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }

    /// Number of messages waiting in this subscription's queue.
    pub fn depth(&self) -> usize {
        self.rx.len()
    }
}

//─────────────────────────────
//  Publish outcome
//─────────────────────────────

/// Per-publish delivery report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOutcome {
    /// Number of subscriber queues the message was placed on.
    pub delivered: usize,
    /// Subscriptions whose bounded queue was full; the message was dropped
    /// for those subscribers only.
    pub overflowed: Vec<SubscriptionId>,
}

impl PublishOutcome {
    /// True when no subscriber queue overflowed.
    pub fn fully_delivered(&self) -> bool {
        self.overflowed.is_empty()
    }
}

//─────────────────────────────
//  Bus
//─────────────────────────────

/// In-process message bus with per-subscriber bounded queues.
///
/// Cloning is cheap; all clones publish into the same subscriber set.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    topics: DashMap<String, Vec<SubscriberSlot>>,
    next_id: AtomicU64,
}

impl MessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topic` with a bounded delivery queue of `depth` messages.
    pub fn subscribe(&self, topic: impl Into<String>, depth: usize) -> Subscription {
        let topic = topic.into();
        let depth = depth.max(1);
        let (tx, rx) = mpsc::channel(depth);
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .topics
            .entry(topic.clone())
            .or_default()
            .push(SubscriberSlot { id, tx });
        Subscription { id, topic, rx }
    }

    /// Publish `payload` on `topic`.
    pub fn publish(&self, topic: impl Into<String>, payload: serde_json::Value) -> PublishOutcome {
        self.publish_message(BusMessage::new(topic, payload))
    }

    /// Publish a fully formed message.
    ///
    /// Each live subscriber receives an independent copy. Full subscriber
    /// queues are reported in the outcome; closed subscribers are pruned.
    pub fn publish_message(&self, message: BusMessage) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();
        let Some(mut slots) = self.inner.topics.get_mut(&message.topic) else {
            return outcome;
        };
        slots.retain(|slot| match slot.tx.try_send(message.clone()) {
            Ok(()) => {
                outcome.delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                outcome.overflowed.push(slot.id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        outcome
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|slots| slots.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

//─────────────────────────────
//  Notifications
//─────────────────────────────

/// Topic every observable state change is announced on.
pub const NOTIFICATION_TOPIC: &str = "notification";

/// Topic critical events are fanned out on.
pub const CRITICAL_EVENT_TOPIC: &str = "event.critical";

/// Publish a state-change notification: `{ type, id, timestamp, ...payload }`.
///
/// Delivery is fire-and-forget; subscribers that overflow simply miss the
/// notification, and durability comes from the stores, not the bus.
pub fn emit_notification(
    bus: &MessageBus,
    kind: &str,
    id: &str,
    payload: serde_json::Value,
) -> PublishOutcome {
    let mut body = serde_json::Map::new();
    body.insert("type".to_string(), serde_json::Value::String(kind.to_string()));
    body.insert("id".to_string(), serde_json::Value::String(id.to_string()));
    body.insert(
        "timestamp".to_string(),
        serde_json::Value::String(Utc::now().to_rfc3339()),
    );
    if let serde_json::Value::Object(extra) = payload {
        for (key, value) in extra {
            body.entry(key).or_insert(value);
        }
    }
    bus.publish(NOTIFICATION_TOPIC, serde_json::Value::Object(body))
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors surfaced by bus helpers.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The subscriber's bounded queue was full.
    #[error("subscriber queue full for subscription {0:?}")]
    Overflow(SubscriptionId),
}
