//! Event intake: validate, persist, and route events from external sources.
//!
//! Every accepted event lands in the `events` table in insertion order.
//! Critical events are additionally fanned out on the `event.critical` bus
//! topic: the first delivery attempt happens before acceptance returns, and
//! overflowed subscribers get a bounded number of background redeliveries.
//! Acceptance never depends on delivery; alert failures are recorded as
//! events themselves.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use mycel_bus::{MessageBus, CRITICAL_EVENT_TOPIC};
use mycel_store_sqlite::SqliteStore;
use mycel_types::{EventRecord, EventSeverity, EventSubmission};

use crate::FabricError;

//─────────────────────────────
//  Fan-out policy
//─────────────────────────────

/// Bounded redelivery policy for critical-event fan-out.
#[derive(Debug, Clone)]
pub struct FanoutPolicy {
    /// Maximum delivery attempts per event (first attempt included).
    pub max_attempts: u32,
    /// Base backoff between attempts, doubled each time.
    pub base_delay: Duration,
    /// Wall-clock cap on the whole redelivery effort.
    pub deadline: Duration,
}

impl Default for FanoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            deadline: Duration::from_secs(5),
        }
    }
}

//─────────────────────────────
//  Intake
//─────────────────────────────

/// Event intake service.
pub struct EventIntake {
    store: SqliteStore,
    bus: MessageBus,
    policy: FanoutPolicy,
}

impl EventIntake {
    /// Build the intake over the relational store and the bus.
    pub fn new(store: SqliteStore, bus: MessageBus) -> Self {
        Self { store, bus, policy: FanoutPolicy::default() }
    }

    /// Override the critical fan-out policy.
    pub fn with_policy(mut self, policy: FanoutPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Accept one event: validate, persist, fan out if critical.
    ///
    /// The first critical delivery attempt happens before this returns;
    /// remaining attempts (for overflowed subscribers) continue in the
    /// background so the caller is never blocked on downstream failures.
    #[instrument(skip(self, submission), fields(source = %submission.source, event_type = %submission.event_type))]
    pub async fn ingest(&self, submission: EventSubmission) -> Result<EventRecord, FabricError> {
        submission.validate().map_err(FabricError::Schema)?;
        let record = EventRecord::from_submission(submission);
        self.store
            .insert_event(&record)
            .await
            .map_err(|err| FabricError::Internal(format!("persisting event: {err}")))?;
        debug!(event = %record.id, severity = record.severity.as_str(), "event accepted");

        if record.severity == EventSeverity::Critical {
            self.fan_out_critical(&record).await;
        }
        Ok(record)
    }

    /// Most recent events, newest first (introspection surface).
    pub async fn recent(&self, limit: u32) -> Result<Vec<EventRecord>, FabricError> {
        self.store
            .recent_events(limit)
            .await
            .map_err(|err| FabricError::Internal(err.to_string()))
    }

    /// Flag an event as handled by an alert subscriber.
    pub async fn mark_handled(&self, event_id: &str) -> Result<bool, FabricError> {
        self.store
            .mark_event_handled(event_id)
            .await
            .map_err(|err| FabricError::Internal(err.to_string()))
    }

    async fn fan_out_critical(&self, record: &EventRecord) {
        let payload = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = %record.id, error = %err, "cannot serialize critical event");
                return;
            }
        };

        // First attempt before acceptance returns.
        let outcome = self.bus.publish(CRITICAL_EVENT_TOPIC, payload.clone());
        if outcome.fully_delivered() {
            return;
        }
        warn!(
            event = %record.id,
            overflowed = outcome.overflowed.len(),
            "critical fan-out overflowed; scheduling redelivery"
        );

        // Remaining attempts continue in the background.
        let bus = self.bus.clone();
        let store = self.store.clone();
        let policy = self.policy.clone();
        let event_id = record.id.clone();
        let source = record.source.clone();
        tokio::spawn(async move {
            redeliver(bus, store, policy, event_id, source, payload).await;
        });
    }
}

async fn redeliver(
    bus: MessageBus,
    store: SqliteStore,
    policy: FanoutPolicy,
    event_id: String,
    source: String,
    payload: serde_json::Value,
) {
    let started = std::time::Instant::now();
    let mut delay = policy.base_delay;
    for attempt in 2..=policy.max_attempts.max(1) {
        if started.elapsed() + delay > policy.deadline {
            break;
        }
        tokio::time::sleep(delay).await;
        let outcome = bus.publish(CRITICAL_EVENT_TOPIC, payload.clone());
        if outcome.fully_delivered() {
            debug!(event = %event_id, attempt, "critical redelivery succeeded");
            return;
        }
        delay = delay.saturating_mul(2);
    }

    // Delivery exhausted; the failure becomes an event itself.
    warn!(event = %event_id, "critical fan-out exhausted its delivery attempts");
    let failure = EventRecord::from_submission(EventSubmission {
        source: "fabric.event_intake".to_string(),
        event_type: "alert_delivery_failed".to_string(),
        severity: EventSeverity::Warn,
        correlation_id: Some(event_id.clone()),
        data: serde_json::json!({ "event_id": event_id, "source": source }),
    });
    if let Err(err) = store.insert_event(&failure).await {
        warn!(error = %err, "could not record alert delivery failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission(severity: EventSeverity) -> EventSubmission {
        EventSubmission {
            source: "agent.mycology_bio".to_string(),
            event_type: "contamination".to_string(),
            severity,
            correlation_id: None,
            data: json!({ "id": "c42" }),
        }
    }

    #[tokio::test]
    async fn events_persist_in_insertion_order() {
        let intake = EventIntake::new(SqliteStore::in_memory().await.unwrap(), MessageBus::new());
        let first = intake.ingest(submission(EventSeverity::Info)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = intake.ingest(submission(EventSeverity::Warn)).await.unwrap();

        let recent = intake.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, second.id);
        assert_eq!(recent[1].id, first.id);
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected() {
        let intake = EventIntake::new(SqliteStore::in_memory().await.unwrap(), MessageBus::new());
        let mut bad = submission(EventSeverity::Info);
        bad.source = String::new();
        let err = intake.ingest(bad).await.unwrap_err();
        assert!(matches!(err, FabricError::Schema(_)));
    }

    #[tokio::test]
    async fn critical_events_are_published_before_acceptance_returns() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe(CRITICAL_EVENT_TOPIC, 8);
        let intake = EventIntake::new(SqliteStore::in_memory().await.unwrap(), bus);

        let record = intake.ingest(submission(EventSeverity::Critical)).await.unwrap();

        let message = sub.try_recv().expect("delivery attempted before acceptance returned");
        assert_eq!(message.payload["id"], serde_json::Value::String(record.id.clone()));
        assert_eq!(message.payload["event_type"], "contamination");
    }

    #[tokio::test]
    async fn non_critical_events_are_not_fanned_out() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe(CRITICAL_EVENT_TOPIC, 8);
        let intake = EventIntake::new(SqliteStore::in_memory().await.unwrap(), bus);

        intake.ingest(submission(EventSeverity::Warn)).await.unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn exhausted_fanout_records_a_failure_event() {
        let bus = MessageBus::new();
        // Depth-1 subscriber that never drains: every publish overflows after
        // the first.
        let _stuck = bus.subscribe(CRITICAL_EVENT_TOPIC, 1);
        bus.publish(CRITICAL_EVENT_TOPIC, json!("filler"));

        let store = SqliteStore::in_memory().await.unwrap();
        let intake = EventIntake::new(store.clone(), bus).with_policy(FanoutPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            deadline: Duration::from_secs(1),
        });

        intake.ingest(submission(EventSeverity::Critical)).await.unwrap();
        // Give the background redelivery a moment to exhaust and record.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let recent = store.recent_events(10).await.unwrap();
        assert!(recent.iter().any(|event| event.event_type == "alert_delivery_failed"));
    }
}
