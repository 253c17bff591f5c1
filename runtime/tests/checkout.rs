//! Checkout end to end: bulk completion, the published event and what a
//! bound queue receives.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tasksync_core::broker::{Connector, DeliveryStream, QueueBinding, assert_topology};
use tasksync_core::checkout::{CheckoutEvent, Completable};
use tasksync_core::environment::Clock;
use tasksync_core::event::EventEnvelope;
use tasksync_core::{NewRecord, RecordFields, RecordStore};
use tasksync_runtime::{CheckoutService, EventPublisher};
use tasksync_testing::{InMemoryBroker, test_clock};

const EXCHANGE: &str = "task_events";

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Job {
    level: String,
    owner: Option<String>,
    done_at: Option<DateTime<Utc>>,
    done_by: Option<String>,
}

impl RecordFields for Job {
    type Changes = (DateTime<Utc>, String);

    fn apply(&mut self, (at, by): Self::Changes) {
        self.done_at = Some(at);
        self.done_by = Some(by);
    }
}

impl Completable for Job {
    fn subject(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    fn is_completed(&self) -> bool {
        self.done_at.is_some()
    }

    fn classification(&self) -> &'static str {
        match self.level.as_str() {
            "urgent" => "urgent",
            "high" => "high",
            "low" => "low",
            _ => "medium",
        }
    }

    fn classes() -> &'static [&'static str] {
        &["urgent", "high", "medium", "low"]
    }

    fn completion_changes(&self, at: DateTime<Utc>, by: &str) -> Self::Changes {
        (at, by.to_string())
    }
}

fn job(level: &str, owner: &str) -> NewRecord<Job> {
    NewRecord::new(Job {
        level: level.to_string(),
        owner: Some(owner.to_string()),
        done_at: None,
        done_by: None,
    })
}

struct Harness {
    store: RecordStore<Job>,
    service: CheckoutService<Job>,
    deliveries: DeliveryStream,
    broker: InMemoryBroker,
}

/// Moves forward 5ms every time it is read.
struct TickingClock(Mutex<DateTime<Utc>>);

impl Clock for TickingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut time = self.0.lock().unwrap();
        *time += chrono::Duration::milliseconds(5);
        *time
    }
}

async fn harness() -> Harness {
    harness_with_clock(Arc::new(test_clock())).await
}

async fn harness_with_clock(clock: Arc<dyn Clock>) -> Harness {
    tasksync_testing::init_tracing();
    let broker = InMemoryBroker::new();

    let channel = broker.connect().await.unwrap();
    let binding = QueueBinding::new(EXCHANGE, "task.checkout.#", "audit_queue");
    assert_topology(channel.as_ref(), &binding, 10).await.unwrap();
    let deliveries = channel.consume("audit_queue", "audit").await.unwrap();

    let publisher = Arc::new(
        EventPublisher::new(Arc::new(broker.clone()), EXCHANGE).with_clock(Arc::clone(&clock)),
    );
    publisher.connect().await.unwrap();

    let store = RecordStore::in_memory();
    let service = CheckoutService::new(store.clone(), publisher).with_clock(clock);
    Harness {
        store,
        service,
        deliveries,
        broker,
    }
}

async fn next_event(deliveries: &mut DeliveryStream) -> (String, EventEnvelope<CheckoutEvent>) {
    let delivery = tokio::time::timeout(Duration::from_secs(1), deliveries.next())
        .await
        .expect("event within a second")
        .expect("stream open")
        .expect("no broker error");
    let routing_key = delivery.routing_key.clone();
    let envelope = EventEnvelope::from_bytes(&delivery.body).unwrap();
    delivery.ack().await.unwrap();
    (routing_key, envelope)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn checkout_completes_pending_records_and_publishes_summary() {
    let mut h = harness().await;
    for level in ["urgent", "high", "high"] {
        h.store.create(job(level, "u1")).await.unwrap();
    }
    h.store.create(job("low", "u2")).await.unwrap();

    let receipt = h.service.checkout("u1").await.unwrap();

    assert!(receipt.published);
    assert_eq!(receipt.completed_count(), 3);
    assert_eq!(receipt.timestamp, test_clock_now());
    for record in &receipt.completed {
        assert_eq!(record.fields.done_by.as_deref(), Some("u1"));
        assert_eq!(record.fields.done_at, Some(test_clock_now()));
    }

    let (routing_key, envelope) = next_event(&mut h.deliveries).await;
    assert_eq!(routing_key, "task.checkout.completed");
    assert_eq!(envelope.event_id, receipt.event_id);
    assert_eq!(envelope.timestamp, receipt.timestamp);
    let event = envelope.payload;
    assert_eq!(event.user_id, "u1");
    assert_eq!(event.total_tasks, 3);
    assert_eq!(event.count("urgent"), 1);
    assert_eq!(event.count("high"), 2);
    assert_eq!(event.count("medium"), 0);
    assert_eq!(event.count("low"), 0);
    assert_eq!(event.summary.len(), 4);

    let stats = h.store.stats().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn checkout_with_nothing_pending_still_publishes() {
    let mut h = harness().await;

    let receipt = h.service.checkout("u1").await.unwrap();

    assert!(receipt.published);
    assert_eq!(receipt.completed_count(), 0);
    let (_, envelope) = next_event(&mut h.deliveries).await;
    assert_eq!(envelope.payload.total_tasks, 0);
    assert!(envelope.payload.summary.values().all(|count| *count == 0));
}

#[tokio::test]
async fn second_checkout_finds_nothing_left() {
    let mut h = harness().await;
    h.store.create(job("medium", "u1")).await.unwrap();

    let first = h.service.checkout("u1").await.unwrap();
    let second = h.service.checkout("u1").await.unwrap();

    assert_eq!(first.completed_count(), 1);
    assert_eq!(second.completed_count(), 0);
    let (_, one) = next_event(&mut h.deliveries).await;
    let (_, two) = next_event(&mut h.deliveries).await;
    assert_ne!(one.event_id, two.event_id);
}

#[tokio::test]
async fn receipt_timestamp_is_the_published_capture_time() {
    let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let mut h = harness_with_clock(Arc::new(TickingClock(Mutex::new(start)))).await;
    h.store.create(job("high", "u1")).await.unwrap();

    let receipt = h.service.checkout("u1").await.unwrap();

    let (_, envelope) = next_event(&mut h.deliveries).await;
    assert_eq!(receipt.timestamp, envelope.timestamp);
    let completed_at = receipt.completed[0].fields.done_at.unwrap();
    assert!(completed_at < receipt.timestamp);
}

#[tokio::test]
async fn checkout_stands_when_broker_is_down() {
    let h = harness().await;
    h.store.create(job("urgent", "u1")).await.unwrap();
    h.broker.drop_connections();

    let receipt = h.service.checkout("u1").await.unwrap();

    assert!(!receipt.published);
    assert_eq!(receipt.completed_count(), 1);
    assert_eq!(h.store.stats().await.unwrap().pending, 0);
}

fn test_clock_now() -> DateTime<Utc> {
    test_clock().now()
}
