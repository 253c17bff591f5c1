//! Integration tests for the supervised consumer against the in-memory broker.
//!
//! Covers acknowledgement, requeue on failure, the bounded redelivery policy,
//! session restarts after graceful closes and dropped connections, and the
//! supervisor giving up.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tasksync_core::broker::QueueBinding;
use tasksync_core::event::{Event, EventEnvelope};
use tasksync_runtime::retry::RetryPolicy;
use tasksync_runtime::{
    Consumer, ConsumerError, ConsumerSettings, ConsumerState, EventPublisher, HandlerError,
    MessageHandler, RedeliveryPolicy,
};
use tasksync_testing::InMemoryBroker;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const EXCHANGE: &str = "task_events";
const QUEUE: &str = "audit_queue";

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

impl Event for Ping {
    fn routing_key(&self) -> &'static str {
        "task.checkout.completed"
    }
}

/// Records handled payloads; fails the first `failures` attempts.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<u32>>,
    attempts: AtomicU32,
    failures: AtomicU32,
}

impl Recorder {
    fn failing(times: u32) -> Self {
        let recorder = Self::default();
        recorder.failures.store(times, Ordering::SeqCst);
        recorder
    }

    fn seen(&self) -> Vec<u32> {
        self.seen.lock().unwrap().clone()
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl MessageHandler for Recorder {
    type Event = Ping;

    fn handle(
        &self,
        event: EventEnvelope<Ping>,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(HandlerError::new("transient failure"));
            }
            self.seen.lock().unwrap().push(event.payload.n);
            Ok(())
        })
    }
}

fn fast_restarts(max_retries: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(50))
        .jitter(false)
        .build()
}

fn settings(queue: &str) -> ConsumerSettings {
    ConsumerSettings::new(QueueBinding::new(EXCHANGE, "task.checkout.#", queue))
        .reconnect_delay(Duration::from_millis(20))
        .restart_policy(fast_restarts(5))
}

struct Running {
    consumer: Arc<Consumer<Recorder>>,
    handler: Arc<Recorder>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), ConsumerError>>,
}

impl Running {
    async fn stop(self) -> Result<(), ConsumerError> {
        self.shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("consumer stops within two seconds")
            .unwrap()
    }
}

fn spawn(broker: &InMemoryBroker, handler: Recorder, settings: ConsumerSettings) -> Running {
    tasksync_testing::init_tracing();
    let handler = Arc::new(handler);
    let consumer = Arc::new(Consumer::new(
        Arc::new(broker.clone()),
        Arc::clone(&handler),
        settings,
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.run(shutdown_rx).await })
    };
    Running {
        consumer,
        handler,
        shutdown,
        task,
    }
}

async fn wait_for_state(consumer: &Consumer<Recorder>, wanted: ConsumerState) {
    let mut states = consumer.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), states.wait_for(|state| *state == wanted))
        .await
        .unwrap_or_else(|_| panic!("consumer never reached {wanted}"))
        .unwrap();
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn connected_publisher(broker: &InMemoryBroker) -> EventPublisher {
    let publisher = EventPublisher::new(Arc::new(broker.clone()), EXCHANGE);
    publisher.connect().await.unwrap();
    publisher
}

// ============================================================================
// Acknowledgement
// ============================================================================

#[tokio::test]
async fn processed_deliveries_are_acknowledged() {
    let broker = InMemoryBroker::new();
    let running = spawn(&broker, Recorder::default(), settings(QUEUE));
    wait_for_state(&running.consumer, ConsumerState::Consuming).await;

    let publisher = connected_publisher(&broker).await;
    publisher.publish(Ping { n: 1 }).await;
    publisher.publish(Ping { n: 2 }).await;

    eventually("both events handled", || running.handler.seen().len() == 2).await;
    assert_eq!(running.handler.seen(), vec![1, 2]);
    eventually("queue drained", || broker.unacked_count(QUEUE) == 0).await;
    assert_eq!(broker.queue_depth(QUEUE), 0);
    assert!(running.consumer.health().status.is_healthy());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn messages_published_before_the_consumer_starts_are_delivered() {
    let broker = InMemoryBroker::new();
    {
        let running = spawn(&broker, Recorder::default(), settings(QUEUE));
        wait_for_state(&running.consumer, ConsumerState::Consuming).await;
        running.stop().await.unwrap();
    }

    let publisher = connected_publisher(&broker).await;
    publisher.publish(Ping { n: 7 }).await;
    assert_eq!(broker.queue_depth(QUEUE), 1);

    let running = spawn(&broker, Recorder::default(), settings(QUEUE));
    eventually("waiting event handled", || running.handler.seen() == vec![7]).await;
    running.stop().await.unwrap();
}

#[tokio::test]
async fn every_bound_queue_receives_the_event() {
    let broker = InMemoryBroker::new();
    let notifications = spawn(&broker, Recorder::default(), settings("notification_queue"));
    let analytics = spawn(&broker, Recorder::default(), settings("analytics_queue"));
    wait_for_state(&notifications.consumer, ConsumerState::Consuming).await;
    wait_for_state(&analytics.consumer, ConsumerState::Consuming).await;

    connected_publisher(&broker).await.publish(Ping { n: 3 }).await;

    eventually("notification copy", || notifications.handler.seen() == vec![3]).await;
    eventually("analytics copy", || analytics.handler.seen() == vec![3]).await;

    notifications.stop().await.unwrap();
    analytics.stop().await.unwrap();
}

// ============================================================================
// Redelivery
// ============================================================================

#[tokio::test]
async fn failed_handling_is_requeued_and_retried() {
    let broker = InMemoryBroker::new();
    let running = spawn(&broker, Recorder::failing(2), settings(QUEUE));
    wait_for_state(&running.consumer, ConsumerState::Consuming).await;

    connected_publisher(&broker).await.publish(Ping { n: 9 }).await;

    eventually("event handled after retries", || running.handler.seen() == vec![9]).await;
    assert_eq!(running.handler.attempts(), 3);
    eventually("queue drained", || broker.unacked_count(QUEUE) == 0).await;
    assert_eq!(broker.queue_depth(QUEUE), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_message_is_nacked_with_requeue() {
    let broker = InMemoryBroker::new();
    let running = spawn(&broker, Recorder::default(), settings(QUEUE));
    wait_for_state(&running.consumer, ConsumerState::Consuming).await;

    broker
        .publish_raw(EXCHANGE, "task.checkout.completed", b"not json".to_vec())
        .unwrap();

    wait_for_state(&running.consumer, ConsumerState::NackRequeued).await;
    assert_eq!(running.handler.attempts(), 0);
    assert!(!running.consumer.health().status.is_healthy());

    running.stop().await.unwrap();
    // Still owed to the queue.
    assert_eq!(broker.queue_depth(QUEUE), 1);
}

#[tokio::test]
async fn bounded_redelivery_drops_poison_messages() {
    let broker = InMemoryBroker::new();
    let running = spawn(
        &broker,
        Recorder::default(),
        settings(QUEUE).redelivery(RedeliveryPolicy::Bounded { max_attempts: 3 }),
    );
    wait_for_state(&running.consumer, ConsumerState::Consuming).await;

    broker
        .publish_raw(EXCHANGE, "task.checkout.completed", b"{\"n\":".to_vec())
        .unwrap();
    connected_publisher(&broker).await.publish(Ping { n: 4 }).await;

    eventually("valid event handled", || running.handler.seen() == vec![4]).await;
    eventually("poison message dropped", || {
        broker.queue_depth(QUEUE) == 0 && broker.unacked_count(QUEUE) == 0
    })
    .await;

    running.stop().await.unwrap();
}

// ============================================================================
// Supervision
// ============================================================================

#[tokio::test]
async fn graceful_close_starts_a_new_session() {
    let broker = InMemoryBroker::new();
    let running = spawn(&broker, Recorder::default(), settings(QUEUE));
    wait_for_state(&running.consumer, ConsumerState::Consuming).await;

    broker.close_connections();
    wait_for_state(&running.consumer, ConsumerState::Disconnected).await;
    wait_for_state(&running.consumer, ConsumerState::Consuming).await;

    connected_publisher(&broker).await.publish(Ping { n: 5 }).await;
    eventually("event handled after reconnect", || running.handler.seen() == vec![5]).await;

    running.stop().await.unwrap();
}

#[tokio::test]
async fn dropped_connection_restarts_and_catches_up() {
    let broker = InMemoryBroker::new();
    let running = spawn(&broker, Recorder::default(), settings(QUEUE));
    wait_for_state(&running.consumer, ConsumerState::Consuming).await;

    broker.refuse_connections(true);
    broker.drop_connections();
    wait_for_state(&running.consumer, ConsumerState::Disconnected).await;

    // The durable queue keeps what arrives while the consumer is away.
    broker
        .publish_raw(
            EXCHANGE,
            "task.checkout.completed",
            EventEnvelope::stamp(Ping { n: 6 }, chrono::Utc::now())
                .to_bytes()
                .unwrap(),
        )
        .unwrap();
    assert_eq!(broker.queue_depth(QUEUE), 1);

    broker.refuse_connections(false);
    eventually("queued event handled", || running.handler.seen() == vec![6]).await;

    running.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_broker_exhausts_restarts() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(true);
    let running = spawn(
        &broker,
        Recorder::default(),
        settings(QUEUE).restart_policy(fast_restarts(2)),
    );

    let result = tokio::time::timeout(Duration::from_secs(2), running.task)
        .await
        .expect("supervisor gives up")
        .unwrap();

    match result {
        Err(ConsumerError::RestartsExhausted { restarts, last }) => {
            assert_eq!(restarts, 3);
            assert!(matches!(*last, ConsumerError::ConnectionFailed(_)));
        }
        other => panic!("expected exhausted restarts, got {other:?}"),
    }
    assert_eq!(running.consumer.state(), ConsumerState::Disconnected);
}

#[tokio::test]
async fn shutdown_detaches_from_the_queue() {
    let broker = InMemoryBroker::new();
    let running = spawn(&broker, Recorder::default(), settings(QUEUE));
    wait_for_state(&running.consumer, ConsumerState::Consuming).await;
    assert_eq!(broker.consumer_count(QUEUE), 1);

    let consumer = Arc::clone(&running.consumer);
    running.stop().await.unwrap();

    assert_eq!(consumer.state(), ConsumerState::Disconnected);
    assert_eq!(broker.consumer_count(QUEUE), 0);
}
