//! The whole pipeline in one process: HTTP checkout, the in-process broker,
//! and both consumers.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tasksync_core::RecordStore;
use tasksync_core::broker::Connector;
use tasksync_runtime::EventPublisher;
use tasksync_runtime::consumer::{Consumer, MessageHandler};
use tasksync_task_service::consumers::{
    ANALYTICS_QUEUE, NOTIFICATION_QUEUE, RecordingSink, Workers, dashboard_router,
};
use tasksync_task_service::{AppState, Config, build_router};
use tasksync_testing::InMemoryBroker;
use tokio::sync::watch;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Pipeline {
    server: TestServer,
    broker: InMemoryBroker,
    publisher: Arc<EventPublisher>,
    sink: RecordingSink,
    workers: Workers,
    shutdown: watch::Sender<bool>,
}

fn config() -> Config {
    let vars: HashMap<&str, &str> = [
        ("NOTIFICATION_DELAY_MS", "0"),
        ("ANALYTICS_DELAY_MS", "0"),
        ("RECONNECT_DELAY_MS", "20"),
    ]
    .into_iter()
    .collect();
    Config::from_lookup(|name| vars.get(name).map(ToString::to_string)).unwrap()
}

async fn wait_consuming<H: MessageHandler>(consumer: &Consumer<H>) {
    let mut state = consumer.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_consuming()))
        .await
        .expect("consumer never reached consuming")
        .unwrap();
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn pipeline() -> Pipeline {
    tasksync_testing::init_tracing();
    let config = config();
    let broker = InMemoryBroker::new();
    let connector: Arc<dyn Connector> = Arc::new(broker.clone());
    let (shutdown, shutdown_rx) = watch::channel(false);

    let sink = RecordingSink::new();
    let workers = Workers::start(&connector, &config, Arc::new(sink.clone()), &shutdown_rx);
    wait_consuming(&workers.notification).await;
    wait_consuming(&workers.analytics).await;

    let publisher = Arc::new(EventPublisher::new(
        Arc::clone(&connector),
        config.broker.exchange.clone(),
    ));
    publisher.connect().await.unwrap();

    let state = AppState::new(RecordStore::in_memory(), Arc::clone(&publisher))
        .with_component(workers.notification.clone())
        .with_component(workers.analytics.clone());
    let server = TestServer::new(build_router(state)).unwrap();

    Pipeline {
        server,
        broker,
        publisher,
        sink,
        workers,
        shutdown,
    }
}

impl Pipeline {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.workers.join().await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn checkout_reaches_both_consumers() {
    let p = pipeline().await;
    for priority in ["urgent", "high", "high"] {
        p.server
            .post("/api/tasks")
            .json(&json!({"title": priority, "priority": priority, "userId": "u1"}))
            .await
            .assert_status(StatusCode::CREATED);
    }

    let response = p
        .server
        .post("/api/checkout")
        .json(&json!({"userId": "u1"}))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    let event_id = body["eventId"].as_str().unwrap().to_string();

    let sink = p.sink.clone();
    eventually(|| {
        let sink = sink.clone();
        async move { !sink.sent().await.is_empty() }
    })
    .await;
    let analytics = p.workers.analytics_state.clone();
    eventually(|| {
        let analytics = analytics.clone();
        async move { analytics.snapshot().await.total_checkouts == 1 }
    })
    .await;

    let sent = p.sink.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].email, "user-u1@example.com");
    assert_eq!(sent[0].event_id.as_str(), event_id);
    assert!(sent[0].message.contains("completed 3 tasks"));

    let totals = p.workers.analytics_state.snapshot().await;
    assert_eq!(totals.total_tasks_completed, 3);
    assert_eq!(totals.priority_stats["urgent"], 1);
    assert_eq!(totals.priority_stats["high"], 2);
    assert_eq!(totals.priority_stats["medium"], 0);
    assert_eq!(totals.checkout_history[0].user_id, "u1");
    assert_eq!(totals.checkout_history[0].timestamp, body["timestamp"]);

    eventually(|| {
        let broker = p.broker.clone();
        async move {
            broker.unacked_count(NOTIFICATION_QUEUE) == 0 && broker.unacked_count(ANALYTICS_QUEUE) == 0
        }
    })
    .await;
    assert_eq!(p.broker.queue_depth(NOTIFICATION_QUEUE), 0);
    assert_eq!(p.broker.queue_depth(ANALYTICS_QUEUE), 0);

    p.stop().await;
}

#[tokio::test]
async fn readiness_includes_consumers() {
    let p = pipeline().await;

    let response = p.server.get("/api/ready").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"].as_array().unwrap().len(), 3);

    p.stop().await;
}

#[tokio::test]
async fn dashboard_serves_analytics() {
    let p = pipeline().await;
    p.server
        .post("/api/checkout")
        .json(&json!({"userId": "u9"}))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let analytics = p.workers.analytics_state.clone();
    eventually(|| {
        let analytics = analytics.clone();
        async move { analytics.snapshot().await.total_checkouts == 1 }
    })
    .await;

    let dashboard = TestServer::new(dashboard_router(p.workers.analytics_state.clone())).unwrap();
    let response = dashboard.get("/dashboard").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["analytics"]["totalCheckouts"], 1);
    assert_eq!(body["analytics"]["totalTasksCompleted"], 0);
    assert_eq!(body["analytics"]["checkoutHistory"][0]["userId"], "u9");

    p.stop().await;
}

#[tokio::test]
async fn consumers_catch_up_after_connection_loss() {
    let p = pipeline().await;

    p.broker.drop_connections();
    p.publisher.connect().await.unwrap();
    let response = p
        .server
        .post("/api/checkout")
        .json(&json!({"userId": "u2"}))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    assert_eq!(response.json::<serde_json::Value>()["published"], true);

    let analytics = p.workers.analytics_state.clone();
    eventually(|| {
        let analytics = analytics.clone();
        async move { analytics.snapshot().await.total_checkouts >= 1 }
    })
    .await;
    let sink = p.sink.clone();
    eventually(|| {
        let sink = sink.clone();
        async move { !sink.sent().await.is_empty() }
    })
    .await;
    assert_eq!(p.sink.sent().await[0].user_id, "u2");

    p.stop().await;
}
