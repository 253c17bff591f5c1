//! Task API Server
//!
//! Serves the task sync API and publishes checkout events.
//!
//! Built with the `amqp` feature it publishes to `RabbitMQ` and the consumers
//! run as `notification-worker` and `analytics-worker`. Otherwise the
//! `in-process` feature (on by default) supplies `tasksync-testing`'s
//! in-memory broker, and both consumers (plus the analytics dashboard) run
//! inside this process.
//!
//! # Usage
//!
//! ```bash
//! # Everything in one process
//! cargo run --bin task-api
//!
//! # Against RabbitMQ
//! docker run -d -p 5672:5672 rabbitmq:3-management
//! cargo run --features amqp --bin task-api
//! ```

#[cfg(not(any(feature = "amqp", feature = "in-process")))]
compile_error!("task-api needs a broker: enable the `in-process` (default) or `amqp` feature");

use std::sync::Arc;
use tasksync_core::RecordStore;
use tasksync_core::broker::Connector;
use tasksync_runtime::EventPublisher;
use tasksync_runtime::metrics::MetricsRecorder;
use tasksync_task_service::{AppState, Config, build_router, init_tracing, seed, shutdown_signal};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();
    init_tracing();

    tracing::info!("Starting Task API...");

    let config = Config::from_env()?;
    tracing::info!(
        port = config.server.port,
        exchange = %config.broker.exchange,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let connector = connector(&config);

    let store = RecordStore::in_memory();
    seed(&store).await?;

    let publisher = Arc::new(EventPublisher::new(
        Arc::clone(&connector),
        config.broker.exchange.clone(),
    ));
    let reconnect = {
        let publisher = Arc::clone(&publisher);
        let interval = config.reconnect_delay();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { publisher.run_reconnect_loop(interval, shutdown).await })
    };

    let mut state = AppState::new(store, publisher);
    match MetricsRecorder::install() {
        Ok(recorder) => state = state.with_metrics(recorder),
        Err(error) => tracing::warn!(error = %error, "Metrics disabled"),
    }

    #[cfg(not(feature = "amqp"))]
    let workers = {
        use tasksync_task_service::consumers::{LoggingSink, Workers, dashboard_router};

        let workers = Workers::start(&connector, &config, Arc::new(LoggingSink), &shutdown_rx);
        state = state
            .with_component(workers.notification.clone())
            .with_component(workers.analytics.clone());

        let dashboard = tokio::net::TcpListener::bind((
            config.server.host.as_str(),
            config.server.analytics_port,
        ))
        .await?;
        tracing::info!(
            address = %dashboard.local_addr()?,
            "Analytics dashboard listening on /dashboard"
        );
        let router = dashboard_router(workers.analytics_state.clone());
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let server = axum::serve(dashboard, router).with_graceful_shutdown(async move {
                tasksync_runtime::shutdown_signalled(&mut shutdown).await;
            });
            if let Err(error) = server.await {
                tracing::error!(error = %error, "Dashboard server failed");
            }
        });

        workers
    };

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    tracing::info!(address = %listener.local_addr()?, "Task API listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down gracefully...");
    let _ = shutdown_tx.send(true);
    #[cfg(not(feature = "amqp"))]
    workers.join().await;
    if let Err(error) = reconnect.await {
        tracing::error!(error = %error, "Publisher reconnect task panicked");
    }
    Ok(())
}

#[cfg(feature = "amqp")]
fn connector(config: &Config) -> Arc<dyn Connector> {
    Arc::new(tasksync_amqp::AmqpConnector::new(config.broker.url.clone()))
}

#[cfg(not(feature = "amqp"))]
fn connector(_config: &Config) -> Arc<dyn Connector> {
    tracing::info!("Using the in-process broker");
    Arc::new(tasksync_testing::InMemoryBroker::new())
}
