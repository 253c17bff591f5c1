//! Analytics Worker
//!
//! Consumes checkout events from `analytics_queue`, keeps running totals and
//! serves them at `GET /dashboard` on `ANALYTICS_PORT`.
//!
//! # Usage
//!
//! ```bash
//! cargo run --features amqp --bin analytics-worker
//! curl http://localhost:3001/dashboard
//! ```

use std::sync::Arc;
use tasksync_amqp::AmqpConnector;
use tasksync_task_service::consumers::{self, AnalyticsState, dashboard_router};
use tasksync_task_service::{Config, init_tracing, shutdown_signal};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env()?;
    tracing::info!(
        exchange = %config.broker.exchange,
        queue = consumers::ANALYTICS_QUEUE,
        "Starting analytics worker"
    );

    let state = AnalyticsState::new();
    let connector = Arc::new(AmqpConnector::new(config.broker.url.clone()));
    let consumer = consumers::analytics_consumer(connector, &config, state.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind((
        config.server.host.as_str(),
        config.server.analytics_port,
    ))
    .await?;
    tracing::info!(address = %listener.local_addr()?, "Dashboard available at /dashboard");

    let mut dashboard_shutdown = shutdown_rx.clone();
    let dashboard = tokio::spawn(async move {
        axum::serve(listener, dashboard_router(state))
            .with_graceful_shutdown(async move {
                tasksync_runtime::shutdown_signalled(&mut dashboard_shutdown).await;
            })
            .await
    });

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(error) = consumer.run(shutdown_rx).await {
        dashboard.abort();
        return Err(error.into());
    }
    dashboard.await??;
    tracing::info!("Analytics worker stopped");
    Ok(())
}
